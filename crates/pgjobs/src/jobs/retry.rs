use rand::Rng;
use std::time::Duration;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(15 * 60),
            jitter_pct: 0.20,
        }
    }
}

/// How long a failed job waits before it becomes eligible again.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    Fixed(Duration),
    Exponential(BackoffConfig),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    /// Delay after the failure of attempt number `attempt_no` (1-based).
    pub fn delay_for(&self, attempt_no: i32) -> Duration {
        self.delay_with_rng(attempt_no, &mut rand::thread_rng())
    }

    pub fn delay_with_rng(&self, attempt_no: i32, rng: &mut impl Rng) -> Duration {
        match self {
            RetryPolicy::Fixed(delay) => *delay,
            RetryPolicy::Exponential(cfg) => next_delay(attempt_no, cfg, rng),
        }
    }
}

pub fn next_delay(attempt_no: i32, cfg: &BackoffConfig, rng: &mut impl Rng) -> Duration {
    let attempt_no = attempt_no.max(1) as u32;
    let max_ms = u64::try_from(cfg.max.as_millis()).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(cfg.base.as_millis()).unwrap_or(u64::MAX);

    // base * 2^(attempt_no-1), saturating; the cap handles huge exponents
    let pow2 = 1_u64.checked_shl(attempt_no - 1).unwrap_or(u64::MAX);
    let delay = base_ms.saturating_mul(pow2).min(max_ms);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = delay as f64 * cfg.jitter_pct.clamp(0.0, 1.0);
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(max_ms))
}
