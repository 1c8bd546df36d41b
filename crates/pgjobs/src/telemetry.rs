//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Filtered by `RUST_LOG` (default `info`);
/// `PGJOBS_LOG_FORMAT=json` switches to JSON lines.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PGJOBS_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.with_target(false).try_init()
    };
}
