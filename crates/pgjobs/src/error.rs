use uuid::Uuid;

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The id does not name a job. Callers only ever pass ids they got from
    /// the queue, so this is a contract violation rather than a runtime case.
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("invalid job status in store: {0:?}")]
    InvalidStatus(String),

    #[error("invalid enqueue options: {0}")]
    InvalidOptions(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
