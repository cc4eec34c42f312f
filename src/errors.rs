/// Errors returned by [`Client`](crate::Client) operations.
///
/// `EmptyQueue` and `DuplicateId` are part of the API contract; callers
/// match on them to drive polling and idempotent-enqueue logic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No runnable job in the queue. Callers typically sleep and poll again.
    #[error("no runnable job in the queue")]
    EmptyQueue,

    /// Enqueue collided with an existing live job id.
    #[error("a job with this id already exists")]
    DuplicateId,

    /// The enqueue request failed validation.
    #[error("invalid enqueue request: {0}")]
    InvalidRequest(&'static str),

    /// No dead-letter row with the requested job id.
    #[error("dead job not found")]
    DeadJobNotFound,

    /// The job handler terminated abnormally. The transaction was rolled
    /// back, the attempt increment with it, and the job remains leasable.
    #[error("job handler panicked: {0}")]
    Handler(String),

    /// Applying the embedded migrations failed.
    #[error("database setup failed")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Any other database failure, surfaced unchanged so callers can
    /// decide whether to retry.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Maps a failed insert, distinguishing primary-key conflicts from
    /// other backend failures.
    pub(crate) fn from_insert(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::DuplicateId,
            _ => Error::Database(err),
        }
    }
}
