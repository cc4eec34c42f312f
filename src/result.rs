use std::fmt::Display;
use std::time::Duration;

/// The verdict a handler returns for the job it was given.
///
/// The set of verdicts is closed. There is no "leave it" variant: a
/// handler that wants the job re-delivered as-is returns
/// [`JobResult::retry`] with a zero delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The job is done; its row is deleted.
    Complete,
    /// Deliver the job again, no sooner than `delay` from now.
    Retry {
        /// How long the job stays invisible to workers.
        delay: Duration,
        /// Stored as the job's `last_error`, replacing any previous one.
        error: String,
    },
    /// Give up on the job and move it to the dead-letter table.
    MoveToDlq {
        /// Stored as the dead job's `last_error`.
        error: String,
    },
}

impl JobResult {
    /// The job finished successfully.
    pub fn complete() -> Self {
        Self::Complete
    }

    /// Schedule another delivery after `delay`.
    ///
    /// A zero delay means "as soon as a worker polls the queue again".
    pub fn retry(delay: Duration, error: impl Display) -> Self {
        Self::Retry {
            delay,
            error: error.to_string(),
        }
    }

    /// Stop retrying and park the job in the dead-letter table.
    pub fn move_to_dlq(error: impl Display) -> Self {
        Self::MoveToDlq {
            error: error.to_string(),
        }
    }
}
