#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cleaner;
mod client;
mod errors;
mod result;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// Dead-letter maintenance: periodic purge of old dead jobs.
pub use self::cleaner::{CleanupConfiguration, CleanupPolicy, DeadJobCleaner};
/// The queue client and its injection points.
pub use self::client::{Client, Clock, EnqueueRequest, IdSource, RandomIds, SystemClock};
/// Error type for all queue operations.
pub use self::errors::Error;
/// The closed handler verdict protocol.
pub use self::result::JobResult;
/// Polling workers that repeat the core dequeue-execute-commit call.
pub use self::runner::{Configured, Queue, RunHandle, Runner, Unconfigured};
/// Row types.
pub use self::schema::{DeadJob, Job};
/// Schema bootstrap and dead-letter inspection helpers.
pub use self::storage::{dead_job_count, list_dead_jobs, setup_database};
