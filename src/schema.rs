//! Database schema definitions for SQLx.
//!
//! Row types for the live job table (`pgjob_jobs`) and the dead-letter
//! table (`pgjob_dead_jobs`). All timestamps are integer seconds since
//! the Unix epoch and are written by the client, never by the database
//! clock.

use sqlx::FromRow;

/// A live job row in the queue.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier, producer-supplied or generated on enqueue.
    pub id: String,
    /// Name of the logical partition this job belongs to.
    pub queue: String,
    /// Name of the handler contract for this job.
    #[sqlx(rename = "type")]
    pub job_type: String,
    /// Opaque serialized input.
    pub arg: Vec<u8>,
    /// Number of deliveries to a handler. Incremented as part of the
    /// lease, so a handler always observes its own delivery counted in.
    pub attempt: i32,
    /// Most recent retry reason, if the job has ever been retried.
    pub last_error: Option<String>,
    /// Earliest wall time at which this row is eligible for dequeue.
    pub next_run_at: i64,
    /// Timestamp when the job was created.
    pub created_at: i64,
    /// Timestamp of the last state change.
    pub updated_at: i64,
}

/// A dead-letter row.
///
/// Same attribute set as [`Job`]; never leased automatically. A dead
/// job's id may reappear in the live table if an operator re-enqueues
/// it.
#[derive(Debug, Clone, FromRow)]
pub struct DeadJob {
    /// Identifier the job had in the live table.
    pub job_id: String,
    /// Queue the job belonged to.
    pub queue: String,
    /// Name of the handler contract for this job.
    #[sqlx(rename = "type")]
    pub job_type: String,
    /// Opaque serialized input.
    pub arg: Vec<u8>,
    /// Delivery count at the time the job was dead-lettered.
    pub attempt: i32,
    /// The error that sent the job here.
    pub last_error: Option<String>,
    /// Scheduled run time the job had when it died.
    pub next_run_at: i64,
    /// Creation timestamp of the original job.
    pub job_created_at: i64,
    /// Last state change of the original job.
    pub job_updated_at: i64,
}
