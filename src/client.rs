use crate::errors::Error;
use crate::result::JobResult;
use crate::schema::Job;
use crate::storage;
use crate::util::panic_message;
use futures_util::FutureExt;
use sqlx::PgPool;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, info_span, instrument, warn};

/// Source of wall-clock time, in seconds since the Unix epoch.
///
/// All visibility decisions (`next_run_at` computation and the lease
/// cutoff) read this clock rather than the database clock, so tests can
/// move time forward without sleeping.
pub trait Clock: Send + Sync {
    /// Current wall time in seconds since the Unix epoch.
    fn unix_now(&self) -> i64;
}

/// The default [`Clock`], backed by the system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Source of job identifiers for enqueue requests that do not carry one.
///
/// Implementations must produce values that are unique across the fleet
/// with overwhelming probability.
pub trait IdSource: Send + Sync {
    /// Produce a fresh identifier.
    fn generate(&self) -> String;
}

/// The default [`IdSource`]: 128 random bits as 32 lower-hex characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn generate(&self) -> String {
        format!("{:032x}", rand::random::<u128>())
    }
}

/// A request to add a job to a queue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    /// Job identifier. Left empty, the client generates one. Supplying
    /// your own makes enqueue idempotent: retrying the call after a
    /// network error cannot create a second job.
    pub id: Option<String>,
    /// Target queue. Must be non-empty.
    pub queue: String,
    /// Handler contract name. Must be non-empty.
    pub job_type: String,
    /// Opaque payload handed to the handler. May be empty.
    pub arg: Vec<u8>,
    /// How long the job stays invisible after enqueue.
    pub delay: Duration,
}

impl EnqueueRequest {
    /// A request targeting `queue` with handler contract `job_type`.
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    /// Use a producer-supplied identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a raw payload.
    pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.arg = arg.into();
        self
    }

    /// Attach a JSON-serialized payload.
    pub fn json_arg<T: serde::Serialize>(
        mut self,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        self.arg = serde_json::to_vec(payload)?;
        Ok(self)
    }

    /// Delay the first delivery.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Handle to the job queue. Cheap to clone and safe to share across
/// tasks; it holds no mutable state beyond the connection pool.
///
/// Each [`run_next`](Client::run_next) call borrows one pool connection
/// for the duration of its transaction, which includes the handler's
/// runtime. Size the pool to the number of concurrent workers.
#[derive(Clone)]
pub struct Client {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over `pool` with the system clock and random ids.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
        }
    }

    /// Replace the clock. Meant for tests.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the id source.
    pub fn with_id_source(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// The connection pool this client operates on.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Add a job to a queue.
    ///
    /// Returns the job's identifier, generated if the request did not
    /// carry one. Enqueueing an id that is already live fails with
    /// [`Error::DuplicateId`].
    #[instrument(name = "pgjob.enqueue", skip_all, fields(queue = %req.queue, job_type = %req.job_type))]
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<String, Error> {
        if req.queue.is_empty() {
            return Err(Error::InvalidRequest("queue must not be empty"));
        }
        if req.job_type.is_empty() {
            return Err(Error::InvalidRequest("job type must not be empty"));
        }

        let id = match req.id {
            Some(id) => id,
            None => self.ids.generate(),
        };
        let now = self.clock.unix_now();
        let job = Job {
            id,
            queue: req.queue,
            job_type: req.job_type,
            arg: req.arg,
            attempt: 0,
            last_error: None,
            next_run_at: now.saturating_add(as_secs_i64(req.delay)),
            created_at: now,
            updated_at: now,
        };

        storage::insert_job(&self.pool, &job)
            .await
            .map_err(Error::from_insert)?;

        Ok(job.id)
    }

    /// Lease the next runnable job in `queue`, run `handler` on it, and
    /// commit the verdict, all within one database transaction.
    ///
    /// The row stays exclusively locked while the handler runs; no other
    /// worker can observe the job until this call finishes. Returns
    /// [`Error::EmptyQueue`] when nothing in the queue is runnable.
    ///
    /// A handler panic rolls the transaction back, attempt increment
    /// included, and surfaces as [`Error::Handler`]; the job is
    /// immediately leasable again. Dropping the returned future (caller
    /// cancellation) rolls back the same way. Backend errors are
    /// returned after a single attempt; this method never retries
    /// internally.
    ///
    /// The handler receives the job value, not the transaction. A
    /// handler that needs its own database writes must use a separate
    /// connection and accept the at-least-once consequences.
    pub async fn run_next<F, Fut>(&self, queue: &str, handler: F) -> Result<(), Error>
    where
        F: FnOnce(Job) -> Fut,
        Fut: Future<Output = JobResult>,
    {
        let now = self.clock.unix_now();
        let mut tx = self.pool.begin().await?;

        let Some(job) = storage::lease_one(&mut tx, queue, now).await? else {
            tx.rollback().await?;
            return Err(Error::EmptyQueue);
        };

        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type, job.attempt = job.attempt);

        let outcome = AssertUnwindSafe(handler(job.clone()))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!("Job handler panicked: {message}");
                tx.rollback().await?;
                return Err(Error::Handler(message));
            }
        };

        match result {
            JobResult::Complete => {
                storage::delete_job(&mut tx, &job.id).await?;
            }
            JobResult::Retry { delay, error } => {
                let now = self.clock.unix_now();
                let next_run_at = now.saturating_add(as_secs_i64(delay));
                storage::reschedule_for_retry(&mut tx, &job.id, next_run_at, &error, now).await?;
            }
            JobResult::MoveToDlq { error } => {
                let now = self.clock.unix_now();
                storage::move_to_dead_letter(&mut tx, &job, &error, now).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Move a dead-letter row back into the live queue.
    ///
    /// The job gets a fresh delivery budget: `attempt` resets to 0 and
    /// the job becomes runnable immediately. `last_error` is kept so the
    /// reason it died stays visible. Fails with
    /// [`Error::DeadJobNotFound`] when no such dead job exists, and with
    /// [`Error::DuplicateId`] when a live job already uses the id.
    #[instrument(name = "pgjob.requeue_dead", skip_all, fields(job_id = %job_id))]
    pub async fn requeue_dead(&self, job_id: &str) -> Result<(), Error> {
        let now = self.clock.unix_now();
        let mut tx = self.pool.begin().await?;

        let moved = storage::requeue_dead(&mut tx, job_id, now)
            .await
            .map_err(Error::from_insert)?;
        if moved == 0 {
            tx.rollback().await?;
            return Err(Error::DeadJobNotFound);
        }

        tx.commit().await?;
        Ok(())
    }
}

fn as_secs_i64(delay: Duration) -> i64 {
    i64::try_from(delay.as_secs()).unwrap_or(i64::MAX)
}
