use crate::errors::Error;
use crate::schema::{DeadJob, Job};
use sqlx::{PgPool, Postgres, Transaction};

/// Creates the job tables by applying the crate's embedded migrations.
///
/// Safe to call on every startup; already-applied migrations are
/// skipped. Operators who manage schema out of band can apply the SQL
/// under `migrations/` instead.
pub async fn setup_database(pool: &PgPool) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Writes a freshly-validated job row. Fails with a unique violation if
/// the id is already live.
pub(crate) async fn insert_job(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO pgjob_jobs (id, queue, type, arg, attempt, last_error, next_run_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ",
    )
    .bind(&job.id)
    .bind(&job.queue)
    .bind(&job.job_type)
    .bind(&job.arg)
    .bind(job.attempt)
    .bind(&job.last_error)
    .bind(job.next_run_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Locks and returns the next runnable job in `queue`, incrementing its
/// attempt counter in the same statement.
///
/// Rows locked by concurrent transactions are skipped. The lock and the
/// increment share one round-trip so that rolling the surrounding
/// transaction back also rolls the increment back; `attempt` therefore
/// counts committed deliveries only. Eligible rows are taken in
/// `(next_run_at, created_at)` order, which keeps selection stable
/// under contention without promising FIFO.
pub(crate) async fn lease_one(
    tx: &mut Transaction<'_, Postgres>,
    queue: &str,
    now: i64,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r"
        UPDATE pgjob_jobs
        SET attempt = attempt + 1, updated_at = $3
        WHERE id = (
            SELECT id
            FROM pgjob_jobs
            WHERE queue = $1
              AND next_run_at <= $2
            ORDER BY next_run_at, created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, queue, type, arg, attempt, last_error, next_run_at, created_at, updated_at
        ",
    )
    .bind(queue)
    .bind(now)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await
}

/// Deletes a job. Finalizes completions and dead-letter moves.
pub(crate) async fn delete_job(
    tx: &mut Transaction<'_, Postgres>,
    id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM pgjob_jobs WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Schedules another delivery for a job that asked to be retried.
///
/// Overwrites `last_error` with the latest reason; never touches
/// `attempt`.
pub(crate) async fn reschedule_for_retry(
    tx: &mut Transaction<'_, Postgres>,
    id: &str,
    next_run_at: i64,
    last_error: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE pgjob_jobs SET next_run_at = $2, last_error = $3, updated_at = $4 WHERE id = $1")
        .bind(id)
        .bind(next_run_at)
        .bind(last_error)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Moves a leased job to the dead-letter table.
///
/// The dead row carries the job's current values (including the
/// incremented attempt) with `last_error` overridden. Insert and delete
/// both run in the caller's transaction.
pub(crate) async fn move_to_dead_letter(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    last_error: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO pgjob_dead_jobs (job_id, queue, type, arg, attempt, last_error, next_run_at, job_created_at, job_updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ",
    )
    .bind(&job.id)
    .bind(&job.queue)
    .bind(&job.job_type)
    .bind(&job.arg)
    .bind(job.attempt)
    .bind(last_error)
    .bind(job.next_run_at)
    .bind(job.created_at)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    delete_job(tx, &job.id).await
}

/// Moves a dead-letter row back into the live table with a fresh
/// delivery budget.
///
/// Returns the number of rows moved (0 when no such dead job exists).
/// `last_error` travels with the job as the reason it died.
pub(crate) async fn requeue_dead(
    tx: &mut Transaction<'_, Postgres>,
    job_id: &str,
    now: i64,
) -> Result<u64, sqlx::Error> {
    let inserted = sqlx::query(
        r"
        INSERT INTO pgjob_jobs (id, queue, type, arg, attempt, last_error, next_run_at, created_at, updated_at)
        SELECT job_id, queue, type, arg, 0, last_error, $2, job_created_at, $2
        FROM pgjob_dead_jobs
        WHERE job_id = $1
        ",
    )
    .bind(job_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    if inserted.rows_affected() > 0 {
        sqlx::query("DELETE FROM pgjob_dead_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(inserted.rows_affected())
}

/// The number of jobs in the dead-letter table.
pub async fn dead_job_count(pool: &PgPool) -> Result<i64, Error> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pgjob_dead_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Lists dead-letter jobs, newest first, optionally restricted to one
/// queue.
pub async fn list_dead_jobs(
    pool: &PgPool,
    queue: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<DeadJob>, Error> {
    let mut query = "SELECT job_id, queue, type, arg, attempt, last_error, next_run_at, job_created_at, job_updated_at FROM pgjob_dead_jobs".to_string();

    if queue.is_some() {
        query.push_str(" WHERE queue = $1");
    }

    query.push_str(" ORDER BY job_updated_at DESC");

    if limit.is_some() {
        if queue.is_some() {
            query.push_str(" LIMIT $2");
        } else {
            query.push_str(" LIMIT $1");
        }
    }

    let mut query_builder = sqlx::query_as::<_, DeadJob>(&query);

    if let Some(queue_val) = queue {
        query_builder = query_builder.bind(queue_val);
    }

    if let Some(limit_val) = limit {
        query_builder = query_builder.bind(limit_val);
    }

    Ok(query_builder.fetch_all(pool).await?)
}
