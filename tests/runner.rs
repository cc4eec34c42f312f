#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_none, assert_ok, assert_some};
use pgjob::{
    CleanupConfiguration, CleanupPolicy, Client, Clock, DeadJobCleaner, EnqueueRequest, Error,
    JobResult, Runner,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        pgjob::setup_database(&pool).await?;

        Ok((pool, container))
    }
}

#[derive(Clone)]
struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    fn start_at(secs: i64) -> Self {
        Self(Arc::new(AtomicI64::new(secs)))
    }

    fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

async fn remaining_jobs(pool: &PgPool) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pgjob_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

async fn job_is_locked(id: &str, pool: &PgPool) -> anyhow::Result<bool> {
    let result = sqlx::query_scalar::<_, String>(
        "SELECT id FROM pgjob_jobs WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_none())
}

#[tokio::test]
async fn jobs_are_locked_while_their_handler_runs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    let job_started_barrier = Arc::new(Barrier::new(2));
    let assertions_finished_barrier = Arc::new(Barrier::new(2));

    let started = job_started_barrier.clone();
    let release = assertions_finished_barrier.clone();
    let runner = Runner::new(client.clone())
        .configure_queue("name", move |queue| {
            let started = started.clone();
            let release = release.clone();
            queue.num_workers(2).handle(move |_job| {
                let started = started.clone();
                let release = release.clone();
                async move {
                    started.wait().await;
                    release.wait().await;
                    JobResult::complete()
                }
            })
        })
        .shutdown_when_queue_empty();

    assert_ok!(
        client
            .enqueue(EnqueueRequest::new("name", "test").id("123"))
            .await
    );
    assert!(!job_is_locked("123", &pool).await?);

    let runner = runner.start();
    job_started_barrier.wait().await;

    assert!(job_is_locked("123", &pool).await?);
    let err = client
        .run_next("name", |_job| async { JobResult::complete() })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyQueue), "got {err:?}");

    assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    assert_eq!(remaining_jobs(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn the_runner_drains_its_queues_and_shuts_down() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    for i in 0..5 {
        assert_ok!(
            client
                .enqueue(EnqueueRequest::new("name", "test").id(format!("job-{i}")))
                .await
        );
    }
    assert_eq!(remaining_jobs(&pool).await?, 5);

    let runner = Runner::new(client)
        .configure_queue("name", |queue| {
            queue
                .num_workers(2)
                .poll_interval(Duration::from_millis(10))
                .handle(|_job| async { JobResult::complete() })
        })
        .shutdown_when_queue_empty()
        .start();
    runner.wait_for_shutdown().await;

    assert_eq!(remaining_jobs(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn a_worker_survives_a_handler_fault() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    assert_ok!(
        client
            .enqueue(EnqueueRequest::new("name", "test").id("123"))
            .await
    );

    let runs = Arc::new(AtomicU8::new(0));
    let attempts_seen = Arc::new(AtomicU8::new(0));

    let runs_in_handler = runs.clone();
    let attempts_in_handler = attempts_seen.clone();
    let runner = Runner::new(client)
        .configure_queue("name", move |queue| {
            let runs = runs_in_handler.clone();
            let attempts = attempts_in_handler.clone();
            queue
                .poll_interval(Duration::from_millis(10))
                .jitter(Duration::from_millis(5))
                .handle(move |job| {
                    let runs = runs.clone();
                    let attempts = attempts.clone();
                    async move {
                        if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("first delivery fails")
                        }
                        attempts.store(u8::try_from(job.attempt).unwrap(), Ordering::SeqCst);
                        JobResult::complete()
                    }
                })
        })
        .shutdown_when_queue_empty()
        .start();
    runner.wait_for_shutdown().await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    // The panicked delivery rolled back, so the successful one was
    // still the first counted attempt.
    assert_eq!(attempts_seen.load(Ordering::SeqCst), 1);
    assert_eq!(remaining_jobs(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn a_worker_retries_and_dead_letters_per_the_handler_verdicts() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    assert_ok!(
        client
            .enqueue(EnqueueRequest::new("name", "test").id("123"))
            .await
    );

    let runner = Runner::new(client)
        .configure_queue("name", |queue| {
            queue
                .poll_interval(Duration::from_millis(10))
                .handle(|job| async move {
                    if job.attempt == 1 {
                        JobResult::retry(Duration::ZERO, "first failure")
                    } else {
                        JobResult::move_to_dlq("gave up")
                    }
                })
        })
        .shutdown_when_queue_empty()
        .start();
    runner.wait_for_shutdown().await;

    assert_eq!(remaining_jobs(&pool).await?, 0);

    let dead = pgjob::list_dead_jobs(&pool, Some("name"), None).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, "123");
    assert_eq!(dead[0].attempt, 2);
    assert_eq!(dead[0].last_error.as_deref(), Some("gave up"));

    Ok(())
}

async fn dead_letter_fixture(
    client: &Client,
    clock: &ManualClock,
    queue: &str,
    ids: &[&str],
) -> anyhow::Result<()> {
    for id in ids {
        assert_ok!(
            client
                .enqueue(EnqueueRequest::new(queue, "test").id(*id))
                .await
        );
        assert_ok!(
            client
                .run_next(queue, |_job| async { JobResult::move_to_dlq("test error") })
                .await
        );
        // Distinct dead-letter timestamps so count-based cleanup has a
        // total order to cut on.
        clock.advance(10);
    }
    Ok(())
}

#[tokio::test]
async fn the_cleaner_keeps_only_the_newest_dead_jobs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let clock = ManualClock::start_at(1_000);
    let client = Client::new(pool.clone()).with_clock(clock.clone());

    dead_letter_fixture(&client, &clock, "reports", &["d1", "d2", "d3"]).await?;
    assert_eq!(pgjob::dead_job_count(&pool).await?, 3);

    let mut cleaners = DeadJobCleaner::new()
        .configure(
            "reports",
            CleanupConfiguration {
                cleanup_every: Duration::from_millis(50),
                policy: CleanupPolicy::MaxCount(1),
            },
        )
        .run(&pool);

    tokio::time::sleep(Duration::from_millis(300)).await;
    cleaners.abort_all();

    assert_eq!(pgjob::dead_job_count(&pool).await?, 1);
    let survivors = pgjob::list_dead_jobs(&pool, Some("reports"), None).await?;
    assert_eq!(survivors[0].job_id, "d3");

    Ok(())
}

#[tokio::test]
async fn the_cleaner_purges_dead_jobs_past_their_max_age() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    // Epoch-adjacent timestamps make every dead row ancient relative to
    // the database's wall clock.
    let clock = ManualClock::start_at(1_000);
    let client = Client::new(pool.clone()).with_clock(clock.clone());

    dead_letter_fixture(&client, &clock, "reports", &["d1", "d2"]).await?;

    let untouched = "emails";
    dead_letter_fixture(&client, &clock, untouched, &["d3"]).await?;

    let mut cleaners = DeadJobCleaner::new()
        .configure(
            "reports",
            CleanupConfiguration {
                cleanup_every: Duration::from_millis(50),
                policy: CleanupPolicy::MaxAge(Duration::from_secs(3600)),
            },
        )
        .run(&pool);

    tokio::time::sleep(Duration::from_millis(300)).await;
    cleaners.abort_all();

    // Only the configured queue is cleaned.
    assert_none!(
        pgjob::list_dead_jobs(&pool, Some("reports"), None)
            .await?
            .first()
            .cloned()
    );
    let remaining = pgjob::list_dead_jobs(&pool, Some(untouched), None).await?;
    assert_some!(remaining.first());

    Ok(())
}
