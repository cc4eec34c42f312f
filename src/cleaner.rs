use std::{collections::HashMap, marker::PhantomData, time::Duration};
use tracing::error;

use sqlx::PgPool;
use tokio::task::JoinSet;

use crate::runner::{Configured, Unconfigured};

/// How to clean up dead-letter entries
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CleanupPolicy {
    /// Keep all entries newer than `now - Duration`
    MaxAge(Duration),
    /// Keep at most n entries
    MaxCount(usize),
    /// Discard entries older than the `max_age` _and_ keep at most `max_count`
    Mixed {
        /// Maximum age of an entry to keep
        max_age: Duration,
        /// Maximum number of entries to keep
        max_count: usize,
    },
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::MaxAge(Duration::from_secs(7 * 24 * 3600))
    }
}

/// Configuration for cleaning up one queue's dead-letter entries
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CleanupConfiguration {
    /// Interval at which to run
    pub cleanup_every: Duration,
    /// How to go about cleaning the entries
    pub policy: CleanupPolicy,
}

impl Default for CleanupConfiguration {
    fn default() -> Self {
        Self {
            cleanup_every: Duration::from_secs(3600),
            policy: Default::default(),
        }
    }
}

/// The `DeadJobCleaner` spawns a task per configured queue that purges
/// old dead-letter rows on an interval.
/// Uses typestate to ensure you cannot start a cleaner that will do nothing
#[derive(Debug)]
pub struct DeadJobCleaner<State = Unconfigured> {
    configurations: HashMap<String, CleanupConfiguration>,
    _state: PhantomData<State>,
}

impl DeadJobCleaner {
    /// Create a new, unconfigured, `DeadJobCleaner`
    pub fn new() -> DeadJobCleaner<Unconfigured> {
        Self {
            configurations: HashMap::new(),
            _state: PhantomData,
        }
    }

    async fn spawn_cleaner(queue: String, config: CleanupConfiguration, pool: PgPool) {
        let mut ticker = tokio::time::interval(config.cleanup_every);

        loop {
            ticker.tick().await;

            let result = match config.policy {
                CleanupPolicy::MaxAge(max_age) => sqlx::query(
                    "DELETE FROM pgjob_dead_jobs WHERE queue = $1
                     AND job_updated_at < EXTRACT(EPOCH FROM NOW())::BIGINT - $2",
                )
                .bind(&queue)
                .bind(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX))
                .execute(&pool)
                .await,
                CleanupPolicy::MaxCount(0) => {
                    sqlx::query("DELETE FROM pgjob_dead_jobs WHERE queue = $1")
                        .bind(&queue)
                        .execute(&pool)
                        .await
                }
                CleanupPolicy::MaxCount(count) => {
                    sqlx::query(&format!(
                        r"DELETE FROM pgjob_dead_jobs WHERE queue = $1
                         AND job_updated_at < (SELECT job_updated_at FROM pgjob_dead_jobs WHERE queue = $1
                                               ORDER BY job_updated_at DESC OFFSET {offset} LIMIT 1)",
                        offset = count - 1
                    ))
                    .bind(&queue)
                    .execute(&pool)
                    .await
                }
                CleanupPolicy::Mixed { max_age, max_count } => {
                    sqlx::query(&format!(
                        r"DELETE FROM pgjob_dead_jobs WHERE queue = $1 AND
                      (job_updated_at < EXTRACT(EPOCH FROM NOW())::BIGINT - $2 OR
                       job_updated_at < (SELECT job_updated_at FROM pgjob_dead_jobs WHERE queue = $1
                                         ORDER BY job_updated_at DESC OFFSET {offset} LIMIT 1))",
                        offset = max_count.saturating_sub(1)
                    ))
                    .bind(&queue)
                    .bind(i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX))
                    .execute(&pool)
                    .await
                }
            };

            if let Err(e) = result {
                error!("Failed to clean dead jobs for {}: {}", queue, e);
                break;
            }
        }
    }
}

impl<State> DeadJobCleaner<State> {
    /// Configure the cleaner for a specific queue
    pub fn configure(
        mut self,
        queue: impl Into<String>,
        configuration: CleanupConfiguration,
    ) -> DeadJobCleaner<Configured> {
        self.configurations.insert(queue.into(), configuration);

        DeadJobCleaner {
            configurations: self.configurations,
            _state: PhantomData,
        }
    }
}

impl DeadJobCleaner<Configured> {
    /// Start the cleaner, spawning a `tokio::task::Task` for each configured queue
    /// Returns a `JoinSet` containing all spawned tasks for easy cancellation
    pub fn run(self, pool: &PgPool) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for (queue, config) in self.configurations {
            set.spawn(DeadJobCleaner::spawn_cleaner(queue, config, pool.clone()));
        }
        set
    }
}
