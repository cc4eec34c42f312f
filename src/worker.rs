use crate::client::Client;
use crate::errors::Error;
use crate::runner::BoxedHandler;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, trace};

pub(crate) struct Worker {
    pub(crate) client: Client,
    pub(crate) queue: String,
    pub(crate) handler: BoxedHandler,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl Worker {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Process jobs forever, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next().await {
                Ok(()) => {}
                Err(Error::EmptyQueue) if self.shutdown_when_queue_empty => {
                    debug!("No runnable jobs found. Shutting down the worker…");
                    break;
                }
                Err(Error::EmptyQueue) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No runnable jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Deliver the next job in the queue to this worker's handler.
    ///
    /// Handler faults come back as [`Error::Handler`]; the job stays
    /// leasable, so the loop above just logs and keeps polling.
    async fn run_next(&self) -> Result<(), Error> {
        let handler = &self.handler;
        self.client.run_next(&self.queue, |job| handler(job)).await
    }
}
