use crate::client::Client;
use crate::result::JobResult;
use crate::schema::Job;
use crate::worker::Worker;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

pub(crate) type BoxedHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, JobResult> + Send + Sync>;

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// Spawns and supervises the polling workers for a set of queues.
///
/// All queue semantics live in [`Client::run_next`]; a worker merely
/// repeats that call, sleeping between polls when its queue is empty.
pub struct Runner<State = Unconfigured> {
    client: Client,
    queues: HashMap<String, Queue<Configured>>,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<State: std::fmt::Debug> std::fmt::Debug for Runner<State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl Runner {
    /// Create a new runner over the given client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            queues: HashMap::new(),
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<State> Runner<State> {
    /// Configure a queue. The configuration closure must attach a
    /// handler via [`Queue::handle`] before the runner can start.
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue) -> Queue<Configured>,
    ) -> Runner<Configured> {
        self.queues
            .insert(queue_name.into(), config_fn(Queue::default()));

        Runner {
            client: self.client,
            queues: self.queues,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Shut the workers down once their queues are empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }
}

impl Runner<Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the
    /// workers to shut down.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for (queue_name, queue) in &self.queues {
            let Some(handler) = &queue.handler else {
                continue;
            };
            for i in 1..=queue.num_workers {
                let name = format!("pgjob-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    client: self.client.clone(),
                    queue: queue_name.clone(),
                    handler: handler.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        RunHandle { handles }
    }
}

/// Handle to a running set of workers.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });
    }
}

/// Configuration for one queue's workers.
pub struct Queue<State = Unconfigured> {
    handler: Option<BoxedHandler>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    _state: PhantomData<State>,
}

impl<State> std::fmt::Debug for Queue<State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for Queue<Unconfigured> {
    fn default() -> Self {
        Self {
            handler: None,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            _state: PhantomData,
        }
    }
}

impl<State> Queue<State> {
    /// Set the number of workers polling this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied
    /// will be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attach the handler every job in this queue is delivered to.
    ///
    /// Handlers that serve several job types dispatch on
    /// [`Job::job_type`] themselves.
    pub fn handle<F, Fut>(self, handler: F) -> Queue<Configured>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        Queue {
            handler: Some(Arc::new(move |job| handler(job).boxed())),
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            _state: PhantomData,
        }
    }
}
