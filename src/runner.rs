use crate::background_job::BackgroundJob;
use crate::job_registry::{Args, Callable, JobRegistry, Kwargs};
use crate::job_runner::JobRunner;
use crate::table::QueueTable;
use crate::worker::Worker;
use futures_util::future::join_all;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

/// How often an idle worker looks for new jobs, unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound of the random delay added to each poll, unless configured otherwise.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(100);
/// Jobs claimed per [`JobRunner::run`] call, unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// Supervises the workers of one or more queue tables.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: PgPool,
    job_registry: JobRegistry<Context>,
    queues: Vec<Queue>,
    context: Context,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_registry", &self.job_registry)
            .field("queues", &self.queues)
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            queues: Vec::new(),
            context,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Configure the workers processing `table`.
    ///
    /// Configuring the same table again replaces its previous configuration.
    pub fn configure_queue(
        mut self,
        table: QueueTable,
        config_fn: impl FnOnce(Queue) -> Queue,
    ) -> Runner<Context, Configured> {
        self.queues.retain(|queue| queue.table != table);
        self.queues.push(config_fn(Queue::new(table)));

        Runner {
            connection_pool: self.connection_pool,
            job_registry: self.job_registry,
            queues: self.queues,
            context: self.context,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Make a typed job available to all queues.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<J>();
        self
    }

    /// Make an async function available to all queues under `fn_name`.
    pub fn register_async<F, Fut>(mut self, fn_name: &str, f: F) -> Self
    where
        F: Fn(Context, Args, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.job_registry.register_async(fn_name, f);
        self
    }

    /// Make a blocking function available to all queues under `fn_name`.
    pub fn register_blocking<F>(mut self, fn_name: &str, f: F) -> Self
    where
        F: Fn(Context, Args, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.job_registry.register_blocking(fn_name, f);
        self
    }

    /// Make a prepared callable available to all queues under `fn_name`.
    pub fn register_callable(mut self, fn_name: &str, callable: Callable<Context>) -> Self {
        self.job_registry.insert(fn_name, callable);
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a `RunHandle` which can be used to wait for the workers to shutdown.
    pub fn start(&self) -> RunHandle {
        let job_runner = JobRunner::new(
            self.connection_pool.clone(),
            Arc::new(self.job_registry.clone()),
            self.context.clone(),
        );

        let mut handles = Vec::new();
        for queue in &self.queues {
            for i in 1..=queue.num_workers {
                let name = format!("background-worker-{}-{i}", queue.table);
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    job_runner: job_runner.clone(),
                    table: queue.table.clone(),
                    batch_size: queue.batch_size,
                    max_delay: queue.max_delay,
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

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }
}

/// Configuration of the workers processing one queue table
#[derive(Debug, Clone)]
pub struct Queue {
    table: QueueTable,
    num_workers: usize,
    batch_size: usize,
    max_delay: Option<Duration>,
    poll_interval: Duration,
    jitter: Duration,
}

impl Queue {
    fn new(table: QueueTable) -> Self {
        Self {
            table,
            num_workers: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            max_delay: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Set the number of concurrent workers for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how many jobs a worker claims before checking back with the supervisor loop.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Cap the retry backoff of failed jobs.
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}
