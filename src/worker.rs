use crate::job_runner::JobRunner;
use crate::table::QueueTable;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, trace};

pub(crate) struct Worker<Context> {
    pub(crate) job_runner: JobRunner<Context>,
    pub(crate) table: QueueTable,
    pub(crate) batch_size: usize,
    pub(crate) max_delay: Option<Duration>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run background jobs forever, or until the queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            let batch = self
                .job_runner
                .run(&self.table, self.batch_size, self.max_delay)
                .await;

            match batch {
                Ok(processed) if processed == self.batch_size && processed > 0 => {
                    trace!(processed, "Batch complete, claiming more jobs…");
                }
                Ok(processed) if self.shutdown_when_queue_empty => {
                    debug!(
                        processed,
                        "No pending background jobs found. Shutting down the worker…"
                    );
                    break;
                }
                Ok(processed) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!(
                        processed,
                        "No pending background jobs found. Polling again in {sleep_duration:?}…",
                    );
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_registry::JobRegistry;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn worker(poll_interval: Duration, jitter: Duration) -> Worker<()> {
        // Never connects; only the timing logic is exercised.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/rowqueue")
            .unwrap();
        Worker {
            job_runner: JobRunner::new(pool, Arc::new(JobRegistry::<()>::default()), ()),
            table: QueueTable::new("jobs").unwrap(),
            batch_size: 10,
            max_delay: None,
            shutdown_when_queue_empty: false,
            poll_interval,
            jitter,
        }
    }

    #[tokio::test]
    async fn jitter_stays_within_bounds() {
        let worker = worker(Duration::from_millis(100), Duration::from_millis(50));
        for _ in 0..100 {
            let duration = worker.sleep_duration_with_jitter();
            assert!(duration >= Duration::from_millis(100));
            assert!(duration <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn zero_jitter_uses_poll_interval() {
        let worker = worker(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(worker.sleep_duration_with_jitter(), Duration::from_secs(1));
    }
}
