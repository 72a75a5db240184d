use crate::job::{Job, JobOutcome};
use crate::job_registry::CallableRegistry;
use crate::storage;
use crate::table::QueueTable;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, info_span, trace};

/// A job processed by one claim cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessedJob {
    /// ID of the claimed row
    pub id: i64,
    /// What happened to it
    pub outcome: JobOutcome,
}

/// Claims and runs jobs from a queue table, one transaction per job.
pub struct JobRunner<Context> {
    connection_pool: PgPool,
    registry: Arc<dyn CallableRegistry<Context>>,
    context: Context,
}

impl<Context: Clone> Clone for JobRunner<Context> {
    fn clone(&self) -> Self {
        Self {
            connection_pool: self.connection_pool.clone(),
            registry: self.registry.clone(),
            context: self.context.clone(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRunner<Context> {
    /// Create a job runner that resolves `fn_name`s through `registry`.
    pub fn new(
        connection_pool: PgPool,
        registry: Arc<dyn CallableRegistry<Context>>,
        context: Context,
    ) -> Self {
        Self {
            connection_pool,
            registry,
            context,
        }
    }

    /// Run up to `batch_limit` jobs from `table`, stopping early once no
    /// eligible job is left.
    ///
    /// Returns how many jobs were processed. A storage error ends the batch;
    /// the job being processed is rolled back and stays eligible.
    pub async fn run(
        &self,
        table: &QueueTable,
        batch_limit: usize,
        max_delay: Option<Duration>,
    ) -> Result<usize, sqlx::Error> {
        for processed in 0..batch_limit {
            if self.run_next_job(table, max_delay).await?.is_none() {
                return Ok(processed);
            }
        }
        Ok(batch_limit)
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if the database failed; nothing of the cycle is committed
    pub async fn run_next_job(
        &self,
        table: &QueueTable,
        max_delay: Option<Duration>,
    ) -> Result<Option<ProcessedJob>, sqlx::Error> {
        trace!("Looking for next background job…");

        // The transaction holds the job lock during execution
        let mut tx = self.connection_pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        let Some(row) = storage::claim_next_job(&mut tx, table).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let id = row.id;
        let span = info_span!("job", job.id = %id, job.fn_name = %row.fn_name);

        let outcome = async {
            debug!("Running job…");
            Job::new(&mut tx, table, row, max_delay)
                .execute(&*self.registry, self.context.clone())
                .await
        }
        .instrument(span.clone())
        .await?;

        tx.commit().instrument(span).await?;

        Ok(Some(ProcessedJob { id, outcome }))
    }
}
