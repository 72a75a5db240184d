use crate::errors::EnqueueError;
use crate::job_registry::{Args, Kwargs};
use crate::table::QueueTable;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use tracing::instrument;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
///
/// The job value itself is stored as the row's single positional argument.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the task. Lower values are claimed first.
    const PRIORITY: i32 = 0;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already an unstarted
    /// job with the same data.
    const DEDUPLICATED: bool = false;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Stored in the row's `result` column on success.
    type Output: Serialize + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID if successfully enqueued, or None if deduplicated.
    #[instrument(name = "rowqueue.enqueue", skip(self, pool), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(
        &'a self,
        pool: &'a PgPool,
        table: &'a QueueTable,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let job = match self.to_new_job() {
            Ok(job) => job,
            Err(err) => return async move { Err(err) }.boxed(),
        };
        async move { job.enqueue(pool, table).await }.boxed()
    }

    /// Enqueue several jobs in one transaction.
    ///
    /// Returns one entry per job, `None` where the job was deduplicated
    /// (including against an earlier job of the same batch).
    #[instrument(name = "rowqueue.enqueue_batch", skip(jobs, pool), fields(message = Self::JOB_NAME, count = jobs.len()))]
    fn enqueue_batch<'a>(
        jobs: &'a [Self],
        pool: &'a PgPool,
        table: &'a QueueTable,
    ) -> BoxFuture<'a, Result<Vec<Option<i64>>, EnqueueError>> {
        let new_jobs = match jobs.iter().map(Self::to_new_job).collect::<Result<Vec<_>, _>>() {
            Ok(new_jobs) => new_jobs,
            Err(err) => return async move { Err(err) }.boxed(),
        };

        async move {
            let mut tx = pool.begin().await?;
            let mut ids = Vec::with_capacity(new_jobs.len());
            for job in &new_jobs {
                ids.push(job.insert(&mut *tx, table).await?);
            }
            tx.commit().await?;
            Ok(ids)
        }
        .boxed()
    }

    /// The queue row this job is stored as.
    fn to_new_job(&self) -> Result<NewJob, EnqueueError> {
        let data = serde_json::to_value(self)?;
        Ok(NewJob::new(Self::JOB_NAME)
            .args(vec![data])
            .priority(Self::PRIORITY)
            .deduplicated(Self::DEDUPLICATED))
    }
}

/// A queue row about to be inserted by a producer.
#[derive(Debug, Clone)]
pub struct NewJob {
    fn_name: String,
    args: Args,
    kwargs: Kwargs,
    priority: i32,
    scheduled: Option<DateTime<Utc>>,
    deduplicated: bool,
}

impl NewJob {
    /// A job calling `fn_name` with no arguments, priority 0, eligible immediately.
    pub fn new(fn_name: impl Into<String>) -> Self {
        Self {
            fn_name: fn_name.into(),
            args: Args::new(),
            kwargs: Kwargs::new(),
            priority: 0,
            scheduled: None,
            deduplicated: false,
        }
    }

    /// Set the positional arguments.
    pub fn args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    /// Set the keyword arguments.
    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Set the claim priority. Lower values are claimed first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Keep the job ineligible until `at`.
    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled = Some(at);
        self
    }

    /// Skip the insert when an identical job is still waiting to run.
    pub fn deduplicated(mut self, deduplicated: bool) -> Self {
        self.deduplicated = deduplicated;
        self
    }

    /// Insert the job.
    ///
    /// Returns the job ID if successfully enqueued, or None if deduplicated.
    #[instrument(name = "rowqueue.enqueue", skip_all, fields(message = %self.fn_name, table = %table))]
    pub async fn enqueue(&self, pool: &PgPool, table: &QueueTable) -> Result<Option<i64>, EnqueueError> {
        let mut conn = pool.acquire().await?;
        self.insert(&mut conn, table).await
    }

    async fn insert(
        &self,
        conn: &mut sqlx::PgConnection,
        table: &QueueTable,
    ) -> Result<Option<i64>, EnqueueError> {
        let args = Value::Array(self.args.clone());
        let kwargs = Value::Object(self.kwargs.clone());
        if self.deduplicated {
            enqueue_deduplicated(conn, table, self, args, kwargs).await
        } else {
            Ok(Some(enqueue_simple(conn, table, self, args, kwargs).await?))
        }
    }
}

async fn enqueue_deduplicated(
    conn: &mut sqlx::PgConnection,
    table: &QueueTable,
    job: &NewJob,
    args: Value,
    kwargs: Value,
) -> Result<Option<i64>, EnqueueError> {
    // Running (locked) jobs don't count as duplicates
    let sql = format!(
        r"
        INSERT INTO {queue} (fn_name, args, kwargs, priority, scheduled)
        SELECT $1, $2, $3, $4, $5
        WHERE NOT EXISTS (
            SELECT 1 FROM {queue}
            WHERE fn_name = $1 AND args = $2 AND kwargs = $3
              AND executed IS NULL AND canceled IS NULL
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id
        ",
        queue = table.queue(),
    );

    let result = sqlx::query_scalar::<_, i64>(&sql)
        .bind(&job.fn_name)
        .bind(args)
        .bind(kwargs)
        .bind(job.priority)
        .bind(job.scheduled)
        .fetch_optional(conn)
        .await?;

    Ok(result)
}

async fn enqueue_simple(
    conn: &mut sqlx::PgConnection,
    table: &QueueTable,
    job: &NewJob,
    args: Value,
    kwargs: Value,
) -> Result<i64, EnqueueError> {
    let sql = format!(
        "INSERT INTO {} (fn_name, args, kwargs, priority, scheduled) VALUES ($1, $2, $3, $4, $5) RETURNING id",
        table.queue(),
    );

    let id = sqlx::query_scalar::<_, i64>(&sql)
        .bind(&job.fn_name)
        .bind(args)
        .bind(kwargs)
        .bind(job.priority)
        .bind(job.scheduled)
        .fetch_one(conn)
        .await?;

    Ok(id)
}
