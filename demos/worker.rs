//! A worker process draining a queue table.
//!
//! Without `--database-url` a throwaway PostgreSQL container is started and
//! filled with sample jobs, some of which fail and get rescheduled.
//!
//! ```bash
//! cargo run --example worker -- --jobs 200 --workers 8
//! cargo run --example worker -- --database-url postgres://localhost/app --table jobs
//! ```

use anyhow::Result;
use clap::Parser;
use rand::Rng;
use rowqueue::{
    BackgroundJob, NewJob, QueueTable, Runner, failed_job_count, pending_job_count, setup_database,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Process jobs from a PostgreSQL queue table")]
struct Args {
    /// Connect to this database instead of starting a container
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Queue table, optionally schema-qualified
    #[arg(long, default_value = "jobs")]
    table: String,

    /// Concurrent workers
    #[arg(long, default_value_t = num_cpus::get())]
    workers: usize,

    /// Jobs claimed per batch
    #[arg(long, default_value_t = rowqueue::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Upper bound of the retry backoff, in seconds
    #[arg(long)]
    max_delay: Option<u64>,

    /// Sample jobs to enqueue before starting
    #[arg(long, default_value_t = 50)]
    jobs: usize,

    /// Keep polling after the queue has been drained
    #[arg(long)]
    keep_running: bool,

    /// Don't create the tables
    #[arg(long)]
    skip_db_setup: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReticulateSplineJob {
    spline: usize,
}

impl BackgroundJob for ReticulateSplineJob {
    const JOB_NAME: &'static str = "reticulate_spline";
    type Context = ();
    type Output = usize;

    async fn run(&self, _ctx: Self::Context) -> Result<usize> {
        let millis = rand::thread_rng().gen_range(10..200);
        tokio::time::sleep(Duration::from_millis(millis)).await;

        // Roughly one in ten attempts fails and is retried later
        if rand::thread_rng().gen_ratio(1, 10) {
            anyhow::bail!("spline {} refused to reticulate", self.spline);
        }
        Ok(self.spline * 2)
    }
}

fn checksum(_ctx: (), args: rowqueue::Args, _kwargs: rowqueue::Kwargs) -> Result<Value> {
    let rounds = args.first().and_then(Value::as_u64).unwrap_or(1_000);
    let sum = (0..rounds).fold(0u64, |acc, n| acc.wrapping_mul(31).wrapping_add(n));
    Ok(json!(sum))
}

async fn connect(args: &Args) -> Result<(PgPool, Option<ContainerAsync<Postgres>>)> {
    if let Some(url) = &args.database_url {
        info!("Connecting to database…");
        return Ok((PgPool::connect(url).await?, None));
    }

    info!("Starting PostgreSQL container…");
    let container = Postgres::default().start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    info!("Connecting to database at {}:{}…", host, port);
    let pool = PgPool::connect(&connection_string).await?;
    Ok((pool, Some(container)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,worker=info,rowqueue=info".into()),
        )
        .compact()
        .init();

    let args = Args::parse();
    let table = QueueTable::new(&args.table)?;
    let (pool, _container) = connect(&args).await?;

    if !args.skip_db_setup {
        setup_database(&pool, &table).await?;
    }

    let splines = (0..args.jobs)
        .map(|spline| ReticulateSplineJob { spline })
        .collect::<Vec<_>>();
    ReticulateSplineJob::enqueue_batch(&splines, &pool, &table).await?;
    for rounds in [10_000u64, 100_000, 1_000_000] {
        NewJob::new("checksum")
            .args(vec![json!(rounds)])
            .priority(-1)
            .enqueue(&pool, &table)
            .await?;
    }
    info!(
        pending = pending_job_count(&pool, &table).await?,
        "Enqueued sample jobs"
    );

    let mut runner = Runner::new(pool.clone(), ())
        .register::<ReticulateSplineJob>()
        .register_blocking("checksum", checksum)
        .configure_queue(table.clone(), |queue| {
            let queue = queue.num_workers(args.workers).batch_size(args.batch_size);
            match args.max_delay {
                Some(secs) => queue.max_delay(Duration::from_secs(secs)),
                None => queue,
            }
        });
    if !args.keep_running {
        runner = runner.shutdown_when_queue_empty();
    }

    runner.start().wait_for_shutdown().await;

    let failed = failed_job_count(&pool, &table).await?;
    if failed > 0 {
        warn!(failed, "Some jobs are waiting to be retried");
    }
    info!(
        pending = pending_job_count(&pool, &table).await?,
        "Workers shut down"
    );

    Ok(())
}
