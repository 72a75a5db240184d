#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Retry backoff derived from a job's priority.
pub mod backoff;
mod background_job;
mod errors;
mod job;
mod job_registry;
mod job_runner;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod table;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, NewJob};
/// Error types of the queue.
pub use self::errors::{EnqueueError, InvalidTableName, ResolutionError};
/// A claimed job and its outcome.
pub use self::job::{Job, JobOutcome};
/// Resolving job names to code.
pub use self::job_registry::{Args, Callable, CallableRegistry, JobRegistry, Kwargs};
/// The claim-execute loop.
pub use self::job_runner::{JobRunner, ProcessedJob};
/// The main runner that orchestrates job processing.
pub use self::runner::{
    Configured, DEFAULT_BATCH_SIZE, DEFAULT_JITTER, DEFAULT_POLL_INTERVAL, Queue, RunHandle,
    Runner, Unconfigured,
};
pub use self::schema::setup_database;
/// Queue operations outside the claim loop.
pub use self::storage::{
    cancel_job, claim_next_job, error_log_for_job, failed_job_count, get_job, pending_job_count,
};
/// Queue table names.
pub use self::table::QueueTable;
