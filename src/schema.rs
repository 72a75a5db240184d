//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the queue and error-log tables and
//! the DDL that creates them.

use crate::table::QueueTable;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

/// A row of a queue table: one unit of deferred work.
#[derive(Debug, Clone, FromRow)]
pub struct QueueRow {
    /// Unique identifier for the job
    pub id: i64,
    /// Name the callable is registered under
    pub fn_name: String,
    /// Positional arguments, a JSON array
    pub args: Value,
    /// Keyword arguments, a JSON object
    pub kwargs: Value,
    /// Claim order (lower runs sooner); incremented on every failure
    pub priority: i32,
    /// The row is not eligible before this time
    pub scheduled: Option<DateTime<Utc>>,
    /// Set once, on success; the row is terminal afterwards
    pub executed: Option<DateTime<Utc>>,
    /// Set externally to withdraw the row
    pub canceled: Option<DateTime<Utc>>,
    /// Output of the successful run
    pub result: Option<Value>,
    /// Message of the last failure
    pub reason: Option<String>,
    /// Duration of the last attempt, in seconds
    pub processed_time: Option<f64>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
}

/// One failed attempt, as recorded in the error-log table.
#[derive(Debug, Clone, FromRow)]
pub struct ErrorLogEntry {
    /// Unique identifier of the entry
    pub id: i64,
    /// The queue row this attempt belonged to
    pub job_id: i64,
    /// Snapshot of the row's `fn_name`
    pub fn_name: String,
    /// Snapshot of the row's `args`
    pub args: Value,
    /// Snapshot of the row's `kwargs`
    pub kwargs: Value,
    /// The error's `Debug` text: its message followed by the chain of causes.
    ///
    /// A backtrace is appended only when the error captured one, i.e. when
    /// `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE` is set for the worker. Panics
    /// carry just their message.
    pub message: String,
    /// Duration of the attempt, in seconds
    pub processed_time: f64,
    /// Timestamp when the attempt was recorded
    pub created_at: DateTime<Utc>,
}

pub(crate) const QUEUE_ROW_COLUMNS: &str = "id, fn_name, args, kwargs, priority, scheduled, executed, canceled, result, reason, processed_time, created_at";

/// Create the queue and error-log tables for `table` if they don't exist yet.
pub async fn setup_database(pool: &PgPool, table: &QueueTable) -> Result<(), sqlx::Error> {
    let queue = table.queue();
    let error_log = table.error_log();
    let index = format!(r#""{}_eligible_idx""#, index_prefix(table));

    let mut tx = pool.begin().await?;

    sqlx::query(&format!(
        r"
        CREATE TABLE IF NOT EXISTS {queue} (
            id BIGSERIAL PRIMARY KEY,
            fn_name TEXT NOT NULL,
            args JSONB NOT NULL DEFAULT '[]'::jsonb,
            kwargs JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            priority INTEGER NOT NULL DEFAULT 0,
            scheduled TIMESTAMPTZ,
            executed TIMESTAMPTZ,
            canceled TIMESTAMPTZ,
            result JSONB,
            reason TEXT,
            processed_time DOUBLE PRECISION,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "
    ))
    .execute(&mut *tx)
    .await?;

    // Backs the claim query; terminal and canceled rows drop out of it.
    sqlx::query(&format!(
        r"
        CREATE INDEX IF NOT EXISTS {index} ON {queue} (priority, id)
        WHERE executed IS NULL AND canceled IS NULL
        "
    ))
    .execute(&mut *tx)
    .await?;

    sqlx::query(&format!(
        r"
        CREATE TABLE IF NOT EXISTS {error_log} (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT NOT NULL,
            fn_name TEXT NOT NULL,
            args JSONB NOT NULL,
            kwargs JSONB NOT NULL,
            message TEXT NOT NULL,
            processed_time DOUBLE PRECISION NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "
    ))
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Index names are unqualified in PostgreSQL, so only the table part is used.
fn index_prefix(table: &QueueTable) -> &str {
    table
        .name()
        .rsplit_once('.')
        .map_or(table.name(), |(_, table)| table)
}
