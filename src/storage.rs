use crate::schema::{ErrorLogEntry, QUEUE_ROW_COLUMNS, QueueRow};
use crate::table::QueueTable;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;

/// Finds the next eligible job and locks it for the rest of the transaction.
///
/// Rows locked by other transactions are skipped instead of waited on, so
/// concurrent workers never block each other or claim the same row.
pub async fn claim_next_job(
    conn: &mut PgConnection,
    table: &QueueTable,
) -> Result<Option<QueueRow>, sqlx::Error> {
    let sql = format!(
        r"
        SELECT {QUEUE_ROW_COLUMNS}
        FROM {queue}
        WHERE executed IS NULL
          AND canceled IS NULL
          AND (scheduled IS NULL OR scheduled < NOW())
        ORDER BY priority ASC, id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        ",
        queue = table.queue(),
    );

    sqlx::query_as::<_, QueueRow>(&sql)
        .fetch_optional(conn)
        .await
}

/// Moves a job into its terminal state.
pub(crate) async fn mark_executed(
    conn: &mut PgConnection,
    table: &QueueTable,
    job_id: i64,
    result: Value,
    processed_time: f64,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        r"
        UPDATE {queue}
        SET result = $2, executed = clock_timestamp(), processed_time = $3, reason = NULL
        WHERE id = $1
        ",
        queue = table.queue(),
    );

    sqlx::query(&sql)
        .bind(job_id)
        .bind(result)
        .bind(processed_time)
        .execute(conn)
        .await?;
    Ok(())
}

/// Marks that we just tried and failed to run a job, deferring it by `delay`.
pub(crate) async fn reschedule_failed_job(
    conn: &mut PgConnection,
    table: &QueueTable,
    job_id: i64,
    priority: i32,
    delay: Duration,
    reason: &str,
    processed_time: f64,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        r"
        UPDATE {queue}
        SET scheduled = clock_timestamp() + $2 * INTERVAL '1 second',
            priority = $3,
            reason = $4,
            processed_time = $5
        WHERE id = $1
        ",
        queue = table.queue(),
    );

    sqlx::query(&sql)
        .bind(job_id)
        .bind(delay.as_secs_f64())
        .bind(priority)
        .bind(reason)
        .bind(processed_time)
        .execute(conn)
        .await?;
    Ok(())
}

/// Appends one failed attempt to the error log. Entries are never updated or deleted.
pub(crate) async fn append_error_log(
    conn: &mut PgConnection,
    table: &QueueTable,
    job: &QueueRow,
    message: &str,
    processed_time: f64,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        r"
        INSERT INTO {error_log} (job_id, fn_name, args, kwargs, message, processed_time)
        VALUES ($1, $2, $3, $4, $5, $6)
        ",
        error_log = table.error_log(),
    );

    sqlx::query(&sql)
        .bind(job.id)
        .bind(&job.fn_name)
        .bind(&job.args)
        .bind(&job.kwargs)
        .bind(message)
        .bind(processed_time)
        .execute(conn)
        .await?;
    Ok(())
}

/// Withdraws a job that hasn't run yet.
///
/// Waits for a worker currently running the job to finish. Returns whether
/// the job was canceled; executed and already canceled jobs are left alone.
pub async fn cancel_job(pool: &PgPool, table: &QueueTable, job_id: i64) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET canceled = NOW() WHERE id = $1 AND executed IS NULL AND canceled IS NULL",
        table.queue(),
    );

    let result = sqlx::query(&sql).bind(job_id).execute(pool).await?;
    Ok(result.rows_affected() == 1)
}

/// Loads a job without locking it.
pub async fn get_job(
    pool: &PgPool,
    table: &QueueTable,
    job_id: i64,
) -> Result<Option<QueueRow>, sqlx::Error> {
    let sql = format!(
        "SELECT {QUEUE_ROW_COLUMNS} FROM {} WHERE id = $1",
        table.queue(),
    );

    sqlx::query_as::<_, QueueRow>(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// All failed attempts of a job, oldest first.
pub async fn error_log_for_job(
    pool: &PgPool,
    table: &QueueTable,
    job_id: i64,
) -> Result<Vec<ErrorLogEntry>, sqlx::Error> {
    let sql = format!(
        r"
        SELECT id, job_id, fn_name, args, kwargs, message, processed_time, created_at
        FROM {}
        WHERE job_id = $1
        ORDER BY id ASC
        ",
        table.error_log(),
    );

    sqlx::query_as::<_, ErrorLogEntry>(&sql)
        .bind(job_id)
        .fetch_all(pool)
        .await
}

/// The number of jobs that could be claimed right now
pub async fn pending_job_count(pool: &PgPool, table: &QueueTable) -> Result<i64, sqlx::Error> {
    let sql = format!(
        r"
        SELECT COUNT(*) FROM {}
        WHERE executed IS NULL
          AND canceled IS NULL
          AND (scheduled IS NULL OR scheduled < NOW())
        ",
        table.queue(),
    );

    sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await
}

/// The number of jobs that have failed at least once and haven't succeeded since
pub async fn failed_job_count(pool: &PgPool, table: &QueueTable) -> Result<i64, sqlx::Error> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE executed IS NULL AND reason IS NOT NULL",
        table.queue(),
    );

    sqlx::query_scalar::<_, i64>(&sql).fetch_one(pool).await
}
