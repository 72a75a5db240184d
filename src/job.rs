use crate::backoff;
use crate::job_registry::{Args, CallableRegistry, Kwargs};
use crate::schema::QueueRow;
use crate::storage;
use crate::table::QueueTable;
use crate::util::with_sentry_transaction;
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sentry_core::{Hub, SentryFutureExt};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What happened to a claimed job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobOutcome {
    /// The job ran to completion and is now terminal.
    Succeeded,
    /// The job failed and was deferred.
    Failed {
        /// How long until the job becomes eligible again.
        retry_in: Duration,
    },
}

/// A claimed queue row, bound to the transaction holding its lock.
///
/// Every write a job makes goes through that transaction, so its outcome
/// becomes visible exactly when the claim is released.
pub struct Job<'t, 'c> {
    tx: &'t mut Transaction<'c, Postgres>,
    table: &'t QueueTable,
    row: QueueRow,
    max_delay: Option<Duration>,
}

impl<'t, 'c> Job<'t, 'c> {
    /// Bind a row claimed inside `tx`.
    pub fn new(
        tx: &'t mut Transaction<'c, Postgres>,
        table: &'t QueueTable,
        row: QueueRow,
        max_delay: Option<Duration>,
    ) -> Self {
        Self {
            tx,
            table,
            row,
            max_delay,
        }
    }

    /// The claimed row as it was read.
    pub fn row(&self) -> &QueueRow {
        &self.row
    }

    /// Run the job and record the outcome.
    ///
    /// Failing to resolve or run the callable is a recorded failure, not an
    /// error; only storage errors are returned.
    pub async fn execute<Context>(
        mut self,
        registry: &dyn CallableRegistry<Context>,
        context: Context,
    ) -> Result<JobOutcome, sqlx::Error>
    where
        Context: Clone + Send + Sync + 'static,
    {
        let started = Instant::now();
        let result = with_sentry_transaction(&self.row.fn_name, self.invoke(registry, context))
            .bind_hub(Hub::current())
            .await;
        let processed_time = started.elapsed().as_secs_f64();

        match result {
            Ok(value) if contains_nul(&value) => {
                warn!("Job returned a result that can't be stored");
                let message = "job result contains a NUL character, which cannot be stored";
                let retry_in = self.failure(message, processed_time).await?;
                Ok(JobOutcome::Failed { retry_in })
            }
            Ok(value) => {
                debug!(processed_time, "Job succeeded");
                self.success(value, processed_time).await?;
                Ok(JobOutcome::Succeeded)
            }
            Err(error) => {
                warn!("Failed to run job: {error}");
                let retry_in = self.failure(&format!("{error:?}"), processed_time).await?;
                Ok(JobOutcome::Failed { retry_in })
            }
        }
    }

    fn invoke<Context>(
        &self,
        registry: &dyn CallableRegistry<Context>,
        context: Context,
    ) -> BoxFuture<'static, anyhow::Result<Value>>
    where
        Context: Clone + Send + Sync + 'static,
    {
        let invocation = registry
            .resolve(&self.row.fn_name)
            .map_err(anyhow::Error::from)
            .and_then(|callable| {
                let (args, kwargs) = call_arguments(&self.row)?;
                Ok(callable.invoke(context, args, kwargs))
            });

        async move { invocation?.await }.boxed()
    }

    /// Record a successful run: store `result` and make the row terminal.
    ///
    /// JSONB can't hold NUL characters, so such a `result` is a storage
    /// error here; [`Job::execute`] records it as a failed run instead.
    pub async fn success(&mut self, result: Value, processed_time: f64) -> Result<(), sqlx::Error> {
        storage::mark_executed(&mut **self.tx, self.table, self.row.id, result, processed_time).await
    }

    /// Record a failed run: bump the priority, defer the row by the backoff
    /// for the new priority and append the attempt to the error log.
    ///
    /// NUL characters in `message` are stored as the two characters `\0`.
    /// Returns the backoff that was applied.
    pub async fn failure(
        &mut self,
        message: &str,
        processed_time: f64,
    ) -> Result<Duration, sqlx::Error> {
        // PostgreSQL text can't hold NUL
        let message = message.replace('\0', "\\0");
        let message = message.as_str();

        let priority = self.row.priority.saturating_add(1);
        let delay = backoff::delay(priority, self.max_delay);
        debug!(priority, ?delay, "Rescheduling failed job");

        storage::reschedule_failed_job(
            &mut **self.tx,
            self.table,
            self.row.id,
            priority,
            delay,
            message,
            processed_time,
        )
        .await?;
        storage::append_error_log(&mut **self.tx, self.table, &self.row, message, processed_time).await?;

        self.row.priority = priority;
        self.row.reason = Some(message.to_owned());
        Ok(delay)
    }
}

/// Whether `value` holds a NUL character anywhere, which JSONB rejects.
fn contains_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(values) => values.iter().any(contains_nul),
        Value::Object(map) => map.iter().any(|(k, v)| k.contains('\0') || contains_nul(v)),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

fn call_arguments(row: &QueueRow) -> anyhow::Result<(Args, Kwargs)> {
    let args = match &row.args {
        Value::Array(args) => args.clone(),
        Value::Null => Args::new(),
        other => return Err(anyhow!("job args must be a JSON array, got {other}")),
    };
    let kwargs = match &row.kwargs {
        Value::Object(kwargs) => kwargs.clone(),
        Value::Null => Kwargs::new(),
        other => return Err(anyhow!("job kwargs must be a JSON object, got {other}")),
    };
    Ok((args, kwargs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn row(args: Value, kwargs: Value) -> QueueRow {
        QueueRow {
            id: 1,
            fn_name: "test".into(),
            args,
            kwargs,
            priority: 0,
            scheduled: None,
            executed: None,
            canceled: None,
            result: None,
            reason: None,
            processed_time: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn call_arguments_accept_arrays_and_objects() {
        let (args, kwargs) = call_arguments(&row(json!([1, "two"]), json!({"three": 3}))).unwrap();
        assert_eq!(args, vec![json!(1), json!("two")]);
        assert_eq!(kwargs.get("three"), Some(&json!(3)));

        let (args, kwargs) = call_arguments(&row(Value::Null, Value::Null)).unwrap();
        assert!(args.is_empty());
        assert!(kwargs.is_empty());
    }

    #[test]
    fn finds_nul_characters_in_nested_values() {
        assert!(!contains_nul(&json!({"a": [1, "two", null, {"b": true}]})));
        assert!(contains_nul(&json!("bad\u{0}value")));
        assert!(contains_nul(&json!([1, ["deep\u{0}"]])));
        assert!(contains_nul(&json!({"key\u{0}": 1})));
    }

    #[test]
    fn malformed_call_arguments_are_errors() {
        let error = call_arguments(&row(json!({"a": 1}), json!({}))).unwrap_err();
        assert_eq!(error.to_string(), r#"job args must be a JSON array, got {"a":1}"#);

        let error = call_arguments(&row(json!([]), json!([1]))).unwrap_err();
        assert_eq!(error.to_string(), "job kwargs must be a JSON object, got [1]");
    }
}
