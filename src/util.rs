use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Run `future` inside a Sentry performance transaction named after the job.
pub(crate) async fn with_sentry_transaction<F, R, E>(transaction_name: &str, future: F) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "rowqueue.perform");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = future.await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}

/// Turn a caught panic payload into an error carrying the panic message.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
