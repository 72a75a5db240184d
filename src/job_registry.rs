use crate::background_job::BackgroundJob;
use crate::errors::ResolutionError;
use crate::util::try_to_extract_panic_info;
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Positional arguments of a job.
pub type Args = Vec<Value>;
/// Keyword arguments of a job.
pub type Kwargs = Map<String, Value>;

type AsyncFn<Context> =
    dyn Fn(Context, Args, Kwargs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;
type BlockingFn<Context> = dyn Fn(Context, Args, Kwargs) -> anyhow::Result<Value> + Send + Sync;

/// A unit of work a queue row can name.
pub enum Callable<Context> {
    /// Polled inline on the tokio scheduler. Must not block.
    Async(Arc<AsyncFn<Context>>),
    /// Runs on the runtime's blocking thread pool and is joined before the
    /// outcome is written.
    Blocking(Arc<BlockingFn<Context>>),
}

impl<Context> Clone for Callable<Context> {
    fn clone(&self) -> Self {
        match self {
            Self::Async(f) => Self::Async(f.clone()),
            Self::Blocking(f) => Self::Blocking(f.clone()),
        }
    }
}

impl<Context> std::fmt::Debug for Callable<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async(_) => write!(f, "Callable::Async(<function>)"),
            Self::Blocking(_) => write!(f, "Callable::Blocking(<function>)"),
        }
    }
}

impl<Context: Send + 'static> Callable<Context> {
    /// Wrap an async function.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Context, Args, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx, args, kwargs| f(ctx, args, kwargs).boxed()))
    }

    /// Wrap a synchronous function that may block.
    pub fn from_blocking<F>(f: F) -> Self
    where
        F: Fn(Context, Args, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    /// Fail the invocation if it hasn't finished after `timeout`.
    ///
    /// A timed-out blocking callable keeps its thread until it returns on its
    /// own; only the job's outcome is decided early.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self::Async(Arc::new(move |ctx, args, kwargs| {
            let invocation = self.invoke(ctx, args, kwargs);
            async move {
                tokio::time::timeout(timeout, invocation)
                    .await
                    .map_err(|_| anyhow!("job timed out after {timeout:?}"))?
            }
            .boxed()
        }))
    }

    /// Call the function, turning panics into errors.
    pub fn invoke(
        &self,
        ctx: Context,
        args: Args,
        kwargs: Kwargs,
    ) -> BoxFuture<'static, anyhow::Result<Value>> {
        match self {
            Self::Async(f) => {
                let f = f.clone();
                AssertUnwindSafe(async move { f(ctx, args, kwargs).await })
                    .catch_unwind()
                    .map(|result| {
                        result
                            .map_err(|e| try_to_extract_panic_info(&*e))
                            .and_then(std::convert::identity)
                    })
                    .boxed()
            }
            Self::Blocking(f) => {
                let f = f.clone();
                let handle = tokio::task::spawn_blocking(move || f(ctx, args, kwargs));
                async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(error) if error.is_panic() => {
                            Err(try_to_extract_panic_info(&*error.into_panic()))
                        }
                        Err(error) => Err(anyhow!("blocking job was cancelled: {error}")),
                    }
                }
                .boxed()
            }
        }
    }
}

/// Maps a row's `fn_name` to the callable that performs it.
pub trait CallableRegistry<Context>: Send + Sync {
    /// Look up the callable registered under `fn_name`.
    fn resolve(&self, fn_name: &str) -> Result<Callable<Context>, ResolutionError>;
}

/// The default [`CallableRegistry`], filled at start-up.
pub struct JobRegistry<Context> {
    callables: HashMap<String, Callable<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            callables: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            callables: self.callables.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("fn_names", &self.callables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    /// Register a typed job under its [`BackgroundJob::JOB_NAME`].
    ///
    /// The job value is read back from the row's single positional argument.
    pub fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let callable = Callable::from_async(|ctx, args: Args, _kwargs| async move {
            let data = args.into_iter().next().unwrap_or(Value::Null);
            let job: J = serde_json::from_value(data)?;
            let output = job.run(ctx).await?;
            Ok(serde_json::to_value(output)?)
        });
        self.insert(J::JOB_NAME, callable);
    }

    /// Register an async function under `fn_name`.
    pub fn register_async<F, Fut>(&mut self, fn_name: &str, f: F)
    where
        F: Fn(Context, Args, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(fn_name, Callable::from_async(f));
    }

    /// Register a blocking function under `fn_name`.
    pub fn register_blocking<F>(&mut self, fn_name: &str, f: F)
    where
        F: Fn(Context, Args, Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(fn_name, Callable::from_blocking(f));
    }

    /// Register a prepared callable under `fn_name`, replacing any previous one.
    pub fn insert(&mut self, fn_name: &str, callable: Callable<Context>) {
        self.callables.insert(fn_name.to_owned(), callable);
    }

    /// Names of all registered callables.
    pub fn fn_names(&self) -> Vec<String> {
        self.callables.keys().cloned().collect()
    }
}

impl<Context: Send + Sync> CallableRegistry<Context> for JobRegistry<Context> {
    fn resolve(&self, fn_name: &str) -> Result<Callable<Context>, ResolutionError> {
        self.callables
            .get(fn_name)
            .cloned()
            .ok_or_else(|| ResolutionError::UnknownFunction(fn_name.to_owned()))
    }
}
