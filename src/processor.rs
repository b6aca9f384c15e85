use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::error::{ExecutorError, Result, TaskError};
use crate::pool::process::ProcessPool;
use crate::rate_limit::AsyncRateLimiter;
use crate::reader::ContentReader;
use crate::tasks::TaskRegistry;

pub type BlockingFn<T, R> = Arc<dyn Fn(T) -> std::result::Result<R, TaskError> + Send + Sync>;
pub type AsyncFn<T, R> =
    Arc<dyn Fn(T) -> BoxFuture<'static, std::result::Result<R, TaskError>> + Send + Sync>;

type Encode<T> = Arc<dyn Fn(T) -> std::result::Result<Value, TaskError> + Send + Sync>;
type Decode<R> = Arc<dyn Fn(Value) -> std::result::Result<R, TaskError> + Send + Sync>;

/// The caller-supplied processing function.
pub enum Processor<T, R> {
    /// Synchronous function; never called on an async scheduler thread.
    Blocking(BlockingFn<T, R>),
    /// Asynchronous function, awaited directly.
    Async(AsyncFn<T, R>),
    /// Registered task that can be shipped to a worker process.
    Remote(RemoteTask<T, R>),
}

impl<T, R> Clone for Processor<T, R> {
    fn clone(&self) -> Self {
        match self {
            Processor::Blocking(f) => Processor::Blocking(Arc::clone(f)),
            Processor::Async(f) => Processor::Async(Arc::clone(f)),
            Processor::Remote(task) => Processor::Remote(task.clone()),
        }
    }
}

impl<T, R> std::fmt::Debug for Processor<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Processor::Remote(task) => write!(f, "Processor::Remote({})", task.name),
            other => write!(f, "Processor::{}", other.kind()),
        }
    }
}

impl<T, R> Processor<T, R> {
    pub fn kind(&self) -> &'static str {
        match self {
            Processor::Blocking(_) => "blocking",
            Processor::Async(_) => "async",
            Processor::Remote(_) => "remote",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Processor::Remote(_))
    }
}

impl<T, R> Processor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(T) -> std::result::Result<R, TaskError> + Send + Sync + 'static,
    {
        Processor::Blocking(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TaskError>> + Send + 'static,
    {
        Processor::Async(Arc::new(move |input| f(input).boxed()))
    }

    /// Runs one payload from async code. Blocking functions go to the
    /// blocking thread pool, remote tasks to `pool`.
    pub(crate) async fn dispatch(
        &self,
        payload: T,
        pool: Option<&ProcessPool>,
    ) -> (std::result::Result<R, TaskError>, String) {
        self.dispatch_holding(payload, pool, ()).await
    }

    /// Like [`Processor::dispatch`], but `guard` lives until the function
    /// has really returned. A blocking call abandoned by a timeout keeps
    /// running on the blocking pool, and so does its guard.
    pub(crate) async fn dispatch_holding<G: Send + 'static>(
        &self,
        payload: T,
        pool: Option<&ProcessPool>,
        guard: G,
    ) -> (std::result::Result<R, TaskError>, String) {
        match self {
            Processor::Blocking(f) => {
                let f = Arc::clone(f);
                let outcome = tokio::task::spawn_blocking(move || {
                    let _guard = guard;
                    call_blocking(&f, payload)
                })
                .await
                .unwrap_or_else(|e| Err(TaskError::from(e)));
                (outcome, "blocking".to_string())
            }
            Processor::Async(f) => {
                let _guard = guard;
                (call_async(f, payload).await, "async".to_string())
            }
            Processor::Remote(task) => {
                let _guard = guard;
                match pool {
                    Some(pool) => pool.call_remote(task, payload).await,
                    None => (
                        Err(TaskError::failed(format!(
                            "remote task '{}' dispatched without a process pool",
                            task.name
                        ))),
                        "none".to_string(),
                    ),
                }
            }
        }
    }
}

impl<T, R> Processor<T, R>
where
    T: Serialize + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    pub fn remote(name: impl Into<String>) -> Self {
        Processor::Remote(RemoteTask::new(name))
    }

    /// In-process processor backed by a registered task. Tasks marked
    /// `process_only` are refused.
    pub fn from_registry(registry: Arc<TaskRegistry>, name: &str) -> Result<Self> {
        let spec = registry.get(name).ok_or_else(|| {
            ExecutorError::ConfigError(format!("unknown task '{}'", name))
        })?;
        if spec.process_only {
            return Err(ExecutorError::ConfigError(format!(
                "task '{}' may only run in a worker process",
                name
            )));
        }
        let func = spec.func;
        Ok(Processor::blocking(move |payload: T| {
            let value = serde_json::to_value(payload)
                .map_err(|e| TaskError::failed(format!("payload encoding failed: {}", e)))?;
            let out = func(value)?;
            serde_json::from_value(out)
                .map_err(|e| TaskError::failed(format!("result decoding failed: {}", e)))
        }))
    }
}

impl<R> Processor<String, R>
where
    R: Send + 'static,
{
    /// Async processor that fetches each item's content through `reader`
    /// and hands the bytes to `f` on the blocking pool.
    pub fn with_reader<F>(reader: Arc<dyn ContentReader>, f: F) -> Self
    where
        F: Fn(Vec<u8>) -> std::result::Result<R, TaskError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Processor::Async(Arc::new(move |source: String| {
            let reader = Arc::clone(&reader);
            let f = Arc::clone(&f);
            async move {
                let content = reader.read(&source).await?;
                tokio::task::spawn_blocking(move || f(content))
                    .await
                    .unwrap_or_else(|e| Err(TaskError::from(e)))
            }
            .boxed()
        }))
    }
}

pub(crate) fn call_blocking<T, R>(f: &BlockingFn<T, R>, payload: T) -> std::result::Result<R, TaskError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| f(payload)))
        .unwrap_or_else(|panic| Err(TaskError::from_panic(panic)))
}

pub(crate) async fn call_async<T, R>(f: &AsyncFn<T, R>, payload: T) -> std::result::Result<R, TaskError> {
    AssertUnwindSafe(f(payload))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(TaskError::from_panic(panic)))
}

/// A named task plus the codec that moves its payload and result across the
/// process boundary as JSON.
pub struct RemoteTask<T, R> {
    pub name: String,
    encode: Encode<T>,
    decode: Decode<R>,
    limiter: Option<Arc<AsyncRateLimiter>>,
}

impl<T, R> Clone for RemoteTask<T, R> {
    fn clone(&self) -> Self {
        RemoteTask {
            name: self.name.clone(),
            encode: Arc::clone(&self.encode),
            decode: Arc::clone(&self.decode),
            limiter: self.limiter.clone(),
        }
    }
}

impl<T, R> RemoteTask<T, R>
where
    T: Serialize + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        RemoteTask {
            name: name.into(),
            encode: Arc::new(|payload: T| {
                serde_json::to_value(payload)
                    .map_err(|e| TaskError::failed(format!("payload encoding failed: {}", e)))
            }),
            decode: Arc::new(|value: Value| {
                serde_json::from_value(value)
                    .map_err(|e| TaskError::failed(format!("result decoding failed: {}", e)))
            }),
            limiter: None,
        }
    }
}

impl<T, R> RemoteTask<T, R> {
    /// Every dispatch of this task first takes a permit from `limiter`.
    pub fn rate_limited(mut self, limiter: Arc<AsyncRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub(crate) fn encode(&self, payload: T) -> std::result::Result<Value, TaskError> {
        (self.encode)(payload)
    }

    pub(crate) fn decode(&self, value: Value) -> std::result::Result<R, TaskError> {
        (self.decode)(value)
    }

    pub(crate) fn limiter(&self) -> Option<&Arc<AsyncRateLimiter>> {
        self.limiter.as_ref()
    }
}
