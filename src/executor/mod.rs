//! Strategy selection and the `Executor` facade that runs a batch of work
//! items through one of the four execution models.

pub mod async_exec;

pub use async_exec::AsyncExecutor;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::run::ExecutorConfig;
use crate::data_model::{ProcessingResult, WorkItem};
use crate::error::{ExecutorError, Result, TaskError};
use crate::pool::{ProcessPool, ProcessPoolConfig, WorkerPool};
use crate::processor::Processor;
use crate::tasks::TaskRegistry;
use crate::utils::prometheus_metrics::record_item;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Thread { workers: usize },
    Process { workers: usize },
    Async { concurrency: usize },
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Sequential => "sequential",
            Strategy::Thread { .. } => "thread",
            Strategy::Process { .. } => "process",
            Strategy::Async { .. } => "async",
        }
    }

    /// Builds a strategy from its name; `concurrency` becomes the worker
    /// count or the async admission limit.
    pub fn parse(name: &str, concurrency: usize) -> Result<Self> {
        let strategy = match name.trim().to_ascii_lowercase().as_str() {
            "sequential" => Strategy::Sequential,
            "thread" => Strategy::Thread {
                workers: concurrency,
            },
            "process" => Strategy::Process {
                workers: concurrency,
            },
            "async" => Strategy::Async { concurrency },
            other => {
                return Err(ExecutorError::ConfigError(format!(
                    "unknown strategy '{}' (expected sequential, thread, process or async)",
                    other
                )))
            }
        };
        strategy.validate()?;
        Ok(strategy)
    }

    pub fn concurrency(&self) -> usize {
        match self {
            Strategy::Sequential => 1,
            Strategy::Thread { workers } | Strategy::Process { workers } => *workers,
            Strategy::Async { concurrency } => *concurrency,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency() == 0 {
            return Err(ExecutorError::ConfigError(format!(
                "{} strategy needs a concurrency greater than 0",
                self.name()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Sequential => write!(f, "sequential"),
            other => write!(f, "{}({})", other.name(), other.concurrency()),
        }
    }
}

/// Locates the `worker` binary shipped with this crate: next to the running
/// executable, or one directory up (where test harnesses live in `deps/`).
pub fn default_worker_program() -> PathBuf {
    let name = format!("worker{}", std::env::consts::EXE_SUFFIX);
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let beside = dir.join(&name);
            if beside.exists() {
                return beside;
            }
            if let Some(above) = dir.parent().map(|p| p.join(&name)) {
                if above.exists() {
                    return above;
                }
            }
        }
    }
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
    registry: Arc<TaskRegistry>,
}

impl Default for Executor {
    fn default() -> Self {
        Executor {
            config: ExecutorConfig::default(),
            registry: Arc::new(TaskRegistry::builtin()),
        }
    }
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Executor {
            config,
            registry: Arc::new(TaskRegistry::builtin()),
        })
    }

    /// Registry describing the tasks the worker program serves. Remote
    /// submissions naming anything else are refused.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.config.item_timeout()
    }

    /// Submission-time checks: valid strategy, closures kept off the process
    /// strategy, remote tasks known to the registry.
    pub fn check<T, R>(&self, processor: &Processor<T, R>, strategy: Strategy) -> Result<()> {
        strategy.validate()?;
        if let Strategy::Process { .. } = strategy {
            if !processor.is_remote() {
                return Err(ExecutorError::ConfigError(format!(
                    "process strategy needs a registered task, got a {} closure",
                    processor.kind()
                )));
            }
        }
        if let Processor::Remote(task) = processor {
            if !self.registry.contains(&task.name) {
                return Err(ExecutorError::ConfigError(format!(
                    "unknown task '{}'",
                    task.name
                )));
            }
        }
        Ok(())
    }

    pub fn process_pool_config(&self, workers: usize) -> ProcessPoolConfig {
        let program = self
            .config
            .worker_program
            .clone()
            .unwrap_or_else(default_worker_program);
        ProcessPoolConfig::new(program, workers)
            .with_item_timeout(self.item_timeout())
            .with_max_restarts(self.config.max_restarts)
    }

    pub fn start_process_pool(&self, workers: usize) -> Result<ProcessPool> {
        ProcessPool::start(self.process_pool_config(workers))
    }

    pub async fn submit<T, R>(
        &self,
        items: Vec<WorkItem<T>>,
        processor: &Processor<T, R>,
        strategy: Strategy,
    ) -> Result<Vec<ProcessingResult<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        self.submit_with_cancel(items, processor, strategy, None).await
    }

    /// Runs every item and returns exactly one result per item. Items still
    /// outstanding when `cancel` fires resolve as `"cancelled"`.
    #[instrument(skip_all, fields(strategy = %strategy, items = items.len(), processor = processor.kind()))]
    pub async fn submit_with_cancel<T, R>(
        &self,
        items: Vec<WorkItem<T>>,
        processor: &Processor<T, R>,
        strategy: Strategy,
        cancel: Option<CancellationToken>,
    ) -> Result<Vec<ProcessingResult<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        self.check(processor, strategy)?;
        let total = items.len();
        let started = Instant::now();

        let results = match strategy {
            Strategy::Sequential => self.run_sequential(items, processor, cancel.as_ref()).await?,
            Strategy::Thread { workers } => {
                let pool = WorkerPool::start(workers, processor.clone(), self.item_timeout(), cancel)?;
                pool.submit_all(items);
                tokio::task::spawn_blocking(move || pool.shutdown())
                    .await
                    .map_err(|e| ExecutorError::Unexpected(format!("thread pool join failed: {}", e)))?
            }
            Strategy::Process { workers } => {
                let Processor::Remote(task) = processor else {
                    return Err(ExecutorError::ConfigError(
                        "process strategy needs a registered task".to_string(),
                    ));
                };
                let pool = self.start_process_pool(workers)?;
                let results = pool.map(items, task, cancel.as_ref()).await;
                pool.shutdown().await;
                results
            }
            Strategy::Async { concurrency } => {
                let pool = if processor.is_remote() {
                    Some(Arc::new(self.start_process_pool(self.config.process_workers)?))
                } else {
                    None
                };
                let mut executor = AsyncExecutor::new(concurrency, self.item_timeout())?;
                if let Some(token) = cancel {
                    executor = executor.with_cancellation(token);
                }
                let results = executor.run(items, processor, pool.clone()).await;
                if let Some(pool) = pool {
                    pool.shutdown().await;
                }
                results
            }
        };

        debug_assert_eq!(results.len(), total);
        info!(
            strategy = strategy.name(),
            items = total,
            failed = results.iter().filter(|r| !r.success).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "submission finished"
        );
        Ok(results)
    }

    /// One item at a time, in submission order.
    async fn run_sequential<T, R>(
        &self,
        items: Vec<WorkItem<T>>,
        processor: &Processor<T, R>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<ProcessingResult<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let pool = if processor.is_remote() {
            Some(self.start_process_pool(1)?)
        } else {
            None
        };

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let WorkItem { id, payload, .. } = item;
            let started = Instant::now();
            let (outcome, worker_id) = if cancel.map(|t| t.is_cancelled()).unwrap_or(false) {
                (Err(TaskError::Cancelled), "sequential".to_string())
            } else {
                let dispatched = processor.dispatch(payload, pool.as_ref());
                let (outcome, worker_id) = match self.item_timeout() {
                    Some(limit) => tokio::time::timeout(limit, dispatched)
                        .await
                        .unwrap_or_else(|_| (Err(TaskError::Timeout), String::new())),
                    None => dispatched.await,
                };
                let worker_id = if pool.is_some() && !worker_id.is_empty() {
                    worker_id
                } else {
                    "sequential".to_string()
                };
                (outcome, worker_id)
            };
            let result = ProcessingResult::from_outcome(id, outcome, started.elapsed(), worker_id);
            debug!(item = id, success = result.success, "sequential item done");
            record_item("sequential", result.success, result.duration.as_secs_f64());
            results.push(result);
        }

        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        Ok(results)
    }
}

/// Runs `items` with a default [`Executor`].
pub async fn submit<T, R>(
    items: Vec<WorkItem<T>>,
    processor: &Processor<T, R>,
    strategy: Strategy,
) -> Result<Vec<ProcessingResult<R>>>
where
    T: Send + 'static,
    R: Send + 'static,
{
    Executor::default().submit(items, processor, strategy).await
}
