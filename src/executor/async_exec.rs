use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::data_model::{ProcessingResult, WorkItem};
use crate::error::{ExecutorError, Result, TaskError};
use crate::pool::ProcessPool;
use crate::processor::Processor;
use crate::utils::prometheus_metrics::{record_item, ACTIVE_ITEMS};

/// Keeps the active-items gauge honest when a task is dropped mid-flight.
struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Self {
        ACTIVE_ITEMS.inc();
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_ITEMS.dec();
    }
}

/// Cooperative executor: one task per item, at most `concurrency` of them
/// past the admission gate at any moment.
#[derive(Debug, Clone)]
pub struct AsyncExecutor {
    concurrency: usize,
    item_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl AsyncExecutor {
    pub fn new(concurrency: usize, item_timeout: Option<Duration>) -> Result<Self> {
        if concurrency == 0 {
            return Err(ExecutorError::ConfigError(
                "AsyncExecutor: concurrency must be greater than 0".to_string(),
            ));
        }
        Ok(AsyncExecutor {
            concurrency,
            item_timeout,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling this token fails every outstanding item with `"cancelled"`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs every item and returns one result per item in completion order.
    /// Remote processors need `pool`; blocking ones are moved off the
    /// scheduler with `spawn_blocking`.
    #[instrument(skip_all, fields(items = items.len(), concurrency = self.concurrency, processor = processor.kind()))]
    pub async fn run<T, R>(
        &self,
        items: Vec<WorkItem<T>>,
        processor: &Processor<T, R>,
        pool: Option<Arc<ProcessPool>>,
    ) -> Vec<ProcessingResult<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut ids: Vec<Option<u64>> = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            ids.push(Some(item.id));
            let WorkItem { id: item_id, payload, .. } = item;
            let gate = Arc::clone(&gate);
            let processor = processor.clone();
            let pool = pool.clone();
            let cancel = self.cancel.clone();
            let item_timeout = self.item_timeout;

            tasks.spawn(async move {
                let started = Instant::now();
                let work = async {
                    let permit = match gate.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return (Err(TaskError::Cancelled), "async".to_string()),
                    };
                    // The slot stays taken until the function returns, even
                    // after the item itself has timed out.
                    let held = (permit, ActiveGuard::enter());
                    let dispatched = processor.dispatch_holding(payload, pool.as_deref(), held);
                    match item_timeout {
                        Some(limit) => match tokio::time::timeout(limit, dispatched).await {
                            Ok(out) => out,
                            Err(_) => (Err(TaskError::Timeout), "async".to_string()),
                        },
                        None => dispatched.await,
                    }
                };
                let (outcome, worker_id) = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => (Err(TaskError::Cancelled), "async".to_string()),
                    out = work => out,
                };
                let result =
                    ProcessingResult::from_outcome(item_id, outcome, started.elapsed(), worker_id);
                record_item("async", result.success, result.duration.as_secs_f64());
                (index, result)
            });
        }

        let mut results = Vec::with_capacity(ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    ids[index] = None;
                    results.push(result);
                }
                Err(e) => warn!(error = %e, "async task ended without a result"),
            }
        }
        // Anything still unaccounted for was aborted; report it rather than
        // returning a short result set.
        for id in ids.into_iter().flatten() {
            results.push(ProcessingResult::failure(
                id,
                &TaskError::Cancelled,
                Duration::ZERO,
                "async",
            ));
        }
        debug!(results = results.len(), "async run finished");
        results
    }
}
