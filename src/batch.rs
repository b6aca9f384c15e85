//! Fixed-size batching on top of the executor strategies.
//!
//! Items are split into consecutive chunks of `batch_size`; at most
//! `max_concurrent_batches` chunks are in flight and results come back in
//! batch order.

use futures::stream::{self, StreamExt};
use itertools::Itertools;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::run::BatchConfig;
use crate::data_model::{BatchResult, ProcessingResult, WorkItem};
use crate::error::{Result, TaskError};
use crate::executor::{Executor, Strategy};
use crate::processor::Processor;
use crate::utils::prometheus_metrics::record_item;

pub type WholeBatchFn<T, R> =
    Arc<dyn Fn(Vec<T>) -> Vec<std::result::Result<R, TaskError>> + Send + Sync>;

/// What runs for each batch.
pub enum BatchFn<T, R> {
    /// Every item goes through the processor on the configured strategy.
    PerItem(Processor<T, R>),
    /// One call per batch on the blocking pool; must return one outcome per
    /// payload, in payload order.
    Whole(WholeBatchFn<T, R>),
}

impl<T, R> BatchFn<T, R> {
    pub fn whole<F>(f: F) -> Self
    where
        F: Fn(Vec<T>) -> Vec<std::result::Result<R, TaskError>> + Send + Sync + 'static,
    {
        BatchFn::Whole(Arc::new(f))
    }
}

/// Splits `items` into consecutive chunks; the last one may be shorter.
pub fn partition<T>(items: Vec<WorkItem<T>>, batch_size: usize) -> Vec<Vec<WorkItem<T>>> {
    let chunks = items.into_iter().chunks(batch_size.max(1));
    chunks.into_iter().map(|chunk| chunk.collect()).collect()
}

#[derive(Debug, Clone)]
pub struct BatchProcessor {
    batch_size: usize,
    max_concurrent_batches: usize,
    executor: Executor,
    strategy: Strategy,
}

impl BatchProcessor {
    /// Per-item batches run on the async strategy with one slot per item of
    /// a batch unless [`BatchProcessor::with_strategy`] says otherwise.
    pub fn new(batch_size: usize, max_concurrent_batches: usize) -> Result<Self> {
        BatchConfig {
            batch_size,
            max_concurrent_batches,
        }
        .validate()?;
        Ok(BatchProcessor {
            batch_size,
            max_concurrent_batches,
            executor: Executor::default(),
            strategy: Strategy::Async {
                concurrency: batch_size,
            },
        })
    }

    pub fn from_config(config: &BatchConfig) -> Result<Self> {
        BatchProcessor::new(config.batch_size, config.max_concurrent_batches)
    }

    pub fn with_strategy(mut self, executor: Executor, strategy: Strategy) -> Self {
        self.executor = executor;
        self.strategy = strategy;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_concurrent_batches(&self) -> usize {
        self.max_concurrent_batches
    }

    #[instrument(skip_all, fields(items = items.len(), batch_size = self.batch_size, max_in_flight = self.max_concurrent_batches))]
    pub async fn run<T, R>(
        &self,
        items: Vec<WorkItem<T>>,
        func: &BatchFn<T, R>,
    ) -> Result<Vec<BatchResult<R>>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        if let BatchFn::PerItem(processor) = func {
            self.executor.check(processor, self.strategy)?;
        }
        let batches = partition(items, self.batch_size);
        info!("Dispatching {} batches", batches.len());

        let results: Vec<BatchResult<R>> = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| self.run_batch(index, batch, func))
            .buffered(self.max_concurrent_batches)
            .collect()
            .await;
        Ok(results)
    }

    async fn run_batch<T, R>(
        &self,
        batch_index: usize,
        batch: Vec<WorkItem<T>>,
        func: &BatchFn<T, R>,
    ) -> BatchResult<R>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let started = Instant::now();
        let ids: Vec<u64> = batch.iter().map(|item| item.id).collect();
        let worker_id = format!("batch-{}", batch_index);

        let results = match func {
            BatchFn::PerItem(processor) => {
                match self.executor.submit(batch, processor, self.strategy).await {
                    Ok(mut results) => {
                        let position: HashMap<u64, usize> =
                            ids.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();
                        results.sort_by_key(|r| position.get(&r.item_id).copied());
                        results
                    }
                    Err(e) => {
                        warn!(batch = batch_index, error = %e, "batch submission failed");
                        fail_all(&ids, &TaskError::failed(e.to_string()), started, &worker_id)
                    }
                }
            }
            BatchFn::Whole(f) => {
                let f = Arc::clone(f);
                let payloads: Vec<T> = batch.into_iter().map(|item| item.payload).collect();
                let joined = tokio::task::spawn_blocking(move || {
                    std::panic::catch_unwind(AssertUnwindSafe(|| f(payloads)))
                })
                .await;
                let results: Vec<ProcessingResult<R>> = match joined {
                    Ok(Ok(outcomes)) if outcomes.len() == ids.len() => {
                        let elapsed = started.elapsed();
                        ids.iter()
                            .zip(outcomes)
                            .map(|(id, outcome)| {
                                ProcessingResult::from_outcome(*id, outcome, elapsed, worker_id.as_str())
                            })
                            .collect()
                    }
                    Ok(Ok(outcomes)) => {
                        let error = TaskError::failed(format!(
                            "batch function returned {} results for {} items",
                            outcomes.len(),
                            ids.len()
                        ));
                        fail_all(&ids, &error, started, &worker_id)
                    }
                    Ok(Err(panic)) => fail_all(&ids, &TaskError::from_panic(panic), started, &worker_id),
                    Err(e) => fail_all(&ids, &TaskError::from(e), started, &worker_id),
                };
                for result in &results {
                    record_item("batch", result.success, result.duration.as_secs_f64());
                }
                results
            }
        };

        let batch_duration = started.elapsed();
        debug!(batch = batch_index, items = ids.len(), ?batch_duration, "batch done");
        BatchResult {
            batch_index,
            item_count: ids.len(),
            results,
            batch_duration,
        }
    }
}

fn fail_all<R>(
    ids: &[u64],
    error: &TaskError,
    started: Instant,
    worker_id: &str,
) -> Vec<ProcessingResult<R>> {
    let elapsed = started.elapsed();
    ids.iter()
        .map(|id| ProcessingResult::failure(*id, error, elapsed, worker_id))
        .collect()
}
