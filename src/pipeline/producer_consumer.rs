use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use super::queue::{BoundedQueue, Message};
use crate::config::run::PipelineConfig;
use crate::data_model::{ProcessingResult, WorkItem};
use crate::error::{ExecutorError, Result, TaskError};
use crate::pool::ProcessPool;
use crate::processor::Processor;
use crate::utils::prometheus_metrics::{record_item, ACTIVE_ITEMS, PIPELINE_QUEUE_DEPTH};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub consumers: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    /// Peak queue occupancy, sentinels included. Never above `capacity`.
    pub high_water_mark: usize,
}

#[derive(Debug)]
pub struct PipelineOutput<R> {
    /// In dequeue order; in FIFO mode that is the producer's emission order.
    pub results: Vec<ProcessingResult<R>>,
    pub stats: PipelineStats,
}

struct ConsumerContext<T, R> {
    processor: Processor<T, R>,
    pool: Option<Arc<ProcessPool>>,
    cancel: CancellationToken,
    item_timeout: Option<Duration>,
}

impl<T, R> Clone for ConsumerContext<T, R> {
    fn clone(&self) -> Self {
        ConsumerContext {
            processor: self.processor.clone(),
            pool: self.pool.clone(),
            cancel: self.cancel.clone(),
            item_timeout: self.item_timeout,
        }
    }
}

/// One producer feeding `consumers` workers through a bounded queue.
#[derive(Clone)]
pub struct ProducerConsumerPipeline {
    config: PipelineConfig,
    pool: Option<Arc<ProcessPool>>,
    cancel: CancellationToken,
    item_timeout: Option<Duration>,
}

impl ProducerConsumerPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(ProducerConsumerPipeline {
            config,
            pool: None,
            cancel: CancellationToken::new(),
            item_timeout: None,
        })
    }

    /// Pool used by consumers for remote processors.
    pub fn with_process_pool(mut self, pool: Arc<ProcessPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Once cancelled the producer stops pulling and consumers fail what is
    /// left in the queue with `"cancelled"`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Drives `producer` to exhaustion (or cancellation), then sends one stop
    /// sentinel per consumer and joins them all.
    #[instrument(skip_all, fields(consumers = self.config.consumers, capacity = self.config.queue_capacity, priority = self.config.priority))]
    pub async fn run<S, T, R>(
        &self,
        producer: S,
        processor: &Processor<T, R>,
    ) -> Result<PipelineOutput<R>>
    where
        S: Stream<Item = WorkItem<T>>,
        T: Send + 'static,
        R: Send + 'static,
    {
        if processor.is_remote() && self.pool.is_none() {
            return Err(ExecutorError::ConfigError(
                "pipeline: remote processors need a process pool".to_string(),
            ));
        }
        let queue = Arc::new(BoundedQueue::new(
            self.config.queue_capacity,
            self.config.priority,
        )?);
        let context = ConsumerContext {
            processor: processor.clone(),
            pool: self.pool.clone(),
            cancel: self.cancel.clone(),
            item_timeout: self.item_timeout,
        };

        let mut consumers = JoinSet::new();
        for index in 0..self.config.consumers {
            let queue = Arc::clone(&queue);
            let context = context.clone();
            consumers.spawn(
                consume(index, queue, context).instrument(info_span!("consumer", index)),
            );
        }
        info!("Started {} consumers", self.config.consumers);

        let mut enqueued = 0u64;
        let mut producer = std::pin::pin!(producer);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Pipeline cancelled after {} items", enqueued);
                    None
                }
                item = producer.next() => item,
            };
            let Some(item) = next else { break };
            queue.push(Message::Item(item)).await?;
            enqueued += 1;
            PIPELINE_QUEUE_DEPTH.set(queue.len() as f64);
        }
        for _ in 0..self.config.consumers {
            queue.push(Message::Stop).await?;
        }
        debug!(enqueued, "producer finished, stop sentinels sent");

        let mut ordered: Vec<(u64, ProcessingResult<R>)> = Vec::with_capacity(enqueued as usize);
        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok(batch) => ordered.extend(batch),
                Err(e) => {
                    error!(error = %e, "consumer task failed");
                    return Err(ExecutorError::Unexpected(format!(
                        "pipeline consumer failed: {}",
                        e
                    )));
                }
            }
        }
        ordered.sort_by_key(|(order, _)| *order);
        PIPELINE_QUEUE_DEPTH.set(0.0);

        let stats = PipelineStats {
            consumers: self.config.consumers,
            capacity: queue.capacity(),
            enqueued,
            dequeued: ordered.len() as u64,
            high_water_mark: queue.high_water_mark(),
        };
        info!(?stats, "Pipeline finished");
        Ok(PipelineOutput {
            results: ordered.into_iter().map(|(_, result)| result).collect(),
            stats,
        })
    }
}

async fn consume<T, R>(
    index: usize,
    queue: Arc<BoundedQueue<T>>,
    context: ConsumerContext<T, R>,
) -> Vec<(u64, ProcessingResult<R>)>
where
    T: Send + 'static,
    R: Send + 'static,
{
    let mut done = Vec::new();
    while let Some((order, message)) = queue.pop().await {
        let WorkItem { id, payload, .. } = match message {
            Message::Item(item) => item,
            Message::Stop => break,
        };
        PIPELINE_QUEUE_DEPTH.set(queue.len() as f64);

        let started = Instant::now();
        let (outcome, worker_id) = if context.cancel.is_cancelled() {
            (Err(TaskError::Cancelled), String::new())
        } else {
            ACTIVE_ITEMS.inc();
            let dispatched = context.processor.dispatch(payload, context.pool.as_deref());
            let bounded = async {
                match context.item_timeout {
                    Some(limit) => tokio::time::timeout(limit, dispatched)
                        .await
                        .unwrap_or_else(|_| (Err(TaskError::Timeout), String::new())),
                    None => dispatched.await,
                }
            };
            let out = tokio::select! {
                biased;
                _ = context.cancel.cancelled() => (Err(TaskError::Cancelled), String::new()),
                out = bounded => out,
            };
            ACTIVE_ITEMS.dec();
            out
        };
        let worker_id = if worker_id.is_empty() || !context.processor.is_remote() {
            format!("consumer-{}", index)
        } else {
            worker_id
        };
        let result = ProcessingResult::from_outcome(id, outcome, started.elapsed(), worker_id);
        record_item("pipeline", result.success, result.duration.as_secs_f64());
        done.push((order, result));
    }
    debug!(items = done.len(), "consumer exiting");
    done
}
