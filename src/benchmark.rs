//! Runs one workload through several strategies and compares them.

use chrono::{DateTime, Utc};
use futures::stream;
use indicatif::ProgressBar;
use prometheus::{Encoder, TextEncoder};
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::batch::{BatchFn, BatchProcessor};
use crate::config::run::{BatchConfig, PipelineConfig};
use crate::data_model::{ProcessingResult, ResultSummary, WorkItem};
use crate::error::{ExecutorError, Result};
use crate::executor::{Executor, Strategy};
use crate::pipeline::ProducerConsumerPipeline;
use crate::processor::{Processor, RemoteTask};
use crate::rate_limit::{rate_limited, AsyncRateLimiter, RateLimitConfig, RateLimiter};

/// A named task applied to `items` generated payloads. `size` scales each
/// payload: the prime limit for `cpu_burn`, milliseconds for `sleep`, words
/// or bytes for the text tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workload {
    pub task: String,
    pub items: usize,
    pub size: u64,
    pub seed: u64,
}

impl Workload {
    pub fn new(task: impl Into<String>, items: usize, size: u64) -> Self {
        Workload {
            task: task.into(),
            items,
            size,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Same seed, same payloads.
    pub fn items(&self) -> Vec<WorkItem<Value>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.items)
            .map(|i| WorkItem::new(i as u64, self.payload(i, &mut rng)))
            .collect()
    }

    fn payload(&self, index: usize, rng: &mut StdRng) -> Value {
        match self.task.as_str() {
            "cpu_burn" | "sleep" => Value::from(self.size),
            "word_count" => Value::from(random_words(rng, self.size as usize)),
            "checksum" => Value::from(random_token(rng, self.size as usize)),
            _ => Value::from(index as i64),
        }
    }
}

fn random_words(rng: &mut StdRng, words: usize) -> String {
    let mut text = String::new();
    for i in 0..words {
        if i > 0 {
            text.push(' ');
        }
        let len = rng.gen_range(2..10);
        text.push_str(&random_token(rng, len));
    }
    text
}

fn random_token(rng: &mut StdRng, len: usize) -> String {
    (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
}

/// CPU time and resident memory of this process, from the prometheus
/// process collector. Worker processes are not included. Only available on
/// Linux; elsewhere both fields stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_seconds: Option<f64>,
    pub resident_memory_bytes: Option<f64>,
}

impl ResourceUsage {
    pub fn sample() -> Self {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .is_err()
        {
            return ResourceUsage::default();
        }
        let text = String::from_utf8_lossy(&buffer);
        ResourceUsage {
            cpu_seconds: exposition_value(&text, "process_cpu_seconds_total"),
            resident_memory_bytes: exposition_value(&text, "process_resident_memory_bytes"),
        }
    }
}

/// Value of an unlabelled sample in prometheus text exposition format.
fn exposition_value(text: &str, name: &str) -> Option<f64> {
    text.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != name {
                return None;
            }
            parts.next()?.parse().ok()
        })
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyRun {
    pub strategy: String,
    pub wall_secs: f64,
    /// Items per second of wall time.
    pub throughput: f64,
    pub summary: ResultSummary,
    /// CPU seconds this process spent during the run.
    pub cpu_seconds: Option<f64>,
    pub resident_memory_bytes: Option<f64>,
    /// Set when the run could not start (bad configuration, spawn failure).
    pub error: Option<String>,
}

impl StrategyRun {
    fn finished<R>(
        strategy: String,
        started: Instant,
        before: ResourceUsage,
        results: &[ProcessingResult<R>],
    ) -> Self {
        let wall_secs = started.elapsed().as_secs_f64();
        let after = ResourceUsage::sample();
        let summary = ResultSummary::from_results(results);
        StrategyRun {
            strategy,
            wall_secs,
            throughput: if wall_secs > 0.0 {
                summary.total as f64 / wall_secs
            } else {
                0.0
            },
            summary,
            cpu_seconds: after
                .cpu_seconds
                .zip(before.cpu_seconds)
                .map(|(a, b)| (a - b).max(0.0)),
            resident_memory_bytes: after.resident_memory_bytes,
            error: None,
        }
    }

    fn failed(strategy: String, error: &ExecutorError) -> Self {
        StrategyRun {
            strategy,
            wall_secs: 0.0,
            throughput: 0.0,
            summary: ResultSummary::default(),
            cpu_seconds: None,
            resident_memory_bytes: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub generated_at: DateTime<Utc>,
    pub workload: Workload,
    pub runs: Vec<StrategyRun>,
}

impl BenchmarkReport {
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "workload: task={} items={} size={}",
            self.workload.task, self.workload.items, self.workload.size
        );
        let _ = writeln!(
            out,
            "{:<18} {:>10} {:>12} {:>8} {:>8} {:>10} {:>10}",
            "strategy", "wall (s)", "items/s", "ok", "failed", "cpu (s)", "rss (MiB)"
        );
        for run in &self.runs {
            if let Some(error) = &run.error {
                let _ = writeln!(out, "{:<18} error: {}", run.strategy, error);
                continue;
            }
            let cpu = run
                .cpu_seconds
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".to_string());
            let rss = run
                .resident_memory_bytes
                .map(|b| format!("{:.1}", b / (1024.0 * 1024.0)))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{:<18} {:>10.3} {:>12.1} {:>8} {:>8} {:>10} {:>10}",
                run.strategy,
                run.wall_secs,
                run.throughput,
                run.summary.succeeded,
                run.summary.failed,
                cpu,
                rss
            );
        }
        out
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Benchmark report written to {}", path.display());
        Ok(())
    }
}

pub struct StrategyBenchmark {
    executor: Executor,
    workload: Workload,
    rate_limit: Option<RateLimitConfig>,
    batch: Option<BatchConfig>,
    progress: Option<ProgressBar>,
}

impl StrategyBenchmark {
    /// Fails early for tasks the registry does not know.
    pub fn new(executor: Executor, workload: Workload) -> Result<Self> {
        if !executor.registry().contains(&workload.task) {
            return Err(ExecutorError::ConfigError(format!(
                "unknown task '{}'",
                workload.task
            )));
        }
        Ok(StrategyBenchmark {
            executor,
            workload,
            rate_limit: None,
            batch: None,
            progress: None,
        })
    }

    pub fn with_rate_limit(mut self, config: Option<RateLimitConfig>) -> Self {
        self.rate_limit = config;
        self
    }

    /// Run every strategy through a [`BatchProcessor`] instead of one flat
    /// submission.
    pub fn with_batching(mut self, config: Option<BatchConfig>) -> Self {
        self.batch = config;
        self
    }

    /// Advanced once per finished run.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Remote task for the process strategy, an in-process function for
    /// everything else. A fresh limiter per run keeps runs independent.
    fn processor(&self, strategy: Strategy) -> Result<Processor<Value, Value>> {
        let task = &self.workload.task;
        if let Strategy::Process { .. } = strategy {
            let mut remote = RemoteTask::new(task.clone());
            if let Some(config) = &self.rate_limit {
                remote = remote.rate_limited(Arc::new(AsyncRateLimiter::new(config.clone())?));
            }
            return Ok(Processor::Remote(remote));
        }

        let spec = self
            .executor
            .registry()
            .get(task)
            .ok_or_else(|| ExecutorError::ConfigError(format!("unknown task '{}'", task)))?;
        if spec.process_only {
            return Err(ExecutorError::ConfigError(format!(
                "task '{}' may only run on the process strategy",
                task
            )));
        }
        let func = spec.func;
        let call = move |payload: Value| func(payload);
        Ok(match &self.rate_limit {
            Some(config) => {
                let limiter = Arc::new(RateLimiter::new(config.clone())?);
                Processor::blocking(rate_limited(limiter, call))
            }
            None => Processor::blocking(call),
        })
    }

    async fn run_strategy(&self, strategy: Strategy) -> Result<StrategyRun> {
        let processor = self.processor(strategy)?;
        let items = self.workload.items();
        let before = ResourceUsage::sample();
        let started = Instant::now();

        let results = match &self.batch {
            Some(config) => {
                let batches = BatchProcessor::from_config(config)?
                    .with_strategy(self.executor.clone(), strategy)
                    .run(items, &BatchFn::PerItem(processor))
                    .await?;
                batches.into_iter().flat_map(|b| b.results).collect()
            }
            None => self.executor.submit(items, &processor, strategy).await?,
        };
        let label = match &self.batch {
            Some(config) => format!("{}/batch({})", strategy, config.batch_size),
            None => strategy.to_string(),
        };
        Ok(StrategyRun::finished(label, started, before, &results))
    }

    /// Runs the workload once per strategy, in the given order. A strategy
    /// that cannot start is reported in its row rather than aborting the
    /// whole benchmark.
    #[instrument(skip_all, fields(task = %self.workload.task, items = self.workload.items))]
    pub async fn run(&self, strategies: &[Strategy]) -> BenchmarkReport {
        let mut runs = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            if let Some(pb) = &self.progress {
                pb.set_message(strategy.to_string());
            }
            let run = match self.run_strategy(*strategy).await {
                Ok(run) => {
                    info!(
                        strategy = %run.strategy,
                        wall_secs = run.wall_secs,
                        throughput = run.throughput,
                        failed = run.summary.failed,
                        "strategy finished"
                    );
                    run
                }
                Err(e) => {
                    warn!(strategy = %strategy, error = %e, "strategy could not run");
                    StrategyRun::failed(strategy.to_string(), &e)
                }
            };
            runs.push(run);
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }
        BenchmarkReport {
            generated_at: Utc::now(),
            workload: self.workload.clone(),
            runs,
        }
    }

    /// Feeds the workload through a producer-consumer pipeline as a lazy
    /// stream, reported as one extra run.
    pub async fn run_pipeline(&self, config: PipelineConfig) -> StrategyRun {
        let label = format!(
            "pipeline({}{})",
            config.consumers,
            if config.priority { ",priority" } else { "" }
        );
        let outcome = async {
            let processor = self.processor(Strategy::Async {
                concurrency: config.consumers,
            })?;
            let pipeline = ProducerConsumerPipeline::new(config)?
                .with_item_timeout(self.executor.item_timeout());
            let before = ResourceUsage::sample();
            let started = Instant::now();
            let output = pipeline
                .run(stream::iter(self.workload.items()), &processor)
                .await?;
            Ok::<_, ExecutorError>(StrategyRun::finished(
                label.clone(),
                started,
                before,
                &output.results,
            ))
        }
        .await;
        if let Some(pb) = &self.progress {
            pb.inc(1);
        }
        outcome.unwrap_or_else(|e| {
            warn!(error = %e, "pipeline run failed");
            StrategyRun::failed(label, &e)
        })
    }
}
