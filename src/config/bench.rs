use std::path::PathBuf;

use clap::Parser;

use crate::config::run::{BatchConfig, PipelineConfig, RunConfig};
use crate::error::{ExecutorError, Result};
use crate::executor::Strategy;
use crate::rate_limit::RateLimitConfig;

// Define command-line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Compare execution strategies on one workload", long_about = None)]
pub struct Args {
    /// Registered task to run (square, cpu_burn, sleep, word_count, checksum, fail)
    #[arg(short, long, default_value = "cpu_burn")]
    pub task: String,

    /// Number of work items
    #[arg(short = 'n', long, default_value_t = 200)]
    pub items: usize,

    /// Payload size: prime limit, sleep milliseconds, words or bytes
    #[arg(long, default_value_t = 20_000)]
    pub size: u64,

    /// Comma separated strategies to compare
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "sequential,thread,process,async"
    )]
    pub strategies: Vec<String>,

    /// Workers for thread/process, admission limit for async
    #[arg(short = 'j', long, default_value_t = 4)]
    pub concurrency: usize,

    /// Run through the batch processor with this batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Batches in flight at once when batching
    #[arg(long, default_value_t = 2)]
    pub max_concurrent_batches: usize,

    /// Also run the producer-consumer pipeline with `concurrency` consumers
    #[arg(long)]
    pub pipeline: bool,

    /// Queue capacity for the pipeline run
    #[arg(long, default_value_t = 16)]
    pub queue_capacity: usize,

    /// Limit task calls to this many per second (token bucket)
    #[arg(long)]
    pub rate: Option<u32>,

    /// Per-item timeout in seconds
    #[arg(long)]
    pub item_timeout_secs: Option<f64>,

    /// Worker executable for the process strategy
    #[arg(long)]
    pub worker_program: Option<PathBuf>,

    /// Path to a run configuration YAML file. Flags override its values.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Write the benchmark report as JSON to this file
    #[arg(short = 'o', long)]
    pub output_json: Option<PathBuf>,

    /// Optional: Port for the Prometheus metrics HTTP endpoint
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

impl Args {
    pub fn parse_strategies(&self) -> Result<Vec<Strategy>> {
        if self.strategies.is_empty() {
            return Err(ExecutorError::ConfigError(
                "at least one strategy is required".to_string(),
            ));
        }
        self.strategies
            .iter()
            .map(|name| Strategy::parse(name, self.concurrency))
            .collect()
    }

    /// Folds the command-line flags over `base` (usually the YAML file).
    pub fn merge_into(&self, mut base: RunConfig) -> Result<RunConfig> {
        if let Some(secs) = self.item_timeout_secs {
            base.executor.item_timeout_secs = Some(secs);
        }
        if let Some(program) = &self.worker_program {
            base.executor.worker_program = Some(program.clone());
        }
        if let Some(rate) = self.rate {
            base.rate_limit = Some(RateLimitConfig::token_bucket(
                rate,
                std::time::Duration::from_secs(1),
            ));
        }
        if let Some(batch_size) = self.batch_size {
            base.batch = Some(BatchConfig {
                batch_size,
                max_concurrent_batches: self.max_concurrent_batches,
            });
        }
        if self.pipeline {
            let priority = base.pipeline.map(|p| p.priority).unwrap_or(false);
            base.pipeline = Some(PipelineConfig {
                consumers: self.concurrency,
                queue_capacity: self.queue_capacity,
                priority,
            });
        }
        base.validate()?;
        Ok(base)
    }
}
