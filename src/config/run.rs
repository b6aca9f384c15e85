use crate::error::{ExecutorError, Result};
use crate::rate_limit::RateLimitConfig;
use serde::Deserialize;
use std::fs; // For reading the file
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Represents the overall run configuration read from YAML.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub batch: Option<BatchConfig>,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        self.executor.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if let Some(batch) = &self.batch {
            batch.validate()?;
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.validate()?;
        }
        Ok(())
    }
}

/// Settings shared by every strategy.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Per-item deadline in seconds; unset means no deadline.
    #[serde(default)]
    pub item_timeout_secs: Option<f64>,
    /// Worker executable for the process strategy. Defaults to the `worker`
    /// binary installed next to the running executable.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    /// Size of the pool that async submissions use for remote tasks.
    #[serde(default = "default_process_workers")]
    pub process_workers: usize,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
}

fn default_process_workers() -> usize {
    4
}

fn default_max_restarts() -> usize {
    3
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            item_timeout_secs: None,
            worker_program: None,
            process_workers: default_process_workers(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.item_timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ExecutorError::ConfigError(format!(
                    "ExecutorConfig: item_timeout_secs must be a positive number, got {}",
                    secs
                )));
            }
        }
        if self.process_workers == 0 {
            return Err(ExecutorError::ConfigError(
                "ExecutorConfig: process_workers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_secs.map(Duration::from_secs_f64)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

fn default_max_concurrent_batches() -> usize {
    2
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ExecutorError::ConfigError(
                "BatchConfig: batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_batches == 0 {
            return Err(ExecutorError::ConfigError(
                "BatchConfig: max_concurrent_batches must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub consumers: usize,
    pub queue_capacity: usize,
    /// Dequeue by item priority instead of FIFO.
    #[serde(default)]
    pub priority: bool,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.consumers == 0 {
            return Err(ExecutorError::ConfigError(
                "PipelineConfig: consumers must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ExecutorError::ConfigError(
                "PipelineConfig: queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn load_run_config<P: AsRef<Path>>(config_path: P) -> Result<RunConfig> {
    let path_ref = config_path.as_ref();
    let config_content = fs::read_to_string(path_ref).map_err(|e| {
        ExecutorError::ConfigError(format!(
            "Failed to read run config file '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    let config: RunConfig = serde_yaml::from_str(&config_content).map_err(|e| {
        ExecutorError::ConfigError(format!(
            "Failed to parse run config YAML from '{}': {}",
            path_ref.display(),
            e
        ))
    })?;
    config.validate()?;
    Ok(config)
}
