// src/bin/bench.rs

//! # Bench Binary
//!
//! Runs one workload through several execution strategies and prints a
//! comparison table.
//!
//! 1.  **Configuration**: flags are parsed with `clap`; an optional YAML run
//!     file supplies executor, rate-limit, batch and pipeline settings, and
//!     flags given on the command line override it.
//!
//! 2.  **Workload**: `--items` payloads are generated for the chosen registered
//!     task. The same seed produces the same payloads for every strategy.
//!
//! 3.  **Runs**: each strategy (sequential, thread, process, async) processes
//!     the full workload, optionally through the batch processor. With
//!     `--pipeline` the producer-consumer pipeline is measured as well.
//!
//! 4.  **Report**: wall time, throughput, failures and resource usage are
//!     printed to stdout and, with `--output-json`, written to a file.
//!
//! Logs go to stderr (and optionally a rotated file); Prometheus metrics can
//! be exposed with `--metrics-port`.

use anyhow::Context;
use clap::Parser;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use std::time::Instant;
use tracing::{error, info};
use TaskBlaster::benchmark::{StrategyBenchmark, Workload};
use TaskBlaster::config::bench::Args;
use TaskBlaster::config::{load_run_config, RunConfig};
use TaskBlaster::executor::Executor;
use TaskBlaster::utils::{init_tracing, setup_prometheus_metrics};

/// Creates and configures a new `ProgressBar`.
///
/// # Arguments
///
/// * `total` - Number of steps the bar counts towards.
/// * `template` - Template string for the bar's appearance.
///   See the `indicatif` crate documentation for template syntax.
///
/// # Returns
///
/// A configured `ProgressBar` instance.
fn create_progress_bar(total: u64, template: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar()) // Fallback style
            .progress_chars("=> "),
    );
    pb
}

/// Loads the YAML run file when one is given and folds the flags over it.
fn resolve_config(args: &Args) -> anyhow::Result<RunConfig> {
    let base = match &args.config {
        Some(path) => load_run_config(path)
            .with_context(|| format!("loading run config {}", path.display()))?,
        None => RunConfig::default(),
    };
    Ok(args.merge_into(base)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let _log_guard = init_tracing(args.json_logs, args.log_dir.as_deref(), "bench.log")?;

    let config = resolve_config(&args)?;
    let strategies = args.parse_strategies()?;
    if args.validate_config {
        info!(?config, ?strategies, "Configuration is valid.");
        println!("Configuration is valid.");
        return Ok(());
    }

    // Setup Prometheus Metrics Endpoint
    if let Err(e) = setup_prometheus_metrics(args.metrics_port).await {
        error!("Failed to start Prometheus metrics endpoint: {}", e);
    }

    let executor = Executor::new(config.executor.clone())?;
    let workload = Workload::new(args.task.clone(), args.items, args.size);
    info!(
        task = %workload.task,
        items = workload.items,
        size = workload.size,
        strategies = strategies.len(),
        "Benchmark started"
    );

    let total_runs = strategies.len() as u64 + u64::from(config.pipeline.is_some());
    let pb = create_progress_bar(
        total_runs,
        "{spinner:.green} [{elapsed_precise}] [{bar:30}] {pos}/{len} {msg}",
    );

    let benchmark = StrategyBenchmark::new(executor, workload)?
        .with_rate_limit(config.rate_limit.clone())
        .with_batching(config.batch)
        .with_progress(pb.clone());

    let started = Instant::now();
    let mut report = benchmark.run(&strategies).await;
    if let Some(pipeline) = config.pipeline {
        pb.set_message("pipeline");
        report.runs.push(benchmark.run_pipeline(pipeline).await);
    }
    pb.finish_with_message(format!("done in {}", HumanDuration(started.elapsed())));

    println!("{}", report.render_table());
    if let Some(path) = &args.output_json {
        report
            .write_json(path)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }

    let failed_runs = report.runs.iter().filter(|r| r.error.is_some()).count();
    info!(
        runs = report.runs.len(),
        failed_runs,
        "Benchmark finished in {}",
        HumanDuration(started.elapsed())
    );
    Ok(())
}
