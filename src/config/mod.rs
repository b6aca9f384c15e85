// Configuration: command-line arguments and the YAML run file

pub mod bench;
pub mod run;

pub use run::{load_run_config, BatchConfig, ExecutorConfig, PipelineConfig, RunConfig};
