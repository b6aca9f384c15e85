#![allow(non_snake_case)]

// Declare the modules that form the library's public API
pub mod batch;
pub mod benchmark;
pub mod config;
pub mod data_model;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod pool;
pub mod processor;
pub mod rate_limit;
pub mod reader;
pub mod tasks;
pub mod utils;

pub use data_model::{BatchResult, ProcessingResult, ResultSummary, WorkItem};
pub use error::{ExecutorError, Result, TaskError};
pub use executor::{Executor, Strategy};
pub use processor::Processor;
