//! Newline-delimited JSON spoken between the process pool and its workers.
//!
//! Parent -> worker: one [`TaskRequest`] per line on the worker's stdin.
//! Worker -> parent: one [`TaskResponse`] per line on stdout, in request
//! order. EOF on stdin asks the worker to exit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

use crate::error::{Result, TaskError};
use crate::tasks::TaskRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: u64,
    pub task: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Err(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: u64,
    pub worker_pid: u32,
    pub outcome: Outcome,
}

impl TaskResponse {
    pub fn into_result(self) -> std::result::Result<Value, TaskError> {
        match self.outcome {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(msg) => Err(TaskError::Failed(msg)),
        }
    }
}

/// Answers a single request. Panics inside the task are reported as errors
/// so the worker survives them.
pub fn handle_request(registry: &TaskRegistry, request: TaskRequest) -> TaskResponse {
    let TaskRequest { id, task, payload } = request;
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| registry.run(&task, payload)))
    {
        Ok(Ok(value)) => Outcome::Ok(value),
        Ok(Err(e)) => Outcome::Err(e.to_string()),
        Err(panic) => Outcome::Err(TaskError::from_panic(panic).to_string()),
    };
    TaskResponse {
        id,
        worker_pid: std::process::id(),
        outcome,
    }
}

/// Worker-side request loop. Returns the number of requests served once
/// `input` reaches EOF.
pub fn serve<I, O>(registry: &TaskRegistry, input: I, mut output: O) -> Result<u64>
where
    I: BufRead,
    O: Write,
{
    let mut served = 0u64;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<TaskRequest>(&line) {
            Ok(request) => {
                debug!(id = request.id, task = %request.task, "worker received task");
                handle_request(registry, request)
            }
            Err(e) => {
                // Without an id the parent cannot match the answer; it will
                // see a desync and treat this worker as crashed.
                warn!(error = %e, "malformed task request");
                TaskResponse {
                    id: u64::MAX,
                    worker_pid: std::process::id(),
                    outcome: Outcome::Err(format!("malformed request: {}", e)),
                }
            }
        };
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
        served += 1;
    }
    Ok(served)
}
