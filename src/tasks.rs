//! Named tasks that can run on either side of the process boundary.
//!
//! A closure cannot be shipped to another process, so the process strategy
//! only accepts tasks looked up by name in a [`TaskRegistry`]. The worker
//! binary serves the built-in registry; the parent consults the same table
//! to reject unknown names before anything is dispatched.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::TaskError;

pub type TaskFn = fn(Value) -> Result<Value, TaskError>;

#[derive(Debug, Clone, Copy)]
pub struct TaskSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub func: TaskFn,
    /// Must never run inside the parent process (e.g. it terminates the
    /// process it runs in).
    pub process_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, TaskSpec>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = TaskRegistry::new();
        registry.register(TaskSpec {
            name: "square",
            description: "Square an integer payload",
            func: square,
            process_only: false,
        });
        registry.register(TaskSpec {
            name: "cpu_burn",
            description: "Count primes below the payload (CPU bound)",
            func: cpu_burn,
            process_only: false,
        });
        registry.register(TaskSpec {
            name: "sleep",
            description: "Sleep for the payload in milliseconds (simulated I/O wait)",
            func: sleep_ms,
            process_only: false,
        });
        registry.register(TaskSpec {
            name: "word_count",
            description: "Count whitespace separated words in a string payload",
            func: word_count,
            process_only: false,
        });
        registry.register(TaskSpec {
            name: "checksum",
            description: "FNV-1a 64 checksum of a string payload, hex encoded",
            func: checksum,
            process_only: false,
        });
        registry.register(TaskSpec {
            name: "fail",
            description: "Always fails",
            func: fail,
            process_only: false,
        });
        registry.register(TaskSpec {
            name: "crash",
            description: "Terminate the worker process without answering",
            func: crash,
            process_only: true,
        });
        registry
    }

    pub fn register(&mut self, spec: TaskSpec) {
        self.tasks.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.keys().copied()
    }

    pub fn run(&self, name: &str, payload: Value) -> Result<Value, TaskError> {
        match self.tasks.get(name) {
            Some(spec) => (spec.func)(payload),
            None => Err(TaskError::failed(format!("unknown task '{}'", name))),
        }
    }
}

fn expect_i64(payload: &Value) -> Result<i64, TaskError> {
    payload
        .as_i64()
        .ok_or_else(|| TaskError::failed(format!("expected an integer payload, got {}", payload)))
}

fn expect_u64(payload: &Value) -> Result<u64, TaskError> {
    payload.as_u64().ok_or_else(|| {
        TaskError::failed(format!(
            "expected a non-negative integer payload, got {}",
            payload
        ))
    })
}

fn expect_str(payload: &Value) -> Result<&str, TaskError> {
    payload
        .as_str()
        .ok_or_else(|| TaskError::failed(format!("expected a string payload, got {}", payload)))
}

fn square(payload: Value) -> Result<Value, TaskError> {
    let x = expect_i64(&payload)?;
    x.checked_mul(x)
        .map(Value::from)
        .ok_or_else(|| TaskError::failed(format!("square of {} overflows", x)))
}

fn cpu_burn(payload: Value) -> Result<Value, TaskError> {
    let limit = expect_u64(&payload)?;
    Ok(Value::from(count_primes_below(limit)))
}

pub fn count_primes_below(limit: u64) -> u64 {
    (2..limit)
        .filter(|&n| {
            let mut d = 2;
            while d * d <= n {
                if n % d == 0 {
                    return false;
                }
                d += 1;
            }
            true
        })
        .count() as u64
}

fn sleep_ms(payload: Value) -> Result<Value, TaskError> {
    let ms = expect_u64(&payload)?;
    std::thread::sleep(Duration::from_millis(ms));
    Ok(Value::from(ms))
}

fn word_count(payload: Value) -> Result<Value, TaskError> {
    let text = expect_str(&payload)?;
    Ok(Value::from(text.split_whitespace().count()))
}

fn checksum(payload: Value) -> Result<Value, TaskError> {
    let text = expect_str(&payload)?;
    Ok(Value::from(format!("{:016x}", fnv1a64(text.as_bytes()))))
}

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ *b as u64).wrapping_mul(PRIME))
}

fn fail(payload: Value) -> Result<Value, TaskError> {
    Err(TaskError::failed(format!("requested failure for {}", payload)))
}

fn crash(_payload: Value) -> Result<Value, TaskError> {
    std::process::exit(70)
}
