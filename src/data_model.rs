use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::TaskError;

/// One unit of input. Immutable once handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem<T> {
    pub id: u64,
    pub payload: T,
    /// Higher values are dequeued first in priority mode; equal priorities
    /// keep insertion order.
    #[serde(default)]
    pub priority: i64,
}

impl<T> WorkItem<T> {
    pub fn new(id: u64, payload: T) -> Self {
        WorkItem {
            id,
            payload,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Numbers payloads `0..n` in iteration order.
    pub fn sequence<I>(payloads: I) -> Vec<WorkItem<T>>
    where
        I: IntoIterator<Item = T>,
    {
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| WorkItem::new(i as u64, payload))
            .collect()
    }
}

/// Outcome of one admitted work item. `success == error.is_none()` always
/// holds because the fields are only set through the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult<R> {
    pub item_id: u64,
    pub success: bool,
    pub value: Option<R>,
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub worker_id: String,
}

impl<R> ProcessingResult<R> {
    pub fn success(item_id: u64, value: R, duration: Duration, worker_id: impl Into<String>) -> Self {
        ProcessingResult {
            item_id,
            success: true,
            value: Some(value),
            error: None,
            duration,
            worker_id: worker_id.into(),
        }
    }

    pub fn failure(
        item_id: u64,
        error: &TaskError,
        duration: Duration,
        worker_id: impl Into<String>,
    ) -> Self {
        ProcessingResult {
            item_id,
            success: false,
            value: None,
            error: Some(error.to_string()),
            duration,
            worker_id: worker_id.into(),
        }
    }

    pub fn from_outcome(
        item_id: u64,
        outcome: std::result::Result<R, TaskError>,
        duration: Duration,
        worker_id: impl Into<String>,
    ) -> Self {
        match outcome {
            Ok(value) => ProcessingResult::success(item_id, value, duration, worker_id),
            Err(e) => ProcessingResult::failure(item_id, &e, duration, worker_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult<R> {
    pub batch_index: usize,
    pub item_count: usize,
    pub results: Vec<ProcessingResult<R>>,
    #[serde(with = "duration_secs")]
    pub batch_duration: Duration,
}

/// Aggregate view over a result set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed item count per distinct error string.
    pub errors: BTreeMap<String, usize>,
    pub mean_duration_secs: f64,
}

impl ResultSummary {
    pub fn from_results<R>(results: &[ProcessingResult<R>]) -> Self {
        Self::accumulate(results.iter())
    }

    pub fn from_batches<R>(batches: &[BatchResult<R>]) -> Self {
        Self::accumulate(batches.iter().flat_map(|b| b.results.iter()))
    }

    fn accumulate<'a, R: 'a>(results: impl Iterator<Item = &'a ProcessingResult<R>>) -> Self {
        let mut summary = ResultSummary::default();
        let mut total_secs = 0.0;
        for result in results {
            summary.total += 1;
            total_secs += result.duration.as_secs_f64();
            if result.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                let key = result.error.clone().unwrap_or_default();
                *summary.errors.entry(key).or_insert(0) += 1;
            }
        }
        if summary.total > 0 {
            summary.mean_duration_secs = total_secs / summary.total as f64;
        }
        summary
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
