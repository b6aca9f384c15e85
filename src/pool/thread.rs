//! Fixed-size pool of OS threads draining one shared FIFO queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span};

use crate::data_model::{ProcessingResult, WorkItem};
use crate::error::{ExecutorError, Result, TaskError};
use crate::processor::{call_async, call_blocking, Processor};
use crate::utils::prometheus_metrics::{record_item, ACTIVE_ITEMS};

/// How long an idle worker waits on the queue before re-checking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Shared<T, R> {
    queue: Mutex<VecDeque<WorkItem<T>>>,
    available: Condvar,
    stop: AtomicBool,
    results: Mutex<Vec<ProcessingResult<R>>>,
    running: Mutex<usize>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct WorkerContext<T, R> {
    processor: Processor<T, R>,
    item_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    runtime: Option<Handle>,
}

impl<T, R> Clone for WorkerContext<T, R> {
    fn clone(&self) -> Self {
        WorkerContext {
            processor: self.processor.clone(),
            item_timeout: self.item_timeout,
            cancel: self.cancel.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

pub struct WorkerPool<T, R> {
    shared: Arc<Shared<T, R>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Starts `workers` threads. Async processors are driven on the worker
    /// threads through the current Tokio runtime handle; remote tasks are
    /// refused since they belong on the process strategy.
    pub fn start(
        workers: usize,
        processor: Processor<T, R>,
        item_timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(ExecutorError::ConfigError(
                "WorkerPool: workers must be greater than 0".to_string(),
            ));
        }
        let runtime = match &processor {
            Processor::Blocking(_) => None,
            Processor::Async(_) => Some(Handle::try_current().map_err(|_| {
                ExecutorError::ConfigError(
                    "WorkerPool: async processors need a Tokio runtime".to_string(),
                )
            })?),
            Processor::Remote(task) => {
                return Err(ExecutorError::ConfigError(format!(
                    "WorkerPool: remote task '{}' must run on the process or async strategy",
                    task.name
                )))
            }
        };

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
            running: Mutex::new(0),
        });
        let context = WorkerContext {
            processor,
            item_timeout,
            cancel,
            runtime,
        };

        let mut pool = WorkerPool {
            shared,
            handles: Vec::with_capacity(workers),
        };
        for index in 0..workers {
            let shared = Arc::clone(&pool.shared);
            let context = context.clone();
            let handle = std::thread::Builder::new()
                .name(format!("taskblaster-worker-{}", index))
                .spawn(move || worker_loop(index, shared, context));
            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    // Do not leave the threads we already started behind.
                    pool.signal_stop();
                    pool.join_all();
                    return Err(ExecutorError::from(e));
                }
            }
        }
        info!("Worker pool started with {} threads", workers);
        Ok(pool)
    }

    pub fn submit(&self, item: WorkItem<T>) {
        lock(&self.shared.queue).push_back(item);
        self.shared.available.notify_one();
    }

    pub fn submit_all(&self, items: impl IntoIterator<Item = WorkItem<T>>) {
        lock(&self.shared.queue).extend(items);
        self.shared.available.notify_all();
    }

    /// Workers currently executing an item.
    pub fn running_workers(&self) -> usize {
        *lock(&self.shared.running)
    }

    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
    }

    fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked outside item processing");
            }
        }
    }

    /// Signals stop, lets the workers drain what is queued, joins every
    /// thread and hands back all results.
    pub fn shutdown(mut self) -> Vec<ProcessingResult<R>> {
        self.signal_stop();
        self.join_all();
        let results = std::mem::take(&mut *lock(&self.shared.results));
        info!("Worker pool shut down with {} results", results.len());
        results
    }
}

impl<T, R> Drop for WorkerPool<T, R> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shared.stop.store(true, Ordering::SeqCst);
            self.shared.available.notify_all();
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn next_item<T, R>(shared: &Shared<T, R>) -> Option<WorkItem<T>> {
    let mut queue = lock(&shared.queue);
    loop {
        if let Some(item) = queue.pop_front() {
            return Some(item);
        }
        if shared.stop.load(Ordering::SeqCst) {
            return None;
        }
        queue = match shared.available.wait_timeout(queue, POLL_INTERVAL) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

fn worker_loop<T, R>(index: usize, shared: Arc<Shared<T, R>>, context: WorkerContext<T, R>) {
    let worker_id = format!("thread-{}", index);
    let span = info_span!("thread_worker", worker = %worker_id);
    let _enter = span.enter();
    debug!("worker started");

    while let Some(item) = next_item(&shared) {
        *lock(&shared.running) += 1;
        ACTIVE_ITEMS.inc();

        let started = Instant::now();
        let cancelled = context
            .cancel
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false);
        let outcome = if cancelled {
            Err(TaskError::Cancelled)
        } else {
            run_item(&context, item.payload)
        };
        let elapsed = started.elapsed();
        // Threads cannot be preempted; a late answer is discarded.
        let outcome = match context.item_timeout {
            Some(limit) if elapsed > limit && outcome.is_ok() => Err(TaskError::Timeout),
            _ => outcome,
        };

        let result = ProcessingResult::from_outcome(item.id, outcome, elapsed, worker_id.as_str());
        record_item("thread", result.success, elapsed.as_secs_f64());
        lock(&shared.results).push(result);

        ACTIVE_ITEMS.dec();
        *lock(&shared.running) -= 1;
    }
    debug!("worker stopped");
}

fn run_item<T, R>(context: &WorkerContext<T, R>, payload: T) -> std::result::Result<R, TaskError> {
    match (&context.processor, &context.runtime) {
        (Processor::Blocking(f), _) => call_blocking(f, payload),
        (Processor::Async(f), Some(handle)) => {
            let f = Arc::clone(f);
            handle.block_on(async move { call_async(&f, payload).await })
        }
        (Processor::Async(_), None) => Err(TaskError::failed("no runtime for async processor")),
        (Processor::Remote(task), _) => Err(TaskError::failed(format!(
            "remote task '{}' cannot run on a thread worker",
            task.name
        ))),
    }
}
