//! Pool of worker processes speaking the line protocol in [`super::protocol`].
//!
//! Each worker process is owned by one driver task. Drivers pull jobs from a
//! shared queue, so a job is in flight on at most one process at a time. A
//! worker that dies (EOF, unreadable answer) or overruns the item timeout only
//! fails the job it was holding. Crashed workers are respawned while the
//! restart budget lasts; workers killed for a timeout, or because the caller
//! stopped waiting, are always replaced. Jobs nobody waits for are skipped.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::protocol::{TaskRequest, TaskResponse};
use crate::data_model::{ProcessingResult, WorkItem};
use crate::error::{ExecutorError, Result, TaskError};
use crate::processor::RemoteTask;
use crate::utils::prometheus_metrics::{record_item, ACTIVE_ITEMS, WORKER_RESTARTS_TOTAL};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    /// Executable that serves the worker protocol on stdin/stdout.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workers: usize,
    pub item_timeout: Option<Duration>,
    /// Respawns allowed per driver before it retires.
    pub max_restarts: usize,
}

impl ProcessPoolConfig {
    pub fn new(program: impl Into<PathBuf>, workers: usize) -> Self {
        ProcessPoolConfig {
            program: program.into(),
            args: Vec::new(),
            workers,
            item_timeout: None,
            max_restarts: 3,
        }
    }

    pub fn with_item_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ExecutorError::ConfigError(
                "ProcessPoolConfig: workers must be greater than 0".to_string(),
            ));
        }
        if self.item_timeout == Some(Duration::ZERO) {
            return Err(ExecutorError::ConfigError(
                "ProcessPoolConfig: item_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Answer for one job, tagged with the worker that produced it.
#[derive(Debug)]
pub struct Reply {
    pub worker_id: String,
    pub outcome: std::result::Result<Value, TaskError>,
}

struct Job {
    request: TaskRequest,
    reply: oneshot::Sender<Reply>,
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>;

pub struct ProcessPool {
    config: ProcessPoolConfig,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    drivers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl ProcessPool {
    /// Spawns all workers up front so a bad program path fails here rather
    /// than on the first item. Must be called inside a Tokio runtime.
    #[instrument(skip(config), fields(program = %config.program.display(), workers = config.workers))]
    pub fn start(config: ProcessPoolConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut drivers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker = WorkerProcess::spawn(&config, index)?;
            let driver = Driver {
                index,
                config: config.clone(),
                queue: Arc::clone(&queue),
                restarts: 0,
            };
            drivers.push(tokio::spawn(driver.run(worker)));
        }
        info!("Process pool started with {} workers", config.workers);

        Ok(ProcessPool {
            config,
            sender: Mutex::new(Some(sender)),
            drivers: tokio::sync::Mutex::new(drivers),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ProcessPoolConfig {
        &self.config
    }

    /// Sends one request to whichever worker frees up first.
    pub async fn call(&self, task: &str, payload: Value) -> Reply {
        let request = TaskRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            task: task.to_string(),
            payload,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = {
            let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(sender) => sender
                    .send(Job {
                        request,
                        reply: reply_tx,
                    })
                    .is_ok(),
                None => false,
            }
        };
        if !sent {
            return Reply {
                worker_id: "pool".to_string(),
                outcome: Err(TaskError::failed("process pool is not accepting work")),
            };
        }
        // Dropped unanswered only once every driver has retired.
        reply_rx.await.unwrap_or_else(|_| Reply {
            worker_id: "pool".to_string(),
            outcome: Err(TaskError::WorkerCrash {
                worker_id: "pool".to_string(),
                detail: "no live workers left".to_string(),
            }),
        })
    }

    /// Typed call through a [`RemoteTask`] codec, honouring its rate limiter.
    pub async fn call_remote<T, R>(
        &self,
        task: &RemoteTask<T, R>,
        payload: T,
    ) -> (std::result::Result<R, TaskError>, String) {
        if let Some(limiter) = task.limiter() {
            limiter.acquire().await;
        }
        let value = match task.encode(payload) {
            Ok(value) => value,
            Err(e) => return (Err(e), "none".to_string()),
        };
        let reply = self.call(&task.name, value).await;
        let outcome = reply.outcome.and_then(|value| task.decode(value));
        (outcome, reply.worker_id)
    }

    /// Distributes all items across the pool and waits for every answer.
    /// Results come back in completion order.
    pub async fn map<T, R>(
        &self,
        items: Vec<WorkItem<T>>,
        task: &RemoteTask<T, R>,
        cancel: Option<&CancellationToken>,
    ) -> Vec<ProcessingResult<R>> {
        let mut in_flight: FuturesUnordered<_> = items
            .into_iter()
            .map(|item| async move {
                let started = Instant::now();
                let call = self.call_remote(task, item.payload);
                let (outcome, worker_id) = match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => (Err(TaskError::Cancelled), "process".to_string()),
                        reply = call => reply,
                    },
                    None => call.await,
                };
                let result =
                    ProcessingResult::from_outcome(item.id, outcome, started.elapsed(), worker_id);
                record_item("process", result.success, result.duration.as_secs_f64());
                result
            })
            .collect();

        let mut results = Vec::with_capacity(in_flight.len());
        while let Some(result) = in_flight.next().await {
            results.push(result);
        }
        results
    }

    /// Stops accepting jobs, lets queued jobs that still have a caller drain,
    /// then waits for every worker process to exit.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(sender);

        let handles: Vec<JoinHandle<()>> = self.drivers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "process pool driver task failed");
            }
        }
        info!("Process pool shut down");
    }
}

struct Driver {
    index: usize,
    config: ProcessPoolConfig,
    queue: JobQueue,
    restarts: usize,
}

impl Driver {
    async fn run(mut self, first: WorkerProcess) {
        let mut worker = Some(first);
        // Only a crash charges the restart budget; workers killed for a
        // timeout or an abandoned job are replaced for free.
        let mut crashed = false;
        loop {
            let job = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(Job { request, mut reply }) = job else { break };
            if reply.is_closed() {
                debug!(driver = self.index, request = request.id, "skipping abandoned job");
                continue;
            }

            if worker.is_none() {
                match self.respawn(crashed) {
                    Ok(fresh) => {
                        worker = Some(fresh);
                        crashed = false;
                    }
                    Err(detail) => {
                        let _ = reply.send(Reply {
                            worker_id: format!("process-{}", self.index),
                            outcome: Err(TaskError::WorkerCrash {
                                worker_id: format!("process-{}", self.index),
                                detail: detail.clone(),
                            }),
                        });
                        if crashed {
                            warn!(driver = self.index, %detail, "driver retiring");
                            break;
                        }
                        crashed = true;
                        continue;
                    }
                }
            }
            let Some(current) = worker.as_mut() else { break };
            let worker_id = current.id.clone();

            ACTIVE_ITEMS.inc();
            let exchanged = tokio::select! {
                out = current.exchange(&request, self.config.item_timeout) => Some(out),
                _ = reply.closed() => None,
            };
            ACTIVE_ITEMS.dec();

            let outcome = match exchanged {
                None => {
                    debug!(%worker_id, request = request.id, "caller gave up, killing worker");
                    if let Some(stale) = worker.take() {
                        stale.kill().await;
                    }
                    continue;
                }
                Some(Ok(response)) => response.into_result(),
                Some(Err(ExchangeError::Timeout)) => {
                    warn!(%worker_id, request = request.id, "item timed out, killing worker");
                    if let Some(stale) = worker.take() {
                        stale.kill().await;
                    }
                    Err(TaskError::Timeout)
                }
                Some(Err(ExchangeError::Crashed(detail))) => {
                    error!(%worker_id, request = request.id, %detail, "worker process crashed");
                    let mut detail = detail;
                    if let Some(dead) = worker.take() {
                        if let Some(status) = dead.reap().await {
                            detail = format!("{} ({})", detail, status);
                        }
                    }
                    crashed = true;
                    Err(TaskError::WorkerCrash {
                        worker_id: worker_id.clone(),
                        detail,
                    })
                }
            };
            let _ = reply.send(Reply { worker_id, outcome });
        }

        if let Some(worker) = worker {
            worker.stop().await;
        }
        debug!(driver = self.index, "driver finished");
    }

    fn respawn(&mut self, charge: bool) -> std::result::Result<WorkerProcess, String> {
        if charge {
            if self.restarts >= self.config.max_restarts {
                return Err(format!(
                    "restart budget of {} exhausted",
                    self.config.max_restarts
                ));
            }
            self.restarts += 1;
        }
        WORKER_RESTARTS_TOTAL.inc();
        info!(driver = self.index, restarts = self.restarts, charge, "respawning worker process");
        WorkerProcess::spawn(&self.config, self.index).map_err(|e| e.to_string())
    }
}

enum ExchangeError {
    Timeout,
    Crashed(String),
}

struct WorkerProcess {
    id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    fn spawn(config: &ProcessPoolConfig, index: usize) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::WorkerError(format!(
                    "failed to spawn worker '{}': {}",
                    config.program.display(),
                    e
                ))
            })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            ExecutorError::WorkerError("worker stdout was not captured".to_string())
        })?;
        let pid = child.id().unwrap_or_default();
        debug!(index, pid, "spawned worker process");
        Ok(WorkerProcess {
            id: format!("process-{}-{}", index, pid),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn exchange(
        &mut self,
        request: &TaskRequest,
        timeout: Option<Duration>,
    ) -> std::result::Result<TaskResponse, ExchangeError> {
        let mut line = serde_json::to_vec(request)
            .map_err(|e| ExchangeError::Crashed(format!("request encoding failed: {}", e)))?;
        line.push(b'\n');

        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.round_trip(&line))
                .await
                .map_err(|_| ExchangeError::Timeout)??,
            None => self.round_trip(&line).await?,
        };
        if response.id != request.id {
            return Err(ExchangeError::Crashed(format!(
                "protocol desync: expected answer {} got {}",
                request.id, response.id
            )));
        }
        Ok(response)
    }

    async fn round_trip(&mut self, line: &[u8]) -> std::result::Result<TaskResponse, ExchangeError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ExchangeError::Crashed("stdin closed".to_string()))?;
        stdin
            .write_all(line)
            .await
            .map_err(|e| ExchangeError::Crashed(format!("write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| ExchangeError::Crashed(format!("flush failed: {}", e)))?;
        match self.stdout.next_line().await {
            Ok(Some(answer)) => serde_json::from_str::<TaskResponse>(&answer)
                .map_err(|e| ExchangeError::Crashed(format!("unreadable answer: {}", e))),
            Ok(None) => Err(ExchangeError::Crashed("worker closed its output".to_string())),
            Err(e) => Err(ExchangeError::Crashed(format!("read failed: {}", e))),
        }
    }

    async fn reap(mut self) -> Option<String> {
        drop(self.stdin.take());
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => Some(status.to_string()),
            _ => {
                let _ = self.child.kill().await;
                None
            }
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(worker = %self.id, error = %e, "failed to kill worker process");
        }
    }

    /// Closing stdin is the shutdown signal; kill if the worker lingers.
    async fn stop(mut self) {
        drop(self.stdin.take());
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(worker = %self.id, %status, "worker exited"),
            Ok(Err(e)) => warn!(worker = %self.id, error = %e, "failed waiting for worker"),
            Err(_) => {
                warn!(worker = %self.id, "worker ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}
