//! Worker pool draining the task queue.
//!
//! Workers share one queue receiver. Each task runs sequentially inside its worker;
//! failures and panics are recorded on the task and never reach the runtime.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};

use super::model::{Task, TaskOptions, TaskStatus};
use super::store::TaskStore;

/// What a finished operation reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub verbose_result: String,
    pub result: Option<serde_json::Value>,
    /// Final progress description, when the operation has one
    pub description: Option<String>,
}

impl Outcome {
    pub fn new(verbose_result: impl Into<String>) -> Self {
        Outcome { verbose_result: verbose_result.into(), ..Outcome::default() }
    }

    pub fn described(mut self, d: impl Into<String>) -> Self {
        self.description = Some(d.into());
        self
    }

    pub fn with_result(mut self, v: serde_json::Value) -> Self {
        self.result = Some(v);
        self
    }
}

/// Progress and cancellation hook handed to a running operation.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    store: TaskStore,
}

impl TaskHandle {
    pub fn new(id: u64, store: TaskStore) -> Self { Self { id, store } }

    pub fn id(&self) -> u64 { self.id }

    /// Record progress. Errors once the task has been canceled; callers stop on `?`.
    pub fn progress(&self, current: u64, total: u64, description: &str) -> AppResult<()> {
        self.store.set_progress(self.id, current, total, Some(description)).map(|_| ())
    }

    pub fn check_canceled(&self) -> AppResult<()> {
        if self.store.is_canceled(self.id)? {
            return Err(AppError::task_invalid_state("task_canceled".to_string(), format!("task {} was canceled", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &Task, handle: &TaskHandle) -> AppResult<Outcome>;
}

#[derive(Clone)]
pub struct TaskRunner {
    store: TaskStore,
    tx: mpsc::UnboundedSender<u64>,
    finished: Arc<Notify>,
}

impl TaskRunner {
    /// Spawn `workers` workers on the current runtime.
    pub fn start(store: TaskStore, executor: Arc<dyn TaskExecutor>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<u64>();
        let rx = Arc::new(Mutex::new(rx));
        let finished = Arc::new(Notify::new());
        for n in 0..workers.max(1) {
            let rx = rx.clone();
            let store = store.clone();
            let executor = executor.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(id) = next else { break };
                    run_one(&store, executor.as_ref(), id).await;
                    finished.notify_waiters();
                }
                info!(target: "fileplane::tasks", worker = n, "task worker stopped");
            });
        }
        Self { store, tx, finished }
    }

    pub fn store(&self) -> &TaskStore { &self.store }

    /// Create the record and queue it.
    pub fn submit(&self, options: TaskOptions, member: &str) -> AppResult<Task> {
        let task = self.store.create(options, member, None)?;
        self.enqueue(task)
    }

    fn enqueue(&self, task: Task) -> AppResult<Task> {
        let task = self.store.transition(task.id, TaskStatus::Pending)?;
        if self.tx.send(task.id).is_err() {
            self.store.finish_error(task.id, "task queue is closed")?;
            return Err(AppError::internal("queue_closed".to_string(), "task queue is closed".to_string()));
        }
        Ok(task)
    }

    /// Submit a new task of the same kind, with the original or overridden options.
    pub fn relaunch(&self, id: u64, options: Option<serde_json::Value>, member: &str) -> AppResult<Task> {
        let original = self.store.require(id)?;
        let options = match options {
            None => original.options.clone(),
            Some(mut v) => {
                let Some(obj) = v.as_object_mut() else {
                    return Err(AppError::validation("options".to_string(), "options: expected an object".to_string()));
                };
                let kind = original.options.kind();
                match obj.get("kind").and_then(|k| k.as_str()) {
                    None => {
                        obj.insert("kind".to_string(), serde_json::Value::String(kind.to_string()));
                    }
                    Some(k) if k == kind => {}
                    Some(k) => {
                        return Err(AppError::validation(
                            "options".to_string(),
                            format!("options: kind '{}' does not match task kind '{}'", k, kind),
                        ))
                    }
                }
                serde_json::from_value::<TaskOptions>(v)?
            }
        };
        let task = self.store.create(options, member, Some(original.id))?;
        info!(target: "fileplane::tasks", id = task.id, from = original.id, "task relaunched");
        self.enqueue(task)
    }

    pub fn cancel(&self, id: u64) -> AppResult<Task> {
        self.store.cancel(id)
    }

    /// Wait until the task is terminal or `timeout` passes; returns the latest record.
    pub async fn wait_terminal(&self, id: u64, timeout: Duration) -> AppResult<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            let t = self.store.require(id)?;
            if t.status.is_terminal() {
                return Ok(t);
            }
            // Poll as a fallback so a cancel from another path is also seen
            let tick = tokio::time::Instant::now() + Duration::from_millis(50);
            if tokio::time::timeout_at(deadline.min(tick), notified).await.is_err() && tokio::time::Instant::now() >= deadline {
                return self.store.require(id);
            }
        }
    }

    /// Periodically collect expired tasks.
    pub fn spawn_gc(&self, every: Duration, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.gc_expired(ttl);
            }
        })
    }
}

async fn run_one(store: &TaskStore, executor: &dyn TaskExecutor, id: u64) {
    let task = match store.require(id) {
        Ok(t) => t,
        Err(e) => {
            warn!(target: "fileplane::tasks", id, error = %e, "queued task vanished");
            return;
        }
    };
    if task.status != TaskStatus::Pending {
        info!(target: "fileplane::tasks", id, status = task.status.as_str(), "skipping task that is no longer pending");
        return;
    }
    let task = match store.transition(id, TaskStatus::Running) {
        Ok(t) => t,
        Err(e) => {
            warn!(target: "fileplane::tasks", id, error = %e, "could not start task");
            return;
        }
    };
    let handle = TaskHandle::new(id, store.clone());
    let fut = executor.execute(&task, &handle);
    let outcome = AssertUnwindSafe(fut).catch_unwind().await;
    let canceled = store.is_canceled(id).unwrap_or(false);
    let recorded = match outcome {
        Ok(Ok(out)) if !canceled => {
            store.finish_done(id, &out.verbose_result, out.result, out.description.as_deref()).map(|t| {
                info!(target: "fileplane::tasks", id, verbose = ?t.verbose_result, "task done");
            })
        }
        Ok(_) if canceled => {
            info!(target: "fileplane::tasks", id, "task stopped after cancellation");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(target: "fileplane::tasks", id, error = %e, "task failed");
            store.finish_error(id, e.message()).map(|_| ())
        }
        Ok(Ok(_)) => Ok(()),
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() { s.to_string() }
                      else if let Some(s) = panic_payload.downcast_ref::<String>() { s.clone() }
                      else { "panic".to_string() };
            error!(target: "panic", "task {} panicked: {}", id, msg);
            store.finish_error(id, &format!("internal error: {}", msg)).map(|_| ())
        }
    };
    if let Err(e) = recorded {
        error!(target: "fileplane::tasks", id, error = %e, "could not record task outcome");
    }
}
