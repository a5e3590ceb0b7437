//! Persistent task records.

use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::storage::{KvStore, SharedStore};

use super::model::{Progress, Task, TaskOptions, TaskStatus};

pub const STORE_NAME: &str = "tasks";

pub struct Keys;

impl Keys {
    pub fn task(id: u64) -> String { format!("task::{:020}", id) }
    pub fn task_prefix() -> &'static str { "task::" }
    pub fn seq() -> &'static str { "task.seq" }
}

fn internal(e: anyhow::Error) -> AppError {
    AppError::internal("task_store".to_string(), e.to_string())
}

fn not_found(id: u64) -> AppError {
    AppError::task_not_found("task_not_found".to_string(), format!("task {} does not exist", id))
}

#[derive(Clone)]
pub struct TaskStore {
    kv: KvStore,
}

impl TaskStore {
    pub fn open(store: &SharedStore, space: &str) -> Self {
        Self { kv: store.kv_store(space, STORE_NAME) }
    }

    /// Record a new task in INIT.
    pub fn create(&self, options: TaskOptions, member: &str, relaunched_from: Option<u64>) -> AppResult<Task> {
        let task = self.kv.transaction(|txn| -> AppResult<Task> {
            let id = txn.incr(Keys::seq(), 1) as u64;
            let now = Utc::now();
            let task = Task {
                id,
                task_type: options.task_type().to_string(),
                status: TaskStatus::Init,
                options,
                progress: Progress::default(),
                result: None,
                error_message: None,
                verbose_result: None,
                member: member.to_string(),
                relaunched_from,
                created_at: now,
                modified_at: now,
                finished_at: None,
            };
            txn.set_json(Keys::task(id), &task).map_err(internal)?;
            Ok(task)
        })?;
        info!(target: "fileplane::tasks", id = task.id, task_type = %task.task_type, member, "task created");
        Ok(task)
    }

    pub fn get(&self, id: u64) -> AppResult<Option<Task>> {
        self.kv.get_json(&Keys::task(id)).map_err(internal)
    }

    pub fn require(&self, id: u64) -> AppResult<Task> {
        self.get(id)?.ok_or_else(|| not_found(id))
    }

    /// All tasks, newest first.
    pub fn list(&self) -> Vec<Task> {
        let mut out: Vec<Task> = self.kv.scan_json(Keys::task_prefix());
        out.reverse();
        out
    }

    /// Read-modify-write of one record under the store lock.
    pub fn update<F>(&self, id: u64, f: F) -> AppResult<Task>
    where
        F: FnOnce(&mut Task) -> AppResult<()>,
    {
        self.kv.transaction(|txn| -> AppResult<Task> {
            let Some(mut t) = txn.get_json::<Task>(&Keys::task(id)).map_err(internal)? else {
                return Err(not_found(id));
            };
            f(&mut t)?;
            t.modified_at = Utc::now();
            txn.set_json(Keys::task(id), &t).map_err(internal)?;
            Ok(t)
        })
    }

    pub fn transition(&self, id: u64, next: TaskStatus) -> AppResult<Task> {
        let t = self.update(id, |t| {
            if !t.status.can_move_to(next) {
                return Err(AppError::task_invalid_state(
                    "bad_transition".to_string(),
                    format!("task {} cannot move from {} to {}", t.id, t.status.as_str(), next.as_str()),
                ));
            }
            t.status = next;
            if next.is_terminal() {
                t.finished_at = Some(Utc::now());
            }
            Ok(())
        })?;
        info!(target: "fileplane::tasks", id, status = next.as_str(), "task transition");
        Ok(t)
    }

    /// Update progress. Fails with TASK_INVALID_STATE once the task is terminal,
    /// which is how a running operation learns it was canceled.
    pub fn set_progress(&self, id: u64, current: u64, total: u64, description: Option<&str>) -> AppResult<Task> {
        self.update(id, |t| {
            if t.status.is_terminal() {
                return Err(AppError::task_invalid_state(
                    if t.status == TaskStatus::Canceled { "task_canceled" } else { "task_finished" }.to_string(),
                    format!("task {} is {}", t.id, t.status.as_str()),
                ));
            }
            t.progress.advance(current, total, description);
            Ok(())
        })
    }

    pub fn is_canceled(&self, id: u64) -> AppResult<bool> {
        Ok(self.require(id)?.status == TaskStatus::Canceled)
    }

    pub fn cancel(&self, id: u64) -> AppResult<Task> {
        let t = self.update(id, |t| {
            if t.status.is_terminal() {
                return Err(AppError::task_invalid_state(
                    "task_terminal".to_string(),
                    format!("task {} is already {}", t.id, t.status.as_str()),
                ));
            }
            t.status = TaskStatus::Canceled;
            t.verbose_result = Some("canceled".to_string());
            t.finished_at = Some(Utc::now());
            Ok(())
        })?;
        info!(target: "fileplane::tasks", id, "task canceled");
        Ok(t)
    }

    pub fn finish_done(&self, id: u64, verbose_result: &str, result: Option<serde_json::Value>, description: Option<&str>) -> AppResult<Task> {
        self.update(id, |t| {
            if !t.status.can_move_to(TaskStatus::Done) {
                return Err(AppError::task_invalid_state(
                    "bad_transition".to_string(),
                    format!("task {} cannot finish from {}", t.id, t.status.as_str()),
                ));
            }
            t.status = TaskStatus::Done;
            let total = t.progress.total;
            let current = t.progress.current;
            t.progress.advance(current, total, description);
            t.verbose_result = Some(verbose_result.to_string());
            t.result = result;
            t.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    pub fn finish_error(&self, id: u64, message: &str) -> AppResult<Task> {
        self.update(id, |t| {
            if t.status.is_terminal() {
                return Ok(());
            }
            t.status = TaskStatus::Error;
            t.error_message = Some(message.to_string());
            t.verbose_result = Some(format!("error: {}", message));
            t.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Drop terminal tasks that finished more than `ttl` ago.
    pub fn gc_expired(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else { return 0 };
        let removed = self.kv.transaction(|txn| {
            let doomed: Vec<String> = txn
                .scan_json::<Task>(Keys::task_prefix())
                .into_iter()
                .filter(|(_, t)| t.status.is_terminal() && t.finished_at.unwrap_or(t.modified_at) < cutoff)
                .map(|(k, _)| k)
                .collect();
            for k in doomed.iter() {
                txn.delete(k);
            }
            doomed.len()
        });
        if removed > 0 {
            info!(target: "fileplane::tasks", removed, "expired tasks collected");
        }
        removed
    }
}
