//! Long-running storage operations executed by the task workers.
//!
//! Each operation reports progress through its `TaskHandle` after every file, which is
//! also where cancellation is observed. Partial work is left in place on error or
//! cancellation; the index is updated file by file alongside the driver.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::driver::Storage;
use crate::error::{AppError, AppResult};
use crate::groups::ResourceGroups;
use crate::index::{PathIndex, StorageNode};
use crate::paths;
use crate::records::RecordStore;
use crate::sync::SyncEngine;
use crate::tasks::{Outcome, Task, TaskExecutor, TaskHandle, TaskOptions};

pub mod transfer;
pub mod rename;
pub mod unzip;
pub mod bulk;

pub use transfer::TransferMode;

/// Guardrail on the number of files a single move or copy may touch.
pub const MAX_FILES: usize = 10_000;

/// A source resolved against the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Object key of a file
    File(String),
    /// Directory key prefix, with a trailing `/`
    Dir(String),
}

impl Item {
    pub fn name(&self) -> &str {
        match self {
            Item::File(k) | Item::Dir(k) => paths::basename(k),
        }
    }

    /// Index form: `a/b.txt` or `a/b/*`.
    pub fn index_path(&self) -> String {
        match self {
            Item::File(k) => k.clone(),
            Item::Dir(k) => paths::to_dir_path(k),
        }
    }
}

#[derive(Clone)]
pub struct Operations {
    storage: Storage,
    index: PathIndex,
    groups: ResourceGroups,
    records: RecordStore,
    sync: SyncEngine,
    max_files: usize,
}

impl Operations {
    pub fn new(storage: Storage, index: PathIndex, groups: ResourceGroups, records: RecordStore) -> Self {
        let sync = SyncEngine::new(storage.clone(), index.clone());
        Self { storage, index, groups, records, sync, max_files: MAX_FILES }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn storage(&self) -> &Storage { &self.storage }

    pub fn index(&self) -> &PathIndex { &self.index }

    pub fn groups(&self) -> &ResourceGroups { &self.groups }

    pub fn records(&self) -> &RecordStore { &self.records }

    pub fn sync_engine(&self) -> &SyncEngine { &self.sync }

    /// Decide whether `path` names a file or a directory in storage.
    pub async fn classify(&self, path: &str) -> AppResult<Item> {
        let explicit_dir = paths::is_dir(path) || path.ends_with('/');
        let body = path.strip_suffix(paths::DIR_SUFFIX).unwrap_or(path).trim_end_matches('/');
        if body.is_empty() {
            return Err(AppError::invalid_path("root_path", "the storage root cannot be an operation source"));
        }
        if !explicit_dir && self.storage.exists(body).await? {
            return Ok(Item::File(body.to_string()));
        }
        let prefix = format!("{}/", body);
        if self.storage.dir_exists(&prefix).await? {
            return Ok(Item::Dir(prefix));
        }
        Err(AppError::not_found("path_not_found".to_string(), format!("'{}' does not exist", body)))
    }

    /// A target directory counts as present when the driver or the index knows it.
    pub async fn directory_exists(&self, dir: &str) -> AppResult<bool> {
        let dir = paths::to_dir_path(dir);
        if self.storage.dir_exists(&dir).await? {
            return Ok(true);
        }
        Ok(self.index.get_by_path(&dir)?.is_some())
    }

    /// Checks shared by the request boundary and the worker: the target must exist,
    /// and no item may be the target or already live under it.
    pub async fn validate_transfer(&self, target: &str, items: &[String]) -> AppResult<()> {
        let target = paths::to_dir_path(target);
        if !self.directory_exists(&target).await? {
            return Err(AppError::validation(
                "target_directory_path".to_string(),
                format!("target_directory_path: target directory '{}' does not exist", paths::dir_prefix(&target)),
            ));
        }
        if items.is_empty() {
            return Err(AppError::validation("items", "items: at least one path is required"));
        }
        for item in items {
            let as_dir = paths::to_dir_path(item);
            if as_dir == target {
                return Err(AppError::validation(
                    "items".to_string(),
                    format!("items: '{}' is the target directory itself", item),
                ));
            }
            if paths::starts_with_dir(item, &target) {
                return Err(AppError::validation(
                    "items".to_string(),
                    format!("items: '{}' already belongs to the target directory", item),
                ));
            }
            if paths::starts_with_dir(&target, &as_dir) {
                return Err(AppError::validation(
                    "items".to_string(),
                    format!("items: cannot place '{}' inside itself", item),
                ));
            }
        }
        Ok(())
    }

    /// Carry a file node to its new path, keeping its resource groups.
    pub(crate) fn reindex_file(&self, from: Option<&str>, to: &str, size: u64) -> AppResult<StorageNode> {
        let old = match from {
            Some(p) => self.index.get_by_path(p)?,
            None => None,
        };
        let mut node = self.index.upsert_file(to, size)?;
        if let Some(old) = old {
            if !old.resource_groups.is_empty() {
                node = self.groups.set_groups(&node, &old.resource_groups)?;
            }
            if old.path != node.path {
                self.drop_index_path(&old.path)?;
            }
        }
        Ok(node)
    }

    /// Remove a node (and its subtree) together with its group assignments.
    pub(crate) fn drop_index_path(&self, path: &str) -> AppResult<usize> {
        let removed = self.index.delete_by_path(path)?;
        self.groups.forget_nodes(&removed);
        Ok(removed.len())
    }

    async fn sync_space(&self, space_code: &str, handle: &TaskHandle) -> AppResult<Outcome> {
        let task_type = "sync_storage_with_database";
        let root = format!("{}/", space_code);
        let total = self.sync.count_files(&root).await? as u64;
        handle.progress(0, total, &format!("{} starting", task_type))?;
        let mut current = 0u64;
        let report = self
            .sync
            .resync_space(space_code, &self.groups, |_| {
                current += 1;
                handle.progress(current.min(total), total, &format!("{} in progress", task_type))
            })
            .await?;
        handle.progress(total, total, &format!("{} finished", task_type))?;
        Ok(Outcome::new(format!("synced {} files", total))
            .described(format!("{} finished", task_type))
            .with_result(serde_json::json!({"files": report.files, "directories": report.directories})))
    }
}

#[async_trait]
impl TaskExecutor for Operations {
    async fn execute(&self, task: &Task, handle: &TaskHandle) -> AppResult<Outcome> {
        info!(target: "fileplane::ops", id = task.id, kind = task.task_type.as_str(), "operation starting");
        let out = match &task.options {
            TaskOptions::Move { target_directory_path, items } => {
                self.transfer(TransferMode::Move, target_directory_path, items, handle).await
            }
            TaskOptions::Copy { target_directory_path, items } => {
                self.transfer(TransferMode::Copy, target_directory_path, items, handle).await
            }
            TaskOptions::Rename { path, new_name } => self.rename(path, new_name, handle).await,
            TaskOptions::Unzip { file_path, target_directory_path } => {
                self.unzip(file_path, target_directory_path, handle).await
            }
            TaskOptions::Sync { space_code } => self.sync_space(space_code, handle).await,
            TaskOptions::BulkDelete { content_type, ids } => self.bulk_delete(content_type, ids, handle).await,
        };
        if let Err(e) = &out {
            warn!(target: "fileplane::ops", id = task.id, kind = task.task_type.as_str(), error = %e, "operation stopped");
        }
        out
    }
}

#[cfg(test)]
mod ops_tests;
