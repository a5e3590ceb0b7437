//! Reconcile the path index with what the driver actually holds.
//!
//! `sync` walks the storage tree depth-first and upserts every file and directory it
//! finds. It never deletes index nodes; re-running it completes an interrupted pass.

use tracing::info;

use crate::driver::Storage;
use crate::error::AppResult;
use crate::groups::ResourceGroups;
use crate::index::PathIndex;
use crate::paths;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub files: usize,
    pub directories: usize,
}

#[derive(Clone)]
pub struct SyncEngine {
    storage: Storage,
    index: PathIndex,
}

impl SyncEngine {
    pub fn new(storage: Storage, index: PathIndex) -> Self {
        Self { storage, index }
    }

    pub async fn sync(&self, prefix: &str) -> AppResult<SyncReport> {
        self.sync_with(prefix, |_| Ok(())).await
    }

    /// Walk `prefix` and upsert everything below it, calling `on_file` after each file.
    /// An error from `on_file` stops the walk.
    pub async fn sync_with<F>(&self, prefix: &str, mut on_file: F) -> AppResult<SyncReport>
    where
        F: FnMut(&str) -> AppResult<()>,
    {
        let root = paths::to_dir_path(&paths::normalize(prefix)?);
        let mut report = SyncReport::default();
        if root != paths::ROOT {
            self.index.upsert_directory(&root)?;
        }
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let (dirs, files) = self.storage.listdir(&dir).await?;
            let base = paths::dir_prefix(&dir);
            for name in files.iter().filter(|n| !paths::is_system_name(n)) {
                let path = format!("{}{}", base, name);
                let size = self.storage.size(&path).await?;
                self.index.upsert_file(&path, size)?;
                report.files += 1;
                on_file(&path)?;
            }
            // Reverse so the sorted-first directory is visited first
            for name in dirs.iter().rev().filter(|n| !paths::is_system_name(n)) {
                let child = format!("{}{}{}", base, name, paths::DIR_SUFFIX);
                self.index.upsert_directory(&child)?;
                report.directories += 1;
                stack.push(child);
            }
        }
        info!(target: "fileplane::sync", prefix, files = report.files, directories = report.directories, "sync pass finished");
        Ok(report)
    }

    /// Number of non-system files under `prefix`, following the same skip rules as `sync`.
    pub async fn count_files(&self, prefix: &str) -> AppResult<usize> {
        let root = paths::to_dir_path(&paths::normalize(prefix)?);
        let objects = self.storage.walk_files(&root).await?;
        let base = paths::dir_prefix(&root);
        Ok(objects
            .iter()
            .filter(|o| {
                let rel = o.key.strip_prefix(&base).unwrap_or(&o.key);
                !rel.split('/').any(paths::is_system_name)
            })
            .count())
    }

    /// Full rebuild used by the sync task: drop file nodes (and their group
    /// assignments), then walk the space again.
    pub async fn resync_space<F>(&self, space_code: &str, groups: &ResourceGroups, on_file: F) -> AppResult<SyncReport>
    where
        F: FnMut(&str) -> AppResult<()>,
    {
        let removed = self.index.delete_all_file_objects()?;
        let forgotten = groups.forget_nodes(&removed);
        info!(target: "fileplane::sync", space_code, cleared = removed.len(), assignments = forgotten, "file nodes cleared before resync");
        self.sync_with(&format!("{}/", space_code), on_file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SharedStore;

    async fn fixture() -> (tempfile::TempDir, Storage, PathIndex, SyncEngine) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        let index = PathIndex::open(&store, "space00000");
        let storage = Storage::memory(None);
        storage.save("space00000/a.txt", b"hello world").await.unwrap();
        storage.save("space00000/docs/b.csv", b"1,2").await.unwrap();
        storage.save("space00000/docs/deep/c.pdf", b"%PDF").await.unwrap();
        storage.save("space00000/empty/", b"").await.unwrap();
        storage.save("space00000/.system/secret.json", b"{}").await.unwrap();
        let engine = SyncEngine::new(storage.clone(), index.clone());
        (tmp, storage, index, engine)
    }

    fn snapshot(index: &PathIndex) -> Vec<(String, bool, u64)> {
        index.list_nodes("").into_iter().map(|n| (n.path, n.is_file, n.size)).collect()
    }

    #[tokio::test]
    async fn sync_mirrors_storage_and_skips_system_names() {
        let (_t, _s, index, engine) = fixture().await;
        let report = engine.sync("space00000/").await.unwrap();
        assert_eq!(report, SyncReport { files: 3, directories: 3 });
        let a = index.get_by_path("space00000/a.txt").unwrap().unwrap();
        assert_eq!(a.size, 11);
        assert!(index.get_by_path("space00000/docs/deep/*").unwrap().is_some());
        assert!(index.get_by_path("space00000/empty/*").unwrap().is_some());
        assert!(index.get_by_path("space00000/.system/*").unwrap().is_none());
        assert!(index.get_by_path("space00000/empty/.init").unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (_t, _s, index, engine) = fixture().await;
        engine.sync("space00000/").await.unwrap();
        let once = snapshot(&index);
        engine.sync("space00000/*").await.unwrap();
        assert_eq!(snapshot(&index), once);
    }

    #[tokio::test]
    async fn sync_keeps_nodes_missing_from_storage() {
        let (_t, storage, index, engine) = fixture().await;
        engine.sync("space00000/").await.unwrap();
        storage.delete("space00000/a.txt").await.unwrap();
        engine.sync("space00000/").await.unwrap();
        assert!(index.get_by_path("space00000/a.txt").unwrap().is_some());
    }

    #[tokio::test]
    async fn callback_error_interrupts_and_rerun_completes() {
        let (_t, _s, index, engine) = fixture().await;
        let mut seen = 0;
        let err = engine
            .sync_with("space00000/", |_| {
                seen += 1;
                if seen == 2 {
                    return Err(crate::error::AppError::internal("stop".to_string(), "stop".to_string()));
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "stop");
        engine.sync("space00000/").await.unwrap();
        assert_eq!(index.list_nodes("").iter().filter(|n| n.is_file).count(), 3);
    }

    #[tokio::test]
    async fn resync_drops_stale_files_and_counts() {
        let (tmp, storage, index, engine) = fixture().await;
        let groups = ResourceGroups::open(&SharedStore::new(tmp.path().join("groups")).unwrap(), "space00000", index.clone());
        engine.sync("space00000/").await.unwrap();
        storage.delete("space00000/a.txt").await.unwrap();
        assert_eq!(engine.count_files("space00000/").await.unwrap(), 2);
        let report = engine.resync_space("space00000", &groups, |_| Ok(())).await.unwrap();
        assert_eq!(report.files, 2);
        assert!(index.get_by_path("space00000/a.txt").unwrap().is_none());
    }
}
