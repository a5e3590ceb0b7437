use tracing::{debug, info};

use crate::driver::archive::{self, ArchiveEntry};
use crate::error::{AppError, AppResult};
use crate::paths;
use crate::tasks::{Outcome, TaskHandle};

use super::Operations;

const TASK_TYPE: &str = "unzip_file_in_storage";

/// Archive members written by macOS and similar tools, never extracted.
pub fn is_skipped_entry(name: &str) -> bool {
    name.starts_with("__") || name.starts_with("._")
}

impl Operations {
    pub async fn unzip(&self, file_path: &str, target: &str, handle: &TaskHandle) -> AppResult<Outcome> {
        if !file_path.to_lowercase().ends_with(".zip") {
            return Err(AppError::validation(
                "file_path".to_string(),
                format!("file_path: '{}' should be a zip file, with '.zip' extension", file_path),
            ));
        }
        let target_dir = paths::to_dir_path(target);
        if !self.directory_exists(&target_dir).await? {
            return Err(AppError::validation(
                "target_directory_path".to_string(),
                format!("target_directory_path: target folder '{}' does not exist", paths::dir_prefix(&target_dir)),
            ));
        }
        let dest_prefix = paths::dir_prefix(&target_dir);
        handle.progress(0, 1, &format!("{} starting", TASK_TYPE))?;

        let bytes = self.storage().open(file_path).await?;
        let entries: Vec<ArchiveEntry> = tokio::task::spawn_blocking(move || archive::entries(&bytes))
            .await
            .map_err(|e| AppError::internal("unzip_join".to_string(), e.to_string()))??;
        let kept: Vec<ArchiveEntry> = entries
            .into_iter()
            .filter(|e| {
                let skip = is_skipped_entry(&e.name);
                if skip {
                    debug!(target: "fileplane::ops", entry = %e.name, "skipping system entry");
                }
                !skip
            })
            .collect();
        let total = kept.len() as u64;
        handle.progress(0, total, &format!("{} in progress", TASK_TYPE))?;

        let mut current = 0u64;
        for entry in kept.iter() {
            let dest = paths::normalize(&format!("{}{}", dest_prefix, entry.name))?;
            if entry.is_dir {
                self.storage().save(&dest, b"").await?;
                self.index().upsert_directory(&dest)?;
            } else {
                self.storage().save(&dest, &entry.data).await?;
                if !paths::split_segments(&dest).iter().any(|s| paths::is_system_name(s)) {
                    let size = self.storage().size(&dest).await?;
                    self.reindex_file(None, &dest, size)?;
                }
            }
            current += 1;
            handle.progress(current, total, &format!("{} in progress", TASK_TYPE))?;
        }
        info!(target: "fileplane::ops", zip = file_path, into = %dest_prefix, entries = total, "archive extracted");
        let finished = format!("{} finished", TASK_TYPE);
        handle.progress(total, total, &finished)?;
        Ok(Outcome::new(format!("unzip {} to {}", file_path, dest_prefix)).described(finished))
    }
}
