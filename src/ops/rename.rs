use tracing::info;

use crate::error::{AppError, AppResult};
use crate::paths;
use crate::tasks::{Outcome, TaskHandle};

use super::{Item, Operations};

const TASK_TYPE: &str = "rename_directory_in_storage";

/// A new name is one visible segment.
pub fn validate_new_name(new_name: &str) -> AppResult<()> {
    let trimmed = new_name.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("new_name", "new_name: may not be blank"));
    }
    if trimmed.contains('/') || trimmed == "." || trimmed == ".." {
        return Err(AppError::validation(
            "new_name".to_string(),
            format!("new_name: '{}' must be a single path segment", new_name),
        ));
    }
    if paths::is_system_name(trimmed) {
        return Err(AppError::validation(
            "new_name".to_string(),
            format!("new_name: '{}' is a reserved system name", new_name),
        ));
    }
    paths::validate_wire_path(trimmed)
}

impl Operations {
    pub async fn rename(&self, path: &str, new_name: &str, handle: &TaskHandle) -> AppResult<Outcome> {
        validate_new_name(new_name)?;
        let new_name = new_name.trim();
        match self.classify(path).await? {
            Item::File(key) => {
                let parent = match key.rsplit_once('/') {
                    Some((p, _)) => format!("{}/", p),
                    None => String::new(),
                };
                let dest = format!("{}{}", parent, new_name);
                if dest == key {
                    return Ok(Outcome::new("renamed file").described(format!("{} finished", TASK_TYPE)));
                }
                if self.storage().exists(&dest).await? || self.storage().dir_exists(&format!("{}/", dest)).await? {
                    return Err(AppError::conflict(
                        "rename_target_exists".to_string(),
                        format!("'{}' already exists", dest),
                    ));
                }
                handle.progress(0, 1, &format!("{} starting", TASK_TYPE))?;
                let bytes = self.storage().open(&key).await?;
                self.storage().save(&dest, &bytes).await?;
                self.storage().delete(&key).await?;
                let size = self.storage().size(&dest).await?;
                self.reindex_file(Some(&key), &dest, size)?;
                info!(target: "fileplane::ops", from = %key, to = %dest, "file renamed");
                let finished = format!("{} finished", TASK_TYPE);
                handle.progress(1, 1, &finished)?;
                Ok(Outcome::new("renamed file").described(finished))
            }
            Item::Dir(src) => {
                let body = src.trim_end_matches('/');
                let parent = match body.rsplit_once('/') {
                    Some((p, _)) => format!("{}/", p),
                    None => String::new(),
                };
                let dest = format!("{}{}/", parent, new_name);
                if dest == src {
                    return Ok(Outcome::new("renamed directory").described(format!("{} finished", TASK_TYPE)));
                }
                if self.storage().dir_exists(&dest).await? || self.storage().exists(dest.trim_end_matches('/')).await? {
                    return Err(AppError::conflict(
                        "rename_target_exists".to_string(),
                        format!("'{}' already exists", dest),
                    ));
                }
                let objects = self.storage().walk_files(&src).await?;
                let visible = |rel: &str| !rel.split('/').any(paths::is_system_name);
                let total = objects.iter().filter(|o| visible(o.key.strip_prefix(&src).unwrap_or(&o.key))).count() as u64;
                handle.progress(0, total, &format!("{} starting", TASK_TYPE))?;

                self.index().upsert_directory(&dest)?;
                let mut current = 0u64;
                for obj in objects.iter() {
                    let rel = obj.key.strip_prefix(&src).unwrap_or(&obj.key);
                    let to = format!("{}{}", dest, rel);
                    let bytes = self.storage().open(&obj.key).await?;
                    self.storage().save(&to, &bytes).await?;
                    self.storage().delete(&obj.key).await?;
                    if paths::basename(rel) == paths::INIT_MARKER {
                        let dir = to.strip_suffix(paths::INIT_MARKER).unwrap_or(&to);
                        self.index().upsert_directory(dir)?;
                    } else if visible(rel) {
                        let size = self.storage().size(&to).await?;
                        self.reindex_file(Some(&obj.key), &to, size)?;
                        current += 1;
                        handle.progress(current, total, &format!("{} in progress", TASK_TYPE))?;
                    }
                }
                self.storage().delete_directory(&src).await?;
                let old_dir = paths::to_dir_path(&src);
                if let Some(old) = self.index().get_by_path(&old_dir)? {
                    if !old.resource_groups.is_empty() {
                        let fresh = self.index().upsert_directory(&dest)?;
                        self.groups().set_groups(&fresh, &old.resource_groups)?;
                    }
                }
                self.drop_index_path(&old_dir)?;
                info!(target: "fileplane::ops", from = %src, to = %dest, files = total, "directory renamed");
                let finished = format!("{} finished", TASK_TYPE);
                handle.progress(total, total, &finished)?;
                Ok(Outcome::new("renamed directory").described(finished))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::validate_new_name;

    #[test]
    fn new_name_is_one_visible_segment() {
        assert!(validate_new_name("report 2024.csv").is_ok());
        for bad in ["", "  ", "a/b", "..", ".hidden", "x:y"] {
            assert!(validate_new_name(bad).is_err(), "{:?} should be rejected", bad);
        }
    }
}
