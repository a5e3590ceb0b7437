//! Move and copy of files and directory trees.
//!
//! Planning happens first: every source is resolved and expanded into per-object
//! steps, so the file-count guardrail fires before a single byte is copied.

use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::paths;
use crate::tasks::{Outcome, TaskHandle};

use super::{Item, Operations};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Move,
    Copy,
}

impl TransferMode {
    pub fn task_type(&self) -> &'static str {
        match self {
            TransferMode::Move => "move_directory_in_storage",
            TransferMode::Copy => "copy_directory_in_storage",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            TransferMode::Move => "moved",
            TransferMode::Copy => "copied",
        }
    }
}

/// One object to carry over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Step {
    pub from: String,
    pub to: String,
    /// Counted towards progress; sentinels and dot-files travel silently
    pub visible: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub steps: Vec<Step>,
    /// Source directories (key prefixes) to clear after a move
    pub source_dirs: Vec<String>,
    /// Destination directories to index even when empty
    pub dest_dirs: Vec<String>,
}

impl Plan {
    pub fn total(&self) -> usize {
        self.steps.iter().filter(|s| s.visible).count()
    }
}

/// `<stem>_copy(<n>)<ext>` for files, `<name>_copy(<n>)/` for directories, smallest free n.
pub(crate) async fn free_copy_name(ops: &Operations, dest: &str) -> AppResult<String> {
    let is_dir = dest.ends_with('/');
    let body = dest.trim_end_matches('/');
    let (parent, name) = match body.rsplit_once('/') {
        Some((p, n)) => (format!("{}/", p), n),
        None => (String::new(), body),
    };
    if name.starts_with('.') {
        return Ok(dest.to_string());
    }
    let (stem, ext) = if is_dir {
        (name, "/".to_string())
    } else {
        match name.split_once('.') {
            Some((s, e)) => (s, format!(".{}", e)),
            None => (name, String::new()),
        }
    };
    let mut n = 1u32;
    loop {
        let candidate = format!("{}{}_copy({}){}", parent, stem, n, ext);
        if !ops.storage().exists(&candidate).await? {
            return Ok(candidate);
        }
        n += 1;
    }
}

impl Operations {
    pub(crate) async fn plan_transfer(&self, mode: TransferMode, target: &str, items: &[String]) -> AppResult<Plan> {
        let target_prefix = paths::dir_prefix(&paths::to_dir_path(target));
        let mut plan = Plan::default();
        for raw in items {
            match self.classify(raw).await? {
                Item::File(key) => {
                    let mut to = format!("{}{}", target_prefix, paths::basename(&key));
                    if mode == TransferMode::Copy && self.storage().exists(&to).await? {
                        to = free_copy_name(self, &to).await?;
                    }
                    let visible = !paths::is_system_name(paths::basename(&key));
                    plan.steps.push(Step { from: key, to, visible });
                }
                Item::Dir(src) => {
                    let mut dest = format!("{}{}", target_prefix, paths::last_dir_name(&src));
                    if mode == TransferMode::Copy && self.storage().dir_exists(&dest).await? {
                        dest = free_copy_name(self, &dest).await?;
                    }
                    for obj in self.storage().walk_files(&src).await? {
                        let rel = obj.key.strip_prefix(&src).unwrap_or(&obj.key).to_string();
                        let visible = !rel.split('/').any(paths::is_system_name);
                        plan.steps.push(Step { from: obj.key.clone(), to: format!("{}{}", dest, rel), visible });
                    }
                    plan.source_dirs.push(src);
                    plan.dest_dirs.push(dest);
                }
            }
        }
        Ok(plan)
    }

    pub async fn transfer(&self, mode: TransferMode, target: &str, items: &[String], handle: &TaskHandle) -> AppResult<Outcome> {
        let task_type = mode.task_type();
        self.validate_transfer(target, items).await?;
        let plan = self.plan_transfer(mode, target, items).await?;
        let total = plan.total();
        if total > self.max_files {
            return Err(AppError::too_many_files(
                "too_many_files".to_string(),
                format!("{} files selected, at most {} can be {} at once", total, self.max_files, mode.verb()),
            ));
        }
        let total = total as u64;
        handle.progress(0, total, &format!("{} starting", task_type))?;
        info!(target: "fileplane::ops", kind = task_type, steps = plan.steps.len(), files = total, "transfer planned");

        let mut current = 0u64;
        for step in plan.steps.iter() {
            let bytes = self.storage().open(&step.from).await?;
            self.storage().save(&step.to, &bytes).await?;
            if mode == TransferMode::Move {
                self.storage().delete(&step.from).await?;
            }
            self.reindex_step(mode, step).await?;
            debug!(target: "fileplane::ops", from = %step.from, to = %step.to, "object transferred");
            if step.visible {
                current += 1;
                handle.progress(current, total, &format!("{} in progress", task_type))?;
            }
        }

        for dest in plan.dest_dirs.iter() {
            self.index().upsert_directory(dest)?;
        }
        if mode == TransferMode::Move {
            for src in plan.source_dirs.iter() {
                self.storage().delete_directory(src).await?;
                self.drop_index_path(&paths::to_dir_path(src))?;
            }
        }

        let finished = format!("{} finished", task_type);
        handle.progress(total, total, &finished)?;
        Ok(Outcome::new(format!("{} {} items", mode.verb(), total)).described(finished))
    }

    async fn reindex_step(&self, mode: TransferMode, step: &Step) -> AppResult<()> {
        let name = paths::basename(&step.to);
        if name == paths::INIT_MARKER {
            let dir = step.to.strip_suffix(paths::INIT_MARKER).unwrap_or(&step.to);
            self.index().upsert_directory(dir)?;
            return Ok(());
        }
        if !step.visible {
            return Ok(());
        }
        let size = self.storage().size(&step.to).await?;
        let from = match mode {
            TransferMode::Move => Some(step.from.as_str()),
            TransferMode::Copy => None,
        };
        self.reindex_file(from, &step.to, size)?;
        Ok(())
    }
}
