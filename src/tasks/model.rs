use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Init,
    Pending,
    Running,
    Done,
    Error,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Init => "INIT",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Error => "ERROR",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    /// Forward-only lifecycle; cancellation and failure are reachable from any live state.
    pub fn can_move_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Init, Pending) | (Pending, Running) | (Running, Done) => true,
            (s, Error) | (s, Canceled) => !s.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub percent: u64,
    pub description: String,
}

impl Progress {
    /// Apply an update. `current` never moves backwards and never passes `total`.
    pub fn advance(&mut self, current: u64, total: u64, description: Option<&str>) {
        self.total = total;
        let floor = self.current.min(total);
        self.current = current.min(total).max(floor);
        self.percent = if total == 0 { 0 } else { self.current * 100 / total };
        if let Some(d) = description {
            self.description = d.to_string();
        }
    }
}

/// Per-kind task payloads. Paths are full index paths (space prefix included).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOptions {
    Move { target_directory_path: String, items: Vec<String> },
    Copy { target_directory_path: String, items: Vec<String> },
    Rename { path: String, new_name: String },
    Unzip { file_path: String, target_directory_path: String },
    Sync { space_code: String },
    BulkDelete { content_type: String, ids: Vec<u64> },
}

impl TaskOptions {
    /// Serde tag of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskOptions::Move { .. } => "move",
            TaskOptions::Copy { .. } => "copy",
            TaskOptions::Rename { .. } => "rename",
            TaskOptions::Unzip { .. } => "unzip",
            TaskOptions::Sync { .. } => "sync",
            TaskOptions::BulkDelete { .. } => "bulk_delete",
        }
    }

    /// Name the task is listed under.
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskOptions::Move { .. } => "move_directory_in_storage",
            TaskOptions::Copy { .. } => "copy_directory_in_storage",
            TaskOptions::Rename { .. } => "rename_directory_in_storage",
            TaskOptions::Unzip { .. } => "unzip_file_in_storage",
            TaskOptions::Sync { .. } => "sync_storage_with_database",
            TaskOptions::BulkDelete { .. } => "bulk_delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: u64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub options: TaskOptions,
    pub progress: Progress,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub verbose_result: Option<String>,
    /// Username of the submitter
    pub member: String,
    /// Set when this task is a relaunch of another
    #[serde(default)]
    pub relaunched_from: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped_and_monotone() {
        let mut p = Progress::default();
        p.advance(1, 3, Some("start"));
        assert_eq!((p.current, p.total, p.percent), (1, 3, 33));
        p.advance(0, 3, None);
        assert_eq!(p.current, 1);
        assert_eq!(p.description, "start");
        p.advance(9, 3, Some("end"));
        assert_eq!((p.current, p.percent), (3, 100));
        let mut z = Progress::default();
        z.advance(0, 0, None);
        assert_eq!(z.percent, 0);
    }

    #[test]
    fn lifecycle_is_forward_only() {
        use TaskStatus::*;
        assert!(Init.can_move_to(Pending));
        assert!(Pending.can_move_to(Running));
        assert!(Running.can_move_to(Done));
        assert!(Pending.can_move_to(Canceled));
        assert!(Init.can_move_to(Error));
        assert!(!Done.can_move_to(Canceled));
        assert!(!Canceled.can_move_to(Running));
        assert!(!Running.can_move_to(Pending));
        assert!(!Init.can_move_to(Done));
    }

    #[test]
    fn options_are_tagged_and_unknown_kinds_rejected() {
        let o: TaskOptions = serde_json::from_value(serde_json::json!({
            "kind": "rename", "path": "space00000/a.txt", "new_name": "b.txt"
        }))
        .unwrap();
        assert_eq!(o.task_type(), "rename_directory_in_storage");
        assert!(serde_json::from_value::<TaskOptions>(serde_json::json!({"kind": "teleport"})).is_err());
    }
}
