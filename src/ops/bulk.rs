use tracing::info;

use crate::error::{AppError, AppResult};
use crate::records::Deletion;
use crate::tasks::{Outcome, TaskHandle};

use super::Operations;

const TASK_TYPE: &str = "bulk_delete";

impl Operations {
    /// Delete records of one content type. The whole batch is checked before the first
    /// record is touched, so a protected or missing id leaves everything in place.
    pub async fn bulk_delete(&self, content_type: &str, ids: &[u64], handle: &TaskHandle) -> AppResult<Outcome> {
        if ids.is_empty() {
            return Err(AppError::validation("ids", "ids: at least one id is required"));
        }
        let records = self.records().check_deletable(content_type, ids)?;
        let total = records.len() as u64;
        handle.progress(0, total, &format!("{} starting", TASK_TYPE))?;
        let (mut soft, mut hard) = (0u64, 0u64);
        for (n, rec) in records.iter().enumerate() {
            match self.records().delete_one(content_type, rec.id)? {
                Deletion::Soft => soft += 1,
                Deletion::Hard => hard += 1,
            }
            handle.progress(n as u64 + 1, total, &format!("{} in progress", TASK_TYPE))?;
        }
        info!(target: "fileplane::ops", content_type, soft, hard, "bulk delete finished");
        let finished = format!("{} finished", TASK_TYPE);
        Ok(Outcome::new(format!("deleted {} {} records", total, content_type))
            .described(finished)
            .with_result(serde_json::json!({"soft_deleted": soft, "deleted": hard})))
    }
}
