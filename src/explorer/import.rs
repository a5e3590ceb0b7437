//! Hand-off to the import pipeline after uploads into `<space>/import`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::iam::Member;

pub const IMPORT_DIR: &str = "import";
pub const SETTINGS_FILE: &str = ".settings.json";

/// Runs import procedures by user code. Implemented outside this crate; the
/// default only logs.
#[async_trait]
pub trait ImportHook: Send + Sync {
    async fn run_procedures(&self, member: &Member, procedures: &[String], files: &[String]) -> AppResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingImportHook;

#[async_trait]
impl ImportHook for LoggingImportHook {
    async fn run_procedures(&self, member: &Member, procedures: &[String], files: &[String]) -> AppResult<()> {
        for p in procedures {
            info!(target: "fileplane::explorer", member = %member.username, procedure = %p, files = files.len(), "import procedure requested");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct OnCreate {
    #[serde(default)]
    expression_procedure: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImportSettings {
    #[serde(default)]
    on_create: OnCreate,
}

/// Procedure codes listed under `on_create.expression_procedure`.
pub fn procedures_from_settings(bytes: &[u8]) -> AppResult<Vec<String>> {
    let s: ImportSettings = serde_json::from_slice(bytes)
        .map_err(|e| AppError::validation("import_settings".to_string(), format!("{}: {}", SETTINGS_FILE, e)))?;
    Ok(s.on_create.expression_procedure)
}
