//! Unified application error model and mapping helpers.
//! One error enum shared by the index, the policy engine, the task runner and the HTTP
//! boundary. Each variant carries a fine-grained `code` plus a human message; the stable
//! `error_key` and HTTP status are derived from the variant.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    InvalidPath { code: String, message: String },
    Validation { code: String, message: String },
    NoDirectory { code: String, message: String },
    NotFound { code: String, message: String },
    Conflict { code: String, message: String },
    PermissionDenied { code: String, message: String },
    PolicyDeny { code: String, message: String },
    PolicyParse { code: String, message: String },
    PolicyUnknownCondition { code: String, message: String },
    TaskNotFound { code: String, message: String },
    TaskInvalidState { code: String, message: String },
    TooManyFiles { code: String, message: String },
    Driver { code: String, message: String, transient: bool },
    Encryption { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::InvalidPath { code, .. }
            | AppError::Validation { code, .. }
            | AppError::NoDirectory { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::PermissionDenied { code, .. }
            | AppError::PolicyDeny { code, .. }
            | AppError::PolicyParse { code, .. }
            | AppError::PolicyUnknownCondition { code, .. }
            | AppError::TaskNotFound { code, .. }
            | AppError::TaskInvalidState { code, .. }
            | AppError::TooManyFiles { code, .. }
            | AppError::Driver { code, .. }
            | AppError::Encryption { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::InvalidPath { message, .. }
            | AppError::Validation { message, .. }
            | AppError::NoDirectory { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::PermissionDenied { message, .. }
            | AppError::PolicyDeny { message, .. }
            | AppError::PolicyParse { message, .. }
            | AppError::PolicyUnknownCondition { message, .. }
            | AppError::TaskNotFound { message, .. }
            | AppError::TaskInvalidState { message, .. }
            | AppError::TooManyFiles { message, .. }
            | AppError::Driver { message, .. }
            | AppError::Encryption { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn invalid_path<S: Into<String>>(code: S, msg: S) -> Self { AppError::InvalidPath { code: code.into(), message: msg.into() } }
    pub fn validation<S: Into<String>>(code: S, msg: S) -> Self { AppError::Validation { code: code.into(), message: msg.into() } }
    pub fn no_directory<S: Into<String>>(code: S, msg: S) -> Self { AppError::NoDirectory { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn permission_denied<S: Into<String>>(code: S, msg: S) -> Self { AppError::PermissionDenied { code: code.into(), message: msg.into() } }
    pub fn policy_deny<S: Into<String>>(code: S, msg: S) -> Self { AppError::PolicyDeny { code: code.into(), message: msg.into() } }
    pub fn policy_parse<S: Into<String>>(code: S, msg: S) -> Self { AppError::PolicyParse { code: code.into(), message: msg.into() } }
    pub fn policy_unknown_condition<S: Into<String>>(code: S, msg: S) -> Self { AppError::PolicyUnknownCondition { code: code.into(), message: msg.into() } }
    pub fn task_not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::TaskNotFound { code: code.into(), message: msg.into() } }
    pub fn task_invalid_state<S: Into<String>>(code: S, msg: S) -> Self { AppError::TaskInvalidState { code: code.into(), message: msg.into() } }
    pub fn too_many_files<S: Into<String>>(code: S, msg: S) -> Self { AppError::TooManyFiles { code: code.into(), message: msg.into() } }
    pub fn driver<S: Into<String>>(code: S, msg: S, transient: bool) -> Self { AppError::Driver { code: code.into(), message: msg.into(), transient } }
    pub fn encryption<S: Into<String>>(code: S, msg: S) -> Self { AppError::Encryption { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Stable key surfaced to HTTP clients; independent of the fine-grained `code`.
    pub fn error_key(&self) -> &'static str {
        match self {
            AppError::InvalidPath { .. } => "invalid_path",
            AppError::Validation { .. } => "validation_error",
            AppError::NoDirectory { .. } => "no_directory",
            AppError::NotFound { .. } => "not_found",
            AppError::Conflict { .. } => "conflict",
            AppError::PermissionDenied { .. } => "permission_denied",
            AppError::PolicyDeny { .. } => "policy_deny",
            AppError::PolicyParse { .. } => "policy_parse_error",
            AppError::PolicyUnknownCondition { .. } => "policy_unknown_condition",
            AppError::TaskNotFound { .. } => "task_not_found",
            AppError::TaskInvalidState { .. } => "task_invalid_state",
            AppError::TooManyFiles { .. } => "too_many_files",
            AppError::Driver { .. } => "driver_error",
            AppError::Encryption { .. } => "encryption_error",
            AppError::Internal { .. } => "internal",
        }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::InvalidPath { .. }
            | AppError::Validation { .. }
            | AppError::NoDirectory { .. }
            | AppError::PolicyParse { .. }
            | AppError::TooManyFiles { .. } => 400,
            AppError::PermissionDenied { .. } | AppError::PolicyDeny { .. } => 403,
            AppError::NotFound { .. } | AppError::TaskNotFound { .. } => 404,
            AppError::Conflict { .. } | AppError::TaskInvalidState { .. } => 409,
            AppError::PolicyUnknownCondition { .. }
            | AppError::Driver { .. }
            | AppError::Encryption { .. }
            | AppError::Internal { .. } => 500,
        }
    }

    /// Only wrapped backend failures flagged transient are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Driver { transient: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound { .. })
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Keep typed errors that were boxed into anyhow along the way
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::Internal { code: "internal".into(), message: other.to_string() },
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation { code: "invalid_json".into(), message: err.to_string() }
    }
}
