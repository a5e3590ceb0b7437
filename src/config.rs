//! Layered process configuration: built-in defaults, then environment, then CLI flags.
//! The resolved `EffectiveConfig` is constructed once at start and passed down explicitly.

use serde::{Deserialize, Serialize};

/// Built-in defaults for every setting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    pub space_code: String,
    pub configuration_code: String,
    pub service_name: String,
    pub http_port: u16,
    /// Root for the KV persistence substrate (index, IAM, tasks)
    pub data_root: String,
    /// Root of the local filesystem backend
    pub media_root: String,

    /// Guardrail for move/copy
    pub max_files: usize,
    pub page_size: usize,

    pub driver_timeout_ms: u64,
    pub driver_retries: u32,
    pub driver_retry_backoff_ms: u64,

    pub task_workers: usize,
    /// Terminal tasks older than this are garbage-collected
    pub task_ttl_secs: u64,
    pub task_gc_interval_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            space_code: "space00000".to_string(),
            configuration_code: "local.poms.space00000".to_string(),
            service_name: "finmars".to_string(),
            http_port: 8080,
            data_root: "data".to_string(),
            media_root: "media".to_string(),

            max_files: 10_000,
            page_size: 40,

            driver_timeout_ms: 3_000,
            driver_retries: 1,
            driver_retry_backoff_ms: 1_000,

            task_workers: 4,
            task_ttl_secs: 7 * 86_400,
            task_gc_interval_secs: 3_600,
        }
    }
}

/// Which storage backend the process talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LocalFs,
    S3,
    AzureBlob,
    Sftp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct S3Settings {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    /// e.g. https://s3.eu-central-1.amazonaws.com or a MinIO endpoint
    pub endpoint_url: Option<String>,
    pub region: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AzureSettings {
    pub account_name: String,
    pub account_key: String,
    pub container: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub root: String,
}

/// Values read from the process environment. `None` means "not set".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub space_code: Option<String>,
    pub configuration_code: Option<String>,
    pub service_name: Option<String>,
    pub http_port: Option<u16>,
    pub data_root: Option<String>,
    pub media_root: Option<String>,
    pub max_files: Option<usize>,
    pub page_size: Option<usize>,
    pub driver_timeout_ms: Option<u64>,
    pub task_workers: Option<usize>,
    pub task_ttl_secs: Option<u64>,

    pub encryption_key: Option<String>,
    pub server_type: Option<String>,

    pub sftp_host: Option<String>,
    pub sftp_port: Option<u16>,
    pub sftp_username: Option<String>,
    pub sftp_password: Option<String>,
    pub sftp_root: Option<String>,

    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_bucket_name: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub aws_region: Option<String>,

    pub azure_account_name: Option<String>,
    pub azure_account_key: Option<String>,
    pub azure_container: Option<String>,

    pub use_filesystem_storage: Option<String>,
}

pub fn parse_bool_token(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_bool_env(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_bool_token(&v))
}

pub fn parse_u64_env(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

impl EnvOverrides {
    /// Read overrides from the real process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Read overrides through an arbitrary lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |k: &str| s(k).and_then(|v| v.parse::<u64>().ok());
        Self {
            space_code: s("SPACE_CODE"),
            configuration_code: s("CONFIGURATION_CODE"),
            service_name: s("SERVICE_NAME"),
            http_port: num("FILEPLANE_HTTP_PORT").and_then(|v| u16::try_from(v).ok()),
            data_root: s("FILEPLANE_DATA_ROOT"),
            media_root: s("MEDIA_ROOT"),
            max_files: num("FILEPLANE_MAX_FILES").map(|v| v as usize),
            page_size: num("FILEPLANE_PAGE_SIZE").map(|v| v as usize),
            driver_timeout_ms: num("FILEPLANE_DRIVER_TIMEOUT_MS"),
            task_workers: num("FILEPLANE_TASK_WORKERS").map(|v| v as usize),
            task_ttl_secs: num("FILEPLANE_TASK_TTL_SECS"),

            encryption_key: s("ENCRYPTION_KEY"),
            server_type: s("SERVER_TYPE"),

            sftp_host: s("SFTP_HOST"),
            sftp_port: num("SFTP_PORT").and_then(|v| u16::try_from(v).ok()),
            sftp_username: s("SFTP_USERNAME"),
            sftp_password: s("SFTP_PASSWORD"),
            sftp_root: s("SFTP_ROOT"),

            aws_access_key_id: s("AWS_S3_ACCESS_KEY_ID"),
            aws_secret_access_key: s("AWS_S3_SECRET_ACCESS_KEY"),
            aws_bucket_name: s("AWS_STORAGE_BUCKET_NAME"),
            aws_endpoint_url: s("AWS_S3_ENDPOINT_URL"),
            aws_region: s("AWS_S3_REGION_NAME"),

            azure_account_name: s("AZURE_ACCOUNT_NAME"),
            azure_account_key: s("AZURE_ACCOUNT_KEY"),
            azure_container: s("AZURE_CONTAINER"),

            use_filesystem_storage: s("USE_FILESYSTEM_STORAGE"),
        }
    }

    /// Backend selection: the first non-empty of the four selector keys, in order.
    pub fn backend_kind(&self) -> BackendKind {
        if self.sftp_host.is_some() {
            BackendKind::Sftp
        } else if self.aws_access_key_id.is_some() {
            BackendKind::S3
        } else if self.azure_account_key.is_some() {
            BackendKind::AzureBlob
        } else {
            // USE_FILESYSTEM_STORAGE or nothing at all
            BackendKind::LocalFs
        }
    }
}

/// Fully resolved storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    pub kind: BackendKind,
    pub media_root: String,
    /// Hex-encoded 32-byte AES key; `None` disables encryption
    pub encryption_key: Option<String>,
    pub s3: S3Settings,
    pub azure: AzureSettings,
    pub sftp: SftpSettings,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

/// Fully resolved effective config used during execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveConfig {
    pub space_code: String,
    pub configuration_code: String,
    pub service_name: String,
    pub http_port: u16,
    pub data_root: String,
    pub max_files: usize,
    pub page_size: usize,
    pub task_workers: usize,
    pub task_ttl_secs: u64,
    pub task_gc_interval_secs: u64,
    pub storage: StorageSettings,
}

impl EffectiveConfig {
    /// Build an effective config from defaults overlaid with environment values.
    pub fn from_layers(global: &GlobalConfig, env: &EnvOverrides) -> Self {
        let space_code = env.space_code.clone().unwrap_or_else(|| global.space_code.clone());
        // The configuration code follows the space unless set explicitly
        let configuration_code = match (&env.configuration_code, &env.space_code) {
            (Some(c), _) => c.clone(),
            (None, Some(space)) => format!("local.poms.{}", space),
            (None, None) => global.configuration_code.clone(),
        };

        let encryption_key = match env.server_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("local") => None,
            _ => env.encryption_key.clone(),
        };

        let storage = StorageSettings {
            kind: env.backend_kind(),
            media_root: env.media_root.clone().unwrap_or_else(|| global.media_root.clone()),
            encryption_key,
            s3: S3Settings {
                access_key_id: env.aws_access_key_id.clone().unwrap_or_default(),
                secret_access_key: env.aws_secret_access_key.clone().unwrap_or_default(),
                bucket_name: env.aws_bucket_name.clone().unwrap_or_default(),
                endpoint_url: env.aws_endpoint_url.clone(),
                region: env.aws_region.clone().unwrap_or_else(|| "us-east-1".to_string()),
            },
            azure: AzureSettings {
                account_name: env.azure_account_name.clone().unwrap_or_default(),
                account_key: env.azure_account_key.clone().unwrap_or_default(),
                container: env.azure_container.clone().unwrap_or_default(),
            },
            sftp: SftpSettings {
                host: env.sftp_host.clone().unwrap_or_default(),
                port: env.sftp_port.unwrap_or(22),
                username: env.sftp_username.clone().unwrap_or_default(),
                password: env.sftp_password.clone().unwrap_or_default(),
                root: env.sftp_root.clone().unwrap_or_else(|| "/".to_string()),
            },
            timeout_ms: env.driver_timeout_ms.unwrap_or(global.driver_timeout_ms),
            retries: global.driver_retries,
            retry_backoff_ms: global.driver_retry_backoff_ms,
        };

        Self {
            space_code,
            configuration_code,
            service_name: env.service_name.clone().unwrap_or_else(|| global.service_name.clone()),
            http_port: env.http_port.unwrap_or(global.http_port),
            data_root: env.data_root.clone().unwrap_or_else(|| global.data_root.clone()),
            max_files: env.max_files.unwrap_or(global.max_files),
            page_size: env.page_size.unwrap_or(global.page_size).max(1),
            task_workers: env.task_workers.unwrap_or(global.task_workers).max(1),
            task_ttl_secs: env.task_ttl_secs.unwrap_or(global.task_ttl_secs),
            task_gc_interval_secs: global.task_gc_interval_secs,
            storage,
        }
    }

    /// Defaults plus the real process environment.
    pub fn from_env() -> Self {
        Self::from_layers(&GlobalConfig::default(), &EnvOverrides::from_env())
    }

    /// Local-filesystem config rooted in `dir`, used by tests and the CLI.
    pub fn local(dir: &std::path::Path) -> Self {
        let global = GlobalConfig {
            data_root: dir.join("data").to_string_lossy().to_string(),
            media_root: dir.join("media").to_string_lossy().to_string(),
            ..GlobalConfig::default()
        };
        Self::from_layers(&global, &EnvOverrides::default())
    }
}
