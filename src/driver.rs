//!
//! fileplane storage driver
//! ------------------------
//! A closed set of storage backends behind one `Storage` handle. The handle is built once
//! at start from the effective configuration and cloned into every component that does
//! I/O. Encryption is applied here, above the backends: when a key is configured every
//! payload is AES-GCM encrypted on the way in and transparently decrypted on the way out.
//!
//! Keys are space-prefixed object keys. Directory keys end with a bare `/`; a key that
//! ends with `/` or `/*` passed to `save` is a directory marker and becomes an empty
//! `.init` sentinel inside that directory.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{BackendKind, StorageSettings};
use crate::error::AppError;
use crate::paths::{self, INIT_MARKER};

pub mod archive;
pub mod azure;
pub mod crypto;
pub mod local;
pub mod memory;
pub mod remote;
pub mod s3;
#[cfg(feature = "sftp")]
pub mod sftp;
pub mod sigv4;
mod xml;

pub use crypto::Cipher;
pub use memory::{DriverCall, MemoryBackend};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io error on '{key}': {source}")]
    Io { key: String, #[source] source: std::io::Error },
    #[error("backend returned HTTP {status} for '{key}': {body}")]
    Http { key: String, status: u16, body: String },
    #[error("transport error for '{key}': {message}")]
    Transport { key: String, message: String, transient: bool },
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("invalid storage configuration: {0}")]
    Config(String),
    #[error("zip error: {0}")]
    Zip(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("sftp error: {0}")]
    Sftp(String),
}

impl DriverError {
    pub fn io(key: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return DriverError::NotFound(key.to_string());
        }
        DriverError::Io { key: key.to_string(), source }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, DriverError::NotFound(_)) }

    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transport { transient: true, .. })
    }
}

impl From<zip::result::ZipError> for DriverError {
    fn from(e: zip::result::ZipError) -> Self { DriverError::Zip(e.to_string()) }
}

impl From<DriverError> for AppError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(key) => AppError::not_found("object_not_found".to_string(), format!("'{}' does not exist", key)),
            DriverError::Encryption(m) => AppError::encryption("ciphertext".to_string(), m),
            DriverError::Transport { transient, .. } => {
                let msg = err.to_string();
                AppError::driver("transport".to_string(), msg, transient)
            }
            other => AppError::driver("backend".to_string(), other.to_string(), false),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Metadata for one listed object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// The closed set of backends.
pub enum Backend {
    LocalFs(local::LocalFsBackend),
    S3(s3::S3Backend),
    AzureBlob(azure::AzureBackend),
    #[cfg(feature = "sftp")]
    Sftp(sftp::SftpBackend),
    /// In-process map; never selected from the environment.
    Memory(MemoryBackend),
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $call:expr) => {
        match $self {
            Backend::LocalFs($b) => $call,
            Backend::S3($b) => $call,
            Backend::AzureBlob($b) => $call,
            #[cfg(feature = "sftp")]
            Backend::Sftp($b) => $call,
            Backend::Memory($b) => $call,
        }
    };
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::LocalFs(_) => "local",
            Backend::S3(_) => "s3",
            Backend::AzureBlob(_) => "azure",
            #[cfg(feature = "sftp")]
            Backend::Sftp(_) => "sftp",
            Backend::Memory(_) => "memory",
        }
    }

    /// Whether writing over an existing key replaces it in one step.
    fn overwrites_natively(&self) -> bool {
        match self {
            #[cfg(feature = "sftp")]
            Backend::Sftp(_) => false,
            _ => true,
        }
    }

    async fn read(&self, key: &str) -> DriverResult<Vec<u8>> { dispatch!(self, b => b.read(key).await) }
    async fn write(&self, key: &str, bytes: &[u8]) -> DriverResult<()> { dispatch!(self, b => b.write(key, bytes).await) }
    async fn delete(&self, key: &str) -> DriverResult<()> { dispatch!(self, b => b.delete(key).await) }
    async fn head(&self, key: &str) -> DriverResult<Option<ObjectMeta>> { dispatch!(self, b => b.head(key).await) }
    async fn list(&self, prefix: &str) -> DriverResult<(Vec<String>, Vec<String>)> { dispatch!(self, b => b.list(prefix).await) }
    async fn list_recursive(&self, prefix: &str) -> DriverResult<Vec<ObjectMeta>> { dispatch!(self, b => b.list_recursive(prefix).await) }
    async fn created(&self, key: &str) -> DriverResult<DateTime<Utc>> { dispatch!(self, b => b.created(key).await) }
    async fn delete_prefix(&self, prefix: &str) -> DriverResult<usize> { dispatch!(self, b => b.delete_prefix(prefix).await) }
    async fn dir_exists(&self, prefix: &str) -> DriverResult<bool> { dispatch!(self, b => b.dir_exists(prefix).await) }
}

struct StorageInner {
    backend: Backend,
    cipher: Option<Cipher>,
}

/// Cloneable handle over the configured backend plus optional encryption.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

fn dir_key(p: &str) -> String {
    // "a/b/*", "a/b/" and "a/b" all mean the directory "a/b/"
    let body = p.strip_suffix(paths::DIR_SUFFIX).unwrap_or(p).trim_end_matches('/');
    if body.is_empty() { String::new() } else { format!("{}/", body) }
}

fn is_dir_marker(p: &str) -> bool {
    p.ends_with('/') || p.ends_with(paths::DIR_SUFFIX)
}

impl Storage {
    pub fn new(backend: Backend, cipher: Option<Cipher>) -> Self {
        Self { inner: Arc::new(StorageInner { backend, cipher }) }
    }

    /// Build the process-wide handle from resolved settings.
    pub fn from_settings(settings: &StorageSettings) -> DriverResult<Self> {
        let cipher = match settings.encryption_key.as_deref() {
            Some(hex_key) => Some(Cipher::from_hex(hex_key)?),
            None => None,
        };
        let policy = remote::RetryPolicy::from_settings(settings);
        let backend = match settings.kind {
            BackendKind::LocalFs => Backend::LocalFs(local::LocalFsBackend::new(&settings.media_root)?),
            BackendKind::S3 => Backend::S3(s3::S3Backend::new(&settings.s3, policy)?),
            BackendKind::AzureBlob => Backend::AzureBlob(azure::AzureBackend::new(&settings.azure, policy)?),
            #[cfg(feature = "sftp")]
            BackendKind::Sftp => Backend::Sftp(sftp::SftpBackend::new(&settings.sftp)),
            #[cfg(not(feature = "sftp"))]
            BackendKind::Sftp => return Err(DriverError::Config("SFTP_HOST is set but the binary was built without the 'sftp' feature".into())),
        };
        info!(target: "fileplane::driver", backend = backend.name(), encrypted = cipher.is_some(), "storage driver ready");
        Ok(Self::new(backend, cipher))
    }

    /// In-memory storage, optionally encrypted.
    pub fn memory(cipher: Option<Cipher>) -> Self {
        Self::new(Backend::Memory(MemoryBackend::default()), cipher)
    }

    pub fn backend_name(&self) -> &'static str { self.inner.backend.name() }

    pub fn is_encrypted(&self) -> bool { self.inner.cipher.is_some() }

    /// The in-memory backend, when this handle wraps one.
    pub fn memory_backend(&self) -> Option<&MemoryBackend> {
        match &self.inner.backend {
            Backend::Memory(m) => Some(m),
            _ => None,
        }
    }

    /// Read and decrypt.
    pub async fn open(&self, key: &str) -> DriverResult<Vec<u8>> {
        let raw = self.inner.backend.read(key).await?;
        match &self.inner.cipher {
            Some(c) => c.decrypt(&raw),
            None => Ok(raw),
        }
    }

    /// Read the stored bytes as they are, without decrypting.
    pub async fn open_skip_decrypt(&self, key: &str) -> DriverResult<Vec<u8>> {
        self.inner.backend.read(key).await
    }

    /// Save `content` at `key`, replacing what was there. Returns the key actually written.
    pub async fn save(&self, key: &str, content: &[u8]) -> DriverResult<String> {
        let (key, content) = if is_dir_marker(key) {
            (format!("{}{}", dir_key(key), INIT_MARKER), &b""[..])
        } else {
            (key.to_string(), content)
        };
        let payload = match &self.inner.cipher {
            Some(c) => c.encrypt(content)?,
            None => content.to_vec(),
        };
        self.write_replacing(&key, &payload).await?;
        debug!(target: "fileplane::driver", key = %key, bytes = content.len(), "save");
        Ok(key)
    }

    /// Write bytes as-is, bypassing encryption.
    pub async fn save_raw(&self, key: &str, bytes: &[u8]) -> DriverResult<()> {
        self.write_replacing(key, bytes).await
    }

    async fn write_replacing(&self, key: &str, bytes: &[u8]) -> DriverResult<()> {
        if !self.inner.backend.overwrites_natively() && self.inner.backend.head(key).await?.is_some() {
            self.inner.backend.delete(key).await?;
        }
        self.inner.backend.write(key, bytes).await
    }

    /// Delete one object. Deleting a missing object is not an error.
    pub async fn delete(&self, key: &str) -> DriverResult<()> {
        self.inner.backend.delete(key).await?;
        debug!(target: "fileplane::driver", key, "delete");
        Ok(())
    }

    /// File existence, or directory existence when `key` is a directory marker.
    pub async fn exists(&self, key: &str) -> DriverResult<bool> {
        if is_dir_marker(key) {
            return self.dir_exists(key).await;
        }
        Ok(self.inner.backend.head(key).await?.is_some())
    }

    /// A directory exists when anything at all lives under it.
    pub async fn dir_exists(&self, key: &str) -> DriverResult<bool> {
        self.inner.backend.dir_exists(&dir_key(key)).await
    }

    /// Stored size in bytes (ciphertext size when encrypted).
    pub async fn size(&self, key: &str) -> DriverResult<u64> {
        match self.inner.backend.head(key).await? {
            Some(m) => Ok(m.size),
            None => Err(DriverError::NotFound(key.to_string())),
        }
    }

    /// Immediate children of a directory as `(dirnames, filenames)`, both sorted.
    pub async fn listdir(&self, key: &str) -> DriverResult<(Vec<String>, Vec<String>)> {
        let (mut dirs, mut files) = self.inner.backend.list(&dir_key(key)).await?;
        dirs.sort();
        dirs.dedup();
        files.sort();
        Ok((dirs, files))
    }

    /// Every object under a directory, recursively, in key order.
    pub async fn walk_files(&self, key: &str) -> DriverResult<Vec<ObjectMeta>> {
        let mut all = self.inner.backend.list_recursive(&dir_key(key)).await?;
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    pub async fn created(&self, key: &str) -> DriverResult<DateTime<Utc>> {
        self.inner.backend.created(key).await
    }

    pub async fn modified(&self, key: &str) -> DriverResult<DateTime<Utc>> {
        match self.inner.backend.head(key).await? {
            Some(ObjectMeta { modified: Some(m), .. }) => Ok(m),
            Some(_) => self.inner.backend.created(key).await,
            None => Err(DriverError::NotFound(key.to_string())),
        }
    }

    /// Remove every object whose key starts with the directory prefix.
    pub async fn delete_directory(&self, key: &str) -> DriverResult<usize> {
        let prefix = dir_key(key);
        if prefix.is_empty() {
            return Err(DriverError::Config("refusing to delete the storage root".into()));
        }
        let n = self.inner.backend.delete_prefix(&prefix).await?;
        info!(target: "fileplane::driver", prefix = %prefix, removed = n, "delete_directory");
        Ok(n)
    }

    /// Copy (decrypted) every object under `key` into `dest`, keeping relative layout.
    pub async fn download_directory(&self, key: &str, dest: &Path) -> DriverResult<usize> {
        let prefix = dir_key(key);
        let mut n = 0usize;
        for obj in self.walk_files(&prefix).await? {
            let rel = obj.key.strip_prefix(&prefix).unwrap_or(&obj.key);
            if rel.is_empty() { continue; }
            let target = dest.join(rel);
            let bytes = self.open(&obj.key).await?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| DriverError::io(&obj.key, e))?;
            }
            tokio::fs::write(&target, bytes).await.map_err(|e| DriverError::io(&obj.key, e))?;
            n += 1;
        }
        Ok(n)
    }

    pub async fn download_file_locally(&self, key: &str, dest: &Path) -> DriverResult<()> {
        let bytes = self.open(key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| DriverError::io(key, e))?;
        }
        tokio::fs::write(dest, bytes).await.map_err(|e| DriverError::io(key, e))
    }

    /// Zip of everything under one directory; archive paths are relative to it.
    pub async fn download_directory_as_zip(&self, key: &str) -> DriverResult<Vec<u8>> {
        let tmp = tempfile::TempDir::new().map_err(|e| DriverError::io(key, e))?;
        self.download_directory(key, tmp.path()).await?;
        let root = tmp.path().to_path_buf();
        // TempDir removes the staging tree on drop, on every exit path
        tokio::task::spawn_blocking(move || archive::zip_tree(&root))
            .await
            .map_err(|e| DriverError::Zip(e.to_string()))?
    }

    /// Zip of several keys: files at the archive root by basename, directories by their
    /// last name with their content below.
    pub async fn download_paths_as_zip(&self, keys: &[String]) -> DriverResult<Vec<u8>> {
        let tmp = tempfile::TempDir::new().map_err(|e| DriverError::io("tmp", e))?;
        for key in keys {
            if is_dir_marker(key) {
                let name = paths::basename(key).to_string();
                self.download_directory(key, &tmp.path().join(name)).await?;
            } else {
                let name = paths::basename(key).to_string();
                self.download_file_locally(key, &tmp.path().join(name)).await?;
            }
        }
        let root = tmp.path().to_path_buf();
        tokio::task::spawn_blocking(move || archive::zip_tree(&root))
            .await
            .map_err(|e| DriverError::Zip(e.to_string()))?
    }

    /// Re-encrypt every object under `key` with `new_cipher`. The current cipher (if any)
    /// decrypts; objects are written back raw. Returns the number of rewritten objects.
    pub async fn rotate_key(&self, key: &str, new_cipher: &Cipher) -> DriverResult<usize> {
        let mut n = 0usize;
        for obj in self.walk_files(key).await? {
            let raw = self.open_skip_decrypt(&obj.key).await?;
            let plain = match &self.inner.cipher {
                Some(c) => c.decrypt(&raw)?,
                None => raw,
            };
            let fresh = new_cipher.encrypt(&plain)?;
            self.save_raw(&obj.key, &fresh).await?;
            n += 1;
        }
        info!(target: "fileplane::driver", prefix = key, rotated = n, "rotate_key");
        Ok(n)
    }
}

#[cfg(test)]
mod driver_tests;
