//! Local filesystem backend rooted at `MEDIA_ROOT`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use path_absolutize::Absolutize;
use tokio::fs;
use walkdir::WalkDir;

use super::{DriverError, DriverResult, ObjectMeta};

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new(root: &str) -> DriverResult<Self> {
        let root = Path::new(root)
            .absolutize()
            .map_err(|e| DriverError::io(root, e))?
            .to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| DriverError::io(&root.to_string_lossy(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn full(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    fn rel_key(&self, p: &Path) -> Option<String> {
        let rel = p.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
        Some(parts.join("/"))
    }

    pub async fn read(&self, key: &str) -> DriverResult<Vec<u8>> {
        let p = self.full(key);
        if fs::metadata(&p).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(DriverError::NotFound(key.to_string()));
        }
        fs::read(&p).await.map_err(|e| DriverError::io(key, e))
    }

    /// Write through a sibling temp file and rename, so readers never see a partial file.
    pub async fn write(&self, key: &str, bytes: &[u8]) -> DriverResult<()> {
        let p = self.full(key);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).await.map_err(|e| DriverError::io(key, e))?;
        }
        let tmp = p.with_file_name(format!(
            ".{}.{}.tmp",
            p.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&tmp, bytes).await.map_err(|e| DriverError::io(key, e))?;
        if let Err(e) = fs::rename(&tmp, &p).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(DriverError::io(key, e));
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> DriverResult<()> {
        match fs::remove_file(self.full(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::io(key, e)),
        }
    }

    pub async fn head(&self, key: &str) -> DriverResult<Option<ObjectMeta>> {
        match fs::metadata(self.full(key)).await {
            Ok(m) if m.is_file() => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: m.len(),
                modified: m.modified().ok().map(DateTime::<Utc>::from),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DriverError::io(key, e)),
        }
    }

    pub async fn list(&self, prefix: &str) -> DriverResult<(Vec<String>, Vec<String>)> {
        let dir = self.full(prefix);
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((dirs, files)),
            Err(e) => return Err(DriverError::io(prefix, e)),
        };
        while let Some(ent) = rd.next_entry().await.map_err(|e| DriverError::io(prefix, e))? {
            let name = ent.file_name().to_string_lossy().to_string();
            // staging files of in-flight writes
            if name.starts_with('.') && name.ends_with(".tmp") { continue; }
            let ft = ent.file_type().await.map_err(|e| DriverError::io(prefix, e))?;
            if ft.is_dir() { dirs.push(name); } else { files.push(name); }
        }
        Ok((dirs, files))
    }

    pub async fn list_recursive(&self, prefix: &str) -> DriverResult<Vec<ObjectMeta>> {
        let dir = self.full(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for ent in WalkDir::new(&dir).sort_by_file_name() {
            let ent = ent.map_err(|e| DriverError::Io { key: prefix.to_string(), source: e.into() })?;
            if !ent.file_type().is_file() { continue; }
            let Some(key) = self.rel_key(ent.path()) else { continue };
            let meta = ent.metadata().map_err(|e| DriverError::Io { key: key.clone(), source: e.into() })?;
            out.push(ObjectMeta { key, size: meta.len(), modified: meta.modified().ok().map(DateTime::<Utc>::from) });
        }
        Ok(out)
    }

    pub async fn created(&self, key: &str) -> DriverResult<DateTime<Utc>> {
        let m = fs::metadata(self.full(key)).await.map_err(|e| DriverError::io(key, e))?;
        let t = m.created().or_else(|_| m.modified()).map_err(|e| DriverError::io(key, e))?;
        Ok(DateTime::<Utc>::from(t))
    }

    pub async fn delete_prefix(&self, prefix: &str) -> DriverResult<usize> {
        let dir = self.full(prefix);
        if !dir.is_dir() {
            return Ok(0);
        }
        let n = WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()).filter(|e| e.file_type().is_file()).count();
        fs::remove_dir_all(&dir).await.map_err(|e| DriverError::io(prefix, e))?;
        Ok(n)
    }

    pub async fn dir_exists(&self, prefix: &str) -> DriverResult<bool> {
        Ok(fs::metadata(self.full(prefix)).await.map(|m| m.is_dir()).unwrap_or(false))
    }
}
