//! SFTP backend. libssh2 is blocking, so every call runs on the blocking pool with its own
//! short-lived session.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use ssh2::{ErrorCode, Session, Sftp};

use super::{DriverError, DriverResult, ObjectMeta};
use crate::config::SftpSettings;

const NO_SUCH_FILE: i32 = 2;

pub struct SftpBackend {
    settings: Arc<SftpSettings>,
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(NO_SUCH_FILE))
}

fn sftp_err(key: &str, e: ssh2::Error) -> DriverError {
    if is_missing(&e) {
        DriverError::NotFound(key.to_string())
    } else {
        DriverError::Sftp(format!("{}: {}", key, e))
    }
}

fn mtime(stat: &ssh2::FileStat) -> Option<DateTime<Utc>> {
    stat.mtime.and_then(|t| Utc.timestamp_opt(t as i64, 0).single())
}

fn connect(s: &SftpSettings) -> DriverResult<Sftp> {
    let tcp = TcpStream::connect((s.host.as_str(), s.port)).map_err(|e| DriverError::Transport {
        key: s.host.clone(),
        message: e.to_string(),
        transient: true,
    })?;
    let mut sess = Session::new().map_err(|e| DriverError::Sftp(e.to_string()))?;
    sess.set_tcp_stream(tcp);
    sess.handshake().map_err(|e| DriverError::Sftp(format!("handshake: {}", e)))?;
    sess.userauth_password(&s.username, &s.password)
        .map_err(|e| DriverError::Sftp(format!("authentication failed: {}", e)))?;
    sess.sftp().map_err(|e| DriverError::Sftp(e.to_string()))
}

fn mkdirs(sftp: &Sftp, dir: &Path) {
    let mut cur = PathBuf::new();
    for comp in dir.components() {
        cur.push(comp);
        if sftp.stat(&cur).is_err() {
            // races with concurrent writers are fine; the create below reports real failures
            let _ = sftp.mkdir(&cur, 0o755);
        }
    }
}

fn walk(sftp: &Sftp, root: &Path, dir: &Path, out: &mut Vec<ObjectMeta>) -> DriverResult<()> {
    let entries = match sftp.readdir(dir) {
        Ok(e) => e,
        Err(e) if is_missing(&e) => return Ok(()),
        Err(e) => return Err(sftp_err(&dir.to_string_lossy(), e)),
    };
    for (path, stat) in entries {
        if stat.is_dir() {
            walk(sftp, root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(ObjectMeta {
                key: rel.to_string_lossy().replace('\\', "/"),
                size: stat.size.unwrap_or(0),
                modified: mtime(&stat),
            });
        }
    }
    Ok(())
}

impl SftpBackend {
    pub fn new(settings: &SftpSettings) -> Self {
        Self { settings: Arc::new(settings.clone()) }
    }

    async fn run<T, F>(&self, f: F) -> DriverResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp, &Path) -> DriverResult<T> + Send + 'static,
    {
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || {
            let sftp = connect(&settings)?;
            f(&sftp, Path::new(&settings.root))
        })
        .await
        .map_err(|e| DriverError::Sftp(format!("blocking task failed: {}", e)))?
    }

    pub async fn read(&self, key: &str) -> DriverResult<Vec<u8>> {
        let key = key.to_string();
        self.run(move |sftp, root| {
            let mut f = sftp.open(&root.join(&key)).map_err(|e| sftp_err(&key, e))?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf).map_err(|e| DriverError::io(&key, e))?;
            Ok(buf)
        })
        .await
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> DriverResult<()> {
        let key = key.to_string();
        let bytes = bytes.to_vec();
        self.run(move |sftp, root| {
            let p = root.join(&key);
            if let Some(parent) = p.parent() {
                mkdirs(sftp, parent);
            }
            let mut f = sftp.create(&p).map_err(|e| sftp_err(&key, e))?;
            f.write_all(&bytes).map_err(|e| DriverError::io(&key, e))
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> DriverResult<()> {
        let key = key.to_string();
        self.run(move |sftp, root| match sftp.unlink(&root.join(&key)) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(sftp_err(&key, e)),
        })
        .await
    }

    pub async fn head(&self, key: &str) -> DriverResult<Option<ObjectMeta>> {
        let key = key.to_string();
        self.run(move |sftp, root| match sftp.stat(&root.join(&key)) {
            Ok(st) if st.is_dir() => Ok(None),
            Ok(st) => Ok(Some(ObjectMeta { key: key.clone(), size: st.size.unwrap_or(0), modified: mtime(&st) })),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(sftp_err(&key, e)),
        })
        .await
    }

    pub async fn list(&self, prefix: &str) -> DriverResult<(Vec<String>, Vec<String>)> {
        let prefix = prefix.to_string();
        self.run(move |sftp, root| {
            let entries = match sftp.readdir(&root.join(&prefix)) {
                Ok(e) => e,
                Err(e) if is_missing(&e) => return Ok((Vec::new(), Vec::new())),
                Err(e) => return Err(sftp_err(&prefix, e)),
            };
            let mut dirs = Vec::new();
            let mut files = Vec::new();
            for (path, stat) in entries {
                let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else { continue };
                if stat.is_dir() { dirs.push(name); } else { files.push(name); }
            }
            Ok((dirs, files))
        })
        .await
    }

    pub async fn list_recursive(&self, prefix: &str) -> DriverResult<Vec<ObjectMeta>> {
        let prefix = prefix.to_string();
        self.run(move |sftp, root| {
            let mut out = Vec::new();
            walk(sftp, root, &root.join(&prefix), &mut out)?;
            Ok(out)
        })
        .await
    }

    /// SFTP exposes no birth time; modification time stands in.
    pub async fn created(&self, key: &str) -> DriverResult<DateTime<Utc>> {
        match self.head(key).await? {
            Some(ObjectMeta { modified: Some(m), .. }) => Ok(m),
            _ => Err(DriverError::NotFound(key.to_string())),
        }
    }

    pub async fn delete_prefix(&self, prefix: &str) -> DriverResult<usize> {
        let objects = self.list_recursive(prefix).await?;
        let keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
        let prefix = prefix.to_string();
        self.run(move |sftp, root| {
            for k in keys.iter() {
                match sftp.unlink(&root.join(k)) {
                    Ok(()) => {}
                    Err(e) if is_missing(&e) => {}
                    Err(e) => return Err(sftp_err(k, e)),
                }
            }
            // remove the now-empty directories, deepest first
            let mut dirs: Vec<PathBuf> = Vec::new();
            let base = root.join(&prefix);
            let mut stack = vec![base.clone()];
            while let Some(d) = stack.pop() {
                if let Ok(entries) = sftp.readdir(&d) {
                    for (p, st) in entries {
                        if st.is_dir() { stack.push(p); }
                    }
                }
                dirs.push(d);
            }
            dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
            for d in dirs {
                let _ = sftp.rmdir(&d);
            }
            Ok(keys.len())
        })
        .await
    }

    pub async fn dir_exists(&self, prefix: &str) -> DriverResult<bool> {
        let prefix = prefix.to_string();
        self.run(move |sftp, root| match sftp.stat(&root.join(&prefix)) {
            Ok(st) => Ok(st.is_dir()),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(sftp_err(&prefix, e)),
        })
        .await
    }
}
