//! In-process backend over an ordered map. Every call is journaled so callers can
//! assert on the exact I/O a component performed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{DriverError, DriverResult, ObjectMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    Read,
    Write,
    Delete,
    Head,
    List,
    ListRecursive,
    DeletePrefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub op: DriverOp,
    pub key: String,
}

#[derive(Clone)]
struct Blob {
    bytes: Vec<u8>,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Blob>>,
    journal: Mutex<Vec<DriverCall>>,
}

impl MemoryBackend {
    fn record(&self, op: DriverOp, key: &str) {
        self.journal.lock().push(DriverCall { op, key: key.to_string() });
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<DriverCall> { self.journal.lock().clone() }

    pub fn clear_calls(&self) { self.journal.lock().clear(); }

    /// Keys written so far, in order (one entry per write).
    pub fn saved_keys(&self) -> Vec<String> {
        self.journal.lock().iter().filter(|c| c.op == DriverOp::Write).map(|c| c.key.clone()).collect()
    }

    pub fn object_keys(&self) -> Vec<String> { self.objects.lock().keys().cloned().collect() }

    pub async fn read(&self, key: &str) -> DriverResult<Vec<u8>> {
        self.record(DriverOp::Read, key);
        self.objects
            .lock()
            .get(key)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| DriverError::NotFound(key.to_string()))
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> DriverResult<()> {
        self.record(DriverOp::Write, key);
        let now = Utc::now();
        let mut objects = self.objects.lock();
        let created = objects.get(key).map(|b| b.created).unwrap_or(now);
        objects.insert(key.to_string(), Blob { bytes: bytes.to_vec(), created, modified: now });
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> DriverResult<()> {
        self.record(DriverOp::Delete, key);
        self.objects.lock().remove(key);
        Ok(())
    }

    pub async fn head(&self, key: &str) -> DriverResult<Option<ObjectMeta>> {
        self.record(DriverOp::Head, key);
        Ok(self.objects.lock().get(key).map(|b| ObjectMeta {
            key: key.to_string(),
            size: b.bytes.len() as u64,
            modified: Some(b.modified),
        }))
    }

    pub async fn list(&self, prefix: &str) -> DriverResult<(Vec<String>, Vec<String>)> {
        self.record(DriverOp::List, prefix);
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for key in self.objects.lock().range(prefix.to_string()..).map(|(k, _)| k).take_while(|k| k.starts_with(prefix)) {
            let rest = &key[prefix.len()..];
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if dirs.last().map(|d: &String| d != dir).unwrap_or(true) { dirs.push(dir.to_string()); }
                }
                None if !rest.is_empty() => files.push(rest.to_string()),
                None => {}
            }
        }
        Ok((dirs, files))
    }

    pub async fn list_recursive(&self, prefix: &str) -> DriverResult<Vec<ObjectMeta>> {
        self.record(DriverOp::ListRecursive, prefix);
        Ok(self
            .objects
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, b)| ObjectMeta { key: k.clone(), size: b.bytes.len() as u64, modified: Some(b.modified) })
            .collect())
    }

    pub async fn created(&self, key: &str) -> DriverResult<DateTime<Utc>> {
        self.objects.lock().get(key).map(|b| b.created).ok_or_else(|| DriverError::NotFound(key.to_string()))
    }

    pub async fn delete_prefix(&self, prefix: &str) -> DriverResult<usize> {
        self.record(DriverOp::DeletePrefix, prefix);
        let mut objects = self.objects.lock();
        let doomed: Vec<String> = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed.iter() { objects.remove(k); }
        Ok(doomed.len())
    }

    pub async fn dir_exists(&self, prefix: &str) -> DriverResult<bool> {
        if prefix.is_empty() { return Ok(true); }
        Ok(self.objects.lock().range(prefix.to_string()..).next().map(|(k, _)| k.starts_with(prefix)).unwrap_or(false))
    }
}
