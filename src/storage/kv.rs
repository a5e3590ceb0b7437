use std::time::{Duration, Instant};
use std::collections::{BTreeMap, HashMap as StdHashMap};
use std::sync::{Arc, OnceLock, Weak};
use std::path::{Path, PathBuf};
use serde::{Serialize, Deserialize};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::storage::SharedStore;

/// Value variants supported by the in-memory KV store.
#[derive(Clone, Debug, PartialEq)]
pub enum KvValue {
    Str(String),
    Int(i64),
    Json(JsonValue),
    /// Raw binary value
    Bytes(Vec<u8>),
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct StoreSettings {
    pub name: String,
    /// If true, a GET will reset the TTL for keys that were inserted with a TTL.
    pub reset_on_access_default: bool,
    /// Snapshot the store to `<store dir>/snapshot.bin` when the host flushes.
    #[serde(default = "StoreSettings::default_persist")]
    pub persist: bool,
}

impl StoreSettings {
    fn default_persist() -> bool { true }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { name: String::new(), reset_on_access_default: false, persist: true }
    }
}

#[derive(Clone)]
struct Entry {
    value: KvValue,
    /// Optional original TTL for resets
    ttl: Option<Duration>,
    /// Optional expiry time
    expires_at: Option<Instant>,
    /// If true for this key, accesses reset TTL
    reset_on_access: bool,
}

impl Entry {
    fn plain(value: KvValue) -> Self { Self { value, ttl: None, expires_at: None, reset_on_access: false } }
    fn expired(&self, now: Instant) -> bool { self.expires_at.map(|e| now >= e).unwrap_or(false) }
}

#[derive(Serialize, Deserialize)]
enum SnapVal { Str(String), Int(i64), Json(Vec<u8>), Bytes(Vec<u8>) }
#[derive(Serialize, Deserialize)]
struct SnapEntry { key: String, val: SnapVal, ttl_ms: Option<u64>, remaining_ms: Option<u64>, reset_on_access: bool }
#[derive(Serialize, Deserialize)]
struct Snapshot { version: u32, created_ms: i64, entries: Vec<SnapEntry> }

/// A single named in-memory KV store. Keys are kept ordered so prefix scans are cheap
/// and deterministic.
#[derive(Clone)]
pub struct KvStore {
    pub(crate) settings: StoreSettings,
    dir: PathBuf,
    map: Arc<parking_lot::RwLock<BTreeMap<String, Entry>>>,
}

impl KvStore {
    pub(crate) fn new(dir: PathBuf, settings: StoreSettings) -> Self {
        std::fs::create_dir_all(&dir).ok();
        Self { settings, dir, map: Arc::new(parking_lot::RwLock::new(BTreeMap::new())) }
    }

    fn config_path(&self) -> PathBuf { self.dir.join("store.json") }
    fn snapshot_path(&self) -> PathBuf { self.dir.join("snapshot.bin") }

    pub fn load_or_default(dir: PathBuf, name: &str) -> Self {
        let cfg = dir.join("store.json");
        let mut settings = StoreSettings { name: name.to_string(), ..StoreSettings::default() };
        if let Ok(bytes) = std::fs::read(&cfg) {
            if let Ok(s) = serde_json::from_slice::<StoreSettings>(&bytes) { settings = s; }
        }
        let kv = Self::new(dir, settings);
        if let Err(e) = kv.load_snapshot() {
            warn!(target: "fileplane::kv", "snapshot for store '{}' ignored: {}", name, e);
        }
        kv
    }

    pub fn save_settings(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.settings)?;
        std::fs::write(self.config_path(), bytes)?;
        Ok(())
    }

    /// Write the whole store to disk (bincode), atomically via rename.
    pub fn save_snapshot(&self) -> anyhow::Result<()> {
        if !self.settings.persist { return Ok(()); }
        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
        let now = Instant::now();
        let mut entries: Vec<SnapEntry> = Vec::new();
        for (k, v) in self.map.read().iter() {
            if v.expired(now) { continue; }
            let val = match &v.value {
                KvValue::Str(s) => SnapVal::Str(s.clone()),
                KvValue::Int(i) => SnapVal::Int(*i),
                KvValue::Json(j) => SnapVal::Json(serde_json::to_vec(j)?),
                KvValue::Bytes(b) => SnapVal::Bytes(b.clone()),
            };
            let ttl_ms = v.ttl.map(|d| d.as_millis() as u64);
            let remaining_ms = v.expires_at.map(|e| e.saturating_duration_since(now).as_millis() as u64);
            entries.push(SnapEntry { key: k.clone(), val, ttl_ms, remaining_ms, reset_on_access: v.reset_on_access });
        }
        let snap = Snapshot { version: 1, created_ms: now_ms, entries };
        let bytes = bincode::serialize(&snap)?;
        let tmp = self.snapshot_path().with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(tmp, self.snapshot_path())?;
        debug!(target: "fileplane::kv", "snapshot written for store '{}'", self.settings.name);
        Ok(())
    }

    /// Load snapshot from disk into memory.
    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        if !self.snapshot_path().exists() { return Ok(()); }
        let bytes = std::fs::read(self.snapshot_path())?;
        let snap: Snapshot = bincode::deserialize(&bytes)?;
        let now = Instant::now();
        let mut w = self.map.write();
        w.clear();
        for e in snap.entries.into_iter() {
            let kv = match e.val {
                SnapVal::Str(s) => KvValue::Str(s),
                SnapVal::Int(i) => KvValue::Int(i),
                SnapVal::Json(b) => KvValue::Json(serde_json::from_slice(&b).unwrap_or(JsonValue::Null)),
                SnapVal::Bytes(b) => KvValue::Bytes(b),
            };
            let ttl = e.ttl_ms.map(Duration::from_millis);
            let expires_at = match (ttl, e.remaining_ms) {
                (Some(_), Some(rem)) if rem > 0 => Some(now + Duration::from_millis(rem)),
                (Some(d), _) => Some(now + d),
                _ => None,
            };
            w.insert(e.key, Entry { value: kv, ttl, expires_at, reset_on_access: e.reset_on_access });
        }
        Ok(())
    }

    /// Set a key with optional TTL and per-key reset-on-access flag (defaults from store settings).
    pub fn set(&self, key: impl Into<String>, value: KvValue, ttl: Option<Duration>, reset_on_access: Option<bool>) {
        let reset = reset_on_access.unwrap_or(self.settings.reset_on_access_default);
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.map.write().insert(key.into(), Entry { value, ttl, expires_at, reset_on_access: reset });
    }

    /// Get a key. If expired, removes it and returns None. If reset_on_access, bumps expiry.
    pub fn get(&self, key: &str) -> Option<KvValue> {
        let now = Instant::now();
        {
            let r = self.map.read();
            let ent = r.get(key)?;
            if ent.expires_at.is_none() { return Some(ent.value.clone()); }
        }
        let mut w = self.map.write();
        let expired = w.get(key)?.expired(now);
        if expired {
            w.remove(key);
            return None;
        }
        let ent = w.get_mut(key)?;
        if ent.reset_on_access {
            if let Some(ttl) = ent.ttl { ent.expires_at = Some(now + ttl); }
        }
        Some(ent.value.clone())
    }

    pub fn set_json<T: Serialize>(&self, key: impl Into<String>, value: &T) -> anyhow::Result<()> {
        self.set(key, KvValue::Json(serde_json::to_value(value)?), None, None);
        Ok(())
    }

    /// Typed JSON read; a value of another variant or shape is reported as an error.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(KvValue::Json(j)) => Ok(Some(serde_json::from_value(j)?)),
            Some(_) => anyhow::bail!("key '{}' does not hold a JSON value", key),
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key) {
            Some(KvValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    /// Atomically increment an integer counter, starting from 0.
    pub fn incr(&self, key: &str, by: i64) -> i64 {
        let mut w = self.map.write();
        let ent = w.entry(key.to_string()).or_insert_with(|| Entry::plain(KvValue::Int(0)));
        let next = match ent.value { KvValue::Int(i) => i + by, _ => by };
        ent.value = KvValue::Int(next);
        next
    }

    pub fn delete(&self, key: &str) -> bool { self.map.write().remove(key).is_some() }
    pub fn clear(&self) { self.map.write().clear(); }
    pub fn len(&self) -> usize { self.map.read().len() }
    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }
    /// Return a snapshot of all keys in this store
    pub fn keys(&self) -> Vec<String> { self.map.read().keys().cloned().collect() }

    /// Live entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, KvValue)> {
        let now = Instant::now();
        self.map
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.expired(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// JSON values under `prefix` decoded as `T`; undecodable entries are skipped with a warning.
    pub fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Vec<T> {
        let mut out = Vec::new();
        for (k, v) in self.scan_prefix(prefix) {
            if let KvValue::Json(j) = v {
                match serde_json::from_value::<T>(j) {
                    Ok(t) => out.push(t),
                    Err(e) => warn!(target: "fileplane::kv", "skipping undecodable key '{}': {}", k, e),
                }
            }
        }
        out
    }

    /// Delete keys that start with the provided prefix. Returns number of removed keys.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut w = self.map.write();
        let to_remove: Vec<String> = w
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in to_remove.iter() { w.remove(k); }
        to_remove.len()
    }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let keys: Vec<String> = w.iter().filter(|(_, v)| v.expired(now)).map(|(k, _)| k.clone()).collect();
        for k in keys.iter() { w.remove(k); }
        keys.len()
    }

    /// Run `f` with the store write-locked. Every read and write inside observes and
    /// produces one consistent state; other callers wait until `f` returns.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut KvTxn<'_>) -> R) -> R {
        let mut guard = self.map.write();
        let mut txn = KvTxn { map: &mut *guard, now: Instant::now() };
        f(&mut txn)
    }
}

/// Write-locked view handed to `KvStore::transaction`.
pub struct KvTxn<'a> {
    map: &'a mut BTreeMap<String, Entry>,
    now: Instant,
}

impl KvTxn<'_> {
    pub fn get(&self, key: &str) -> Option<&KvValue> {
        self.map.get(key).filter(|e| !e.expired(self.now)).map(|e| &e.value)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(KvValue::Json(j)) => Ok(Some(serde_json::from_value(j.clone())?)),
            Some(_) => anyhow::bail!("key '{}' does not hold a JSON value", key),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: KvValue) {
        self.map.insert(key.into(), Entry::plain(value));
    }

    pub fn set_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> anyhow::Result<()> {
        self.set(key, KvValue::Json(serde_json::to_value(value)?));
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> bool { self.map.remove(key).is_some() }

    pub fn incr(&mut self, key: &str, by: i64) -> i64 {
        let ent = self.map.entry(key.to_string()).or_insert_with(|| Entry::plain(KvValue::Int(0)));
        let next = match ent.value { KvValue::Int(i) => i + by, _ => by };
        ent.value = KvValue::Int(next);
        next
    }

    pub fn scan_keys(&self, prefix: &str) -> Vec<String> {
        self.map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Vec<(String, T)> {
        self.map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, e)| match &e.value {
                KvValue::Json(j) => serde_json::from_value::<T>(j.clone()).ok().map(|t| (k.clone(), t)),
                _ => None,
            })
            .collect()
    }
}

/// Registry of KV stores per space under the root path.
#[derive(Clone)]
pub struct KvStoresRegistry {
    root: PathBuf,
    /// space -> (store_name -> KvStore)
    inner: Arc<parking_lot::RwLock<StdHashMap<String, StdHashMap<String, KvStore>>>>,
}

impl KvStoresRegistry {
    fn new(root: PathBuf) -> Self { Self { root, inner: Arc::new(parking_lot::RwLock::new(StdHashMap::new())) } }

    fn stores_dir_for_space(&self, space: &str) -> PathBuf { self.root.join(space).join("stores") }

    pub fn get_store(&self, space: &str, store_name: &str) -> KvStore {
        if let Some(st) = self.inner.read().get(space).and_then(|m| m.get(store_name)).cloned() { return st; }
        let mut w = self.inner.write();
        // Another caller may have created it while we waited for the lock
        if let Some(st) = w.get(space).and_then(|m| m.get(store_name)).cloned() { return st; }
        let dir = self.stores_dir_for_space(space).join(store_name);
        let kv = KvStore::load_or_default(dir, store_name);
        w.entry(space.to_string()).or_default().insert(store_name.to_string(), kv.clone());
        kv
    }

    /// Sweep all stores, return total removed count
    pub fn sweep_all(&self) -> usize {
        let mut total = 0;
        for (_space, m) in self.inner.read().iter() {
            for (_name, kv) in m.iter() { total += kv.sweep(); }
        }
        total
    }

    /// Snapshot every loaded store; returns how many failed.
    pub fn snapshot_all(&self) -> usize {
        let mut failed = 0;
        for (space, m) in self.inner.read().iter() {
            for (name, kv) in m.iter() {
                if let Err(e) = kv.save_snapshot() {
                    failed += 1;
                    warn!(target: "fileplane::kv", "snapshot of {}/{} failed: {}", space, name, e);
                }
            }
        }
        failed
    }
}

/// Live registries by root. Handles are weak so a root's stores are released once the
/// last `SharedStore` on it is dropped; dead entries are pruned on the next open.
static REGISTRIES: OnceLock<parking_lot::Mutex<StdHashMap<PathBuf, Weak<KvStoresRegistry>>>> = OnceLock::new();

fn kv_registry_for_root(root: &Path) -> Arc<KvStoresRegistry> {
    let map = REGISTRIES.get_or_init(|| parking_lot::Mutex::new(StdHashMap::new()));
    let mut m = map.lock();
    if let Some(reg) = m.get(root).and_then(Weak::upgrade) {
        return reg;
    }
    m.retain(|_, w| w.strong_count() > 0);
    let reg = Arc::new(KvStoresRegistry::new(root.to_path_buf()));
    m.insert(root.to_path_buf(), Arc::downgrade(&reg));
    reg
}

impl SharedStore {
    pub fn new(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root_path = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root_path)?;
        let registry = kv_registry_for_root(&root_path);
        Ok(Self { root: Arc::new(root_path), registry })
    }

    pub fn root_path(&self) -> PathBuf { self.root.as_ref().clone() }

    pub fn kv_registry(&self) -> Arc<KvStoresRegistry> { self.registry.clone() }

    pub fn kv_store(&self, space: &str, store_name: &str) -> KvStore {
        self.registry.get_store(space, store_name)
    }
}
