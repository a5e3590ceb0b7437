//! Per-member memo of compiled effective policies.
//!
//! Entries are dropped when the directory publishes an event naming the member.
//! Compiled documents are shared across members and keyed by policy code; a hit also
//! needs the store-wide revision to match, and deleted codes are evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::debug;

use crate::error::AppResult;

use super::condition::ConditionRegistry;
use super::directory::IamEvent;
use super::model::AccessPolicy;
use super::statement::CompiledPolicy;

pub struct PolicyCache {
    members: RwLock<HashMap<String, Vec<Arc<CompiledPolicy>>>>,
    compiled: RwLock<HashMap<String, Arc<CompiledPolicy>>>,
    events: Mutex<broadcast::Receiver<IamEvent>>,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PolicyCache {
    pub fn new(events: broadcast::Receiver<IamEvent>) -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            compiled: RwLock::new(HashMap::new()),
            events: Mutex::new(events),
            epoch: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Apply every pending invalidation. Returns the epoch after draining.
    pub fn drain(&self) -> u64 {
        let mut rx = self.events.lock();
        loop {
            match rx.try_recv() {
                Ok(IamEvent::Members(names)) => {
                    let mut m = self.members.write();
                    for n in names.iter() {
                        m.remove(n);
                    }
                    self.epoch.fetch_add(1, Ordering::Relaxed);
                }
                Ok(IamEvent::Policies(codes)) => {
                    let mut c = self.compiled.write();
                    for code in codes.iter() {
                        c.remove(code);
                    }
                    self.epoch.fetch_add(1, Ordering::Relaxed);
                }
                Ok(IamEvent::All) | Err(TryRecvError::Lagged(_)) => {
                    self.members.write().clear();
                    self.compiled.write().clear();
                    self.epoch.fetch_add(1, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn epoch(&self) -> u64 { self.epoch.load(Ordering::Relaxed) }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        self.members.write().clear();
        self.compiled.write().clear();
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    fn compile(&self, p: &AccessPolicy, reg: &ConditionRegistry) -> AppResult<Arc<CompiledPolicy>> {
        if let Some(c) = self.compiled.read().get(&p.user_code) {
            if c.revision == p.revision {
                return Ok(c.clone());
            }
        }
        let c = CompiledPolicy::compile(&p.user_code, p.revision, &p.policy)?;
        c.check_conditions(reg)?;
        let c = Arc::new(c);
        self.compiled.write().insert(p.user_code.clone(), c.clone());
        Ok(c)
    }

    /// Cached compiled policies for `username`, loading through `load` on a miss.
    /// A load that raced with an invalidation is returned but not memoized.
    pub fn get_or_load<F>(&self, username: &str, reg: &ConditionRegistry, load: F) -> AppResult<Vec<Arc<CompiledPolicy>>>
    where
        F: FnOnce() -> AppResult<Vec<AccessPolicy>>,
    {
        let before = self.drain();
        if let Some(hit) = self.members.read().get(username) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let compiled = load()?.iter().map(|p| self.compile(p, reg)).collect::<AppResult<Vec<_>>>()?;
        if self.drain() == before {
            self.members.write().insert(username.to_string(), compiled.clone());
        } else {
            debug!(target: "fileplane::iam", member = username, "policy set changed during load; not cached");
        }
        Ok(compiled)
    }
}
