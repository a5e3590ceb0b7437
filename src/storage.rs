//!
//! fileplane persistence substrate
//! -------------------------------
//! Metadata (path index, resource groups, IAM directory, tasks, domain records) lives in
//! named in-memory KV stores, one set per space, snapshotted to disk under a data root.
//! `SharedStore` is the cheap, cloneable handle threaded through the whole crate.

use std::path::PathBuf;
use std::sync::Arc;

pub mod kv;

pub use kv::{KvStore, KvStoresRegistry, KvTxn, KvValue, StoreSettings};

/// Handle to the KV registry rooted at a data directory.
#[derive(Clone)]
pub struct SharedStore {
    root: Arc<PathBuf>,
    registry: Arc<KvStoresRegistry>,
}
