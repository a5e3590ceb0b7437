//! Path index: the tree of storage nodes mirroring what the driver holds.
//!
//! Nodes live in the `index` KV store of a space, keyed by their index path, with a
//! secondary id -> path entry. Ancestry is derived from path prefixes: the ancestors
//! of `a/b/c.txt` are exactly `a/*` and `a/b/*`, so `ancestors` and `descendants` are
//! prefix lookups and never recurse. Every write that touches a node and its parents
//! runs inside one store transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::paths::{self, ROOT};
use crate::storage::{KvStore, KvTxn, SharedStore};

pub const STORE_NAME: &str = "index";

/// One file or directory in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageNode {
    pub id: u64,
    pub path: String,
    pub is_file: bool,
    /// Index path of the parent directory; `None` for top-level nodes
    pub parent: Option<String>,
    pub parent_id: Option<u64>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub resource_groups: Vec<String>,
    /// Number of directories above this node
    pub depth: usize,
    /// First path segment; nodes of one tree share it
    pub tree_id: String,
}

impl StorageNode {
    pub fn name(&self) -> &str {
        paths::basename(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        !self.is_file
    }
}

/// Key builders for the index namespace.
pub struct Keys;

impl Keys {
    pub fn node(path: &str) -> String { format!("index.node::{}", path) }
    #[inline]
    pub fn node_prefix() -> String { "index.node::".to_string() }
    pub fn id(id: u64) -> String { format!("index.id::{:020}", id) }
    pub fn seq() -> &'static str { "index.seq" }
}

fn decode(txn: &KvTxn<'_>, key: &str) -> AppResult<Option<StorageNode>> {
    txn.get_json::<StorageNode>(key)
        .map_err(|e| AppError::internal("index_decode".to_string(), format!("corrupt index entry '{}': {}", key, e)))
}

fn encode(txn: &mut KvTxn<'_>, node: &StorageNode) -> AppResult<()> {
    txn.set_json(Keys::node(&node.path), node)
        .map_err(|e| AppError::internal("index_encode".to_string(), e.to_string()))?;
    txn.set(Keys::id(node.id), crate::storage::KvValue::Str(node.path.clone()));
    Ok(())
}

fn fresh_node(txn: &mut KvTxn<'_>, path: &str, is_file: bool, size: u64, parent: Option<&StorageNode>) -> StorageNode {
    let id = txn.incr(Keys::seq(), 1) as u64;
    let now = Utc::now();
    StorageNode {
        id,
        path: path.to_string(),
        is_file,
        parent: parent.map(|p| p.path.clone()),
        parent_id: parent.map(|p| p.id),
        size: if is_file { size } else { 0 },
        created_at: now,
        modified_at: now,
        resource_groups: Vec::new(),
        depth: paths::depth_of(path),
        tree_id: paths::split_segments(path).first().map(|s| s.to_string()).unwrap_or_default(),
    }
}

/// Create every missing directory on the way to `dir` (inclusive) and return it.
fn ensure_directory(txn: &mut KvTxn<'_>, dir: &str) -> AppResult<StorageNode> {
    let mut parent: Option<StorageNode> = None;
    let mut chain = paths::ancestor_paths(dir);
    chain.push(dir.to_string());
    for p in chain {
        let node = match decode(txn, &Keys::node(&p))? {
            Some(n) if n.is_file => {
                return Err(AppError::conflict(
                    "file_in_the_way".to_string(),
                    format!("'{}' is a file, cannot hold children", p),
                ))
            }
            Some(n) => n,
            None => {
                let body = p.strip_suffix(paths::DIR_SUFFIX).unwrap_or(&p);
                if !body.is_empty() && decode(txn, &Keys::node(body))?.is_some() {
                    return Err(AppError::conflict(
                        "file_in_the_way".to_string(),
                        format!("a file already exists at '{}'", body),
                    ));
                }
                let n = fresh_node(txn, &p, false, 0, parent.as_ref());
                encode(txn, &n)?;
                n
            }
        };
        parent = Some(node);
    }
    parent.ok_or_else(|| AppError::internal("index_empty_chain", "directory chain is empty"))
}

fn require_file_path(p: &str) -> AppResult<String> {
    let p = paths::normalize(p)?;
    if paths::is_dir(&p) {
        return Err(AppError::invalid_path(
            "directory_path".to_string(),
            format!("'{}' names a directory, a file path was expected", p),
        ));
    }
    Ok(p)
}

fn require_dir_path(p: &str) -> AppResult<String> {
    Ok(paths::to_dir_path(&paths::normalize(&paths::to_dir_path(p))?))
}

/// Handle on the index of one space.
#[derive(Clone)]
pub struct PathIndex {
    kv: KvStore,
}

impl PathIndex {
    pub fn open(store: &SharedStore, space: &str) -> Self {
        Self { kv: store.kv_store(space, STORE_NAME) }
    }

    pub fn kv(&self) -> &KvStore { &self.kv }

    /// Create or update a file node, creating its missing ancestors.
    pub fn upsert_file(&self, full_path: &str, size: u64) -> AppResult<StorageNode> {
        let path = require_file_path(full_path)?;
        let Some(parent_path) = paths::parent_of(&path) else {
            return Err(AppError::no_directory(
                "no_directory".to_string(),
                format!("'{}' has no directory segment", path),
            ));
        };
        let node = self.kv.transaction(|txn| -> AppResult<StorageNode> {
            if decode(txn, &Keys::node(&paths::to_dir_path(&path)))?.is_some() {
                return Err(AppError::conflict(
                    "directory_in_the_way".to_string(),
                    format!("a directory already exists at '{}'", path),
                ));
            }
            let parent = ensure_directory(txn, &parent_path)?;
            let node = match decode(txn, &Keys::node(&path))? {
                Some(mut n) => {
                    n.size = size;
                    n.modified_at = Utc::now();
                    n
                }
                None => fresh_node(txn, &path, true, size, Some(&parent)),
            };
            encode(txn, &node)?;
            Ok(node)
        })?;
        debug!(target: "fileplane::index", path = %node.path, size, "upsert_file");
        Ok(node)
    }

    pub fn upsert_directory(&self, full_path: &str) -> AppResult<StorageNode> {
        let path = require_dir_path(full_path)?;
        if path == ROOT {
            return self.kv.transaction(|txn| -> AppResult<StorageNode> {
                if let Some(n) = decode(txn, &Keys::node(ROOT))? {
                    return Ok(n);
                }
                let n = fresh_node(txn, ROOT, false, 0, None);
                encode(txn, &n)?;
                Ok(n)
            });
        }
        let node = self.kv.transaction(|txn| ensure_directory(txn, &path))?;
        debug!(target: "fileplane::index", path = %node.path, "upsert_directory");
        Ok(node)
    }

    pub fn get_by_path(&self, p: &str) -> AppResult<Option<StorageNode>> {
        let path = paths::normalize(p)?;
        self.kv
            .get_json::<StorageNode>(&Keys::node(&path))
            .map_err(|e| AppError::internal("index_decode".to_string(), e.to_string()))
    }

    /// Exact lookup, then the same path read as a directory.
    pub fn resolve(&self, p: &str) -> AppResult<Option<StorageNode>> {
        if let Some(n) = self.get_by_path(p)? {
            return Ok(Some(n));
        }
        self.get_by_path(&paths::to_dir_path(p))
    }

    pub fn get_by_id(&self, id: u64) -> AppResult<Option<StorageNode>> {
        match self.kv.get(&Keys::id(id)) {
            Some(crate::storage::KvValue::Str(path)) => self.get_by_path(&path),
            _ => Ok(None),
        }
    }

    /// Remove a node; a directory takes all its descendants with it.
    /// Returns every removed node.
    pub fn delete_by_path(&self, p: &str) -> AppResult<Vec<StorageNode>> {
        let path = paths::normalize(p)?;
        let removed = self.kv.transaction(|txn| -> AppResult<Vec<StorageNode>> {
            let Some(node) = decode(txn, &Keys::node(&path))? else { return Ok(Vec::new()) };
            let mut doomed = vec![node.clone()];
            if node.is_dir() {
                let prefix = Keys::node(&paths::dir_prefix(&node.path));
                for (_, n) in txn.scan_json::<StorageNode>(&prefix) {
                    if n.path != node.path { doomed.push(n); }
                }
            }
            for n in doomed.iter() {
                txn.delete(&Keys::node(&n.path));
                txn.delete(&Keys::id(n.id));
            }
            Ok(doomed)
        })?;
        debug!(target: "fileplane::index", path = %path, removed = removed.len(), "delete_by_path");
        Ok(removed)
    }

    /// Immediate children of a directory node, as `(dirs, files)` sorted by path.
    pub fn list_children(&self, dir: &StorageNode) -> AppResult<(Vec<StorageNode>, Vec<StorageNode>)> {
        let candidates: Vec<StorageNode> = if dir.path == ROOT {
            self.kv.scan_json::<StorageNode>(&Keys::node_prefix()).into_iter().filter(|n| n.parent.is_none() && n.path != ROOT).collect()
        } else {
            self.kv
                .scan_json::<StorageNode>(&Keys::node(&paths::dir_prefix(&dir.path)))
                .into_iter()
                .filter(|n| n.parent.as_deref() == Some(dir.path.as_str()))
                .collect()
        };
        Ok(candidates.into_iter().partition(|n| n.is_dir()))
    }

    /// Indexed ancestors, root first; the node itself last when `include_self`.
    pub fn ancestors(&self, node: &StorageNode, include_self: bool) -> AppResult<Vec<StorageNode>> {
        let mut out = Vec::new();
        for p in paths::ancestor_paths(&node.path) {
            if let Some(n) = self.get_by_path(&p)? {
                out.push(n);
            }
        }
        if include_self {
            out.push(node.clone());
        }
        Ok(out)
    }

    /// Everything strictly below a directory node, in path order.
    pub fn descendants(&self, node: &StorageNode) -> AppResult<Vec<StorageNode>> {
        if node.is_file {
            return Ok(Vec::new());
        }
        let prefix = if node.path == ROOT { Keys::node_prefix() } else { Keys::node(&paths::dir_prefix(&node.path)) };
        Ok(self.kv.scan_json::<StorageNode>(&prefix).into_iter().filter(|n| n.path != node.path).collect())
    }

    /// Every node whose path starts with `prefix` (all nodes for an empty prefix).
    pub fn list_nodes(&self, prefix: &str) -> Vec<StorageNode> {
        self.kv.scan_json::<StorageNode>(&Keys::node(prefix))
    }

    /// Case-insensitive substring match over file names and paths.
    pub fn search(&self, query: &str, within: &str) -> Vec<StorageNode> {
        let q = query.to_lowercase();
        self.list_nodes(within)
            .into_iter()
            .filter(|n| n.is_file)
            .filter(|n| q.is_empty() || n.name().to_lowercase().contains(&q) || n.path.to_lowercase().contains(&q))
            .collect()
    }

    /// Drop every file node, keeping directories. Returns the removed nodes.
    pub fn delete_all_file_objects(&self) -> AppResult<Vec<StorageNode>> {
        let removed = self.kv.transaction(|txn| {
            let files: Vec<StorageNode> = txn
                .scan_json::<StorageNode>(&Keys::node_prefix())
                .into_iter()
                .map(|(_, n)| n)
                .filter(|n| n.is_file)
                .collect();
            for n in files.iter() {
                txn.delete(&Keys::node(&n.path));
                txn.delete(&Keys::id(n.id));
            }
            files
        });
        debug!(target: "fileplane::index", removed = removed.len(), "delete_all_file_objects");
        Ok(removed)
    }

    /// Apply `f` to one node under the store lock and persist the result.
    pub fn update<F>(&self, path: &str, f: F) -> AppResult<StorageNode>
    where
        F: FnOnce(&mut StorageNode),
    {
        let path = paths::normalize(path)?;
        self.kv.transaction(|txn| -> AppResult<StorageNode> {
            let Some(mut node) = decode(txn, &Keys::node(&path))? else {
                return Err(AppError::not_found("node_not_found".to_string(), format!("'{}' is not indexed", path)));
            };
            f(&mut node);
            encode(txn, &node)?;
            Ok(node)
        })
    }

    pub fn len(&self) -> usize {
        self.list_nodes("").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
