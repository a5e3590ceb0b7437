//! Resource groups: named tags assigned to index nodes.
//!
//! An assignment is stored in the group registry and mirrored in the node's own
//! `resource_groups` list; both sides are kept in step by every operation here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::index::{PathIndex, StorageNode};
use crate::storage::{KvStore, SharedStore};

pub const STORE_NAME: &str = "groups";
/// Content type of index nodes in assignments.
pub const STORAGE_OBJECT: &str = "explorer:storageobject";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceGroup {
    pub user_code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Owners; not consulted by the gate
    #[serde(default)]
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub group_code: String,
    pub content_type: String,
    pub object_id: u64,
    pub object_user_code: String,
}

/// Payload for creating or replacing a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupSpec {
    pub user_code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

pub struct Keys;

impl Keys {
    pub fn group(code: &str) -> String { format!("rg.group::{}", code) }
    pub fn group_prefix() -> &'static str { "rg.group::" }
    pub fn assignment(code: &str, content_type: &str, object_id: u64) -> String {
        format!("rg.assign::{}::{}::{:020}", code, content_type, object_id)
    }
    pub fn assignments_of(code: &str) -> String { format!("rg.assign::{}::", code) }
    pub fn assignment_prefix() -> &'static str { "rg.assign::" }
}

fn internal(e: anyhow::Error) -> AppError {
    AppError::internal("groups_store".to_string(), e.to_string())
}

#[derive(Clone)]
pub struct ResourceGroups {
    kv: KvStore,
    index: PathIndex,
}

impl ResourceGroups {
    pub fn open(store: &SharedStore, space: &str, index: PathIndex) -> Self {
        Self { kv: store.kv_store(space, STORE_NAME), index }
    }

    pub fn create_group(&self, spec: GroupSpec) -> AppResult<ResourceGroup> {
        let code = spec.user_code.trim().to_string();
        if code.is_empty() {
            return Err(AppError::validation("user_code", "user_code: this field is required"));
        }
        let now = Utc::now();
        let group = ResourceGroup {
            name: spec.name.unwrap_or_else(|| code.clone()),
            description: spec.description.unwrap_or_default(),
            members: spec.members,
            user_code: code.clone(),
            created_at: now,
            modified_at: now,
        };
        self.kv.transaction(|txn| -> AppResult<()> {
            if txn.get(&Keys::group(&code)).is_some() {
                return Err(AppError::conflict(
                    "group_exists".to_string(),
                    format!("resource group '{}' already exists", code),
                ));
            }
            txn.set_json(Keys::group(&code), &group).map_err(internal)
        })?;
        info!(target: "fileplane::groups", code = %code, "resource group created");
        Ok(group)
    }

    pub fn update_group(&self, code: &str, spec: GroupSpec) -> AppResult<ResourceGroup> {
        self.kv.transaction(|txn| -> AppResult<ResourceGroup> {
            let Some(mut g) = txn.get_json::<ResourceGroup>(&Keys::group(code)).map_err(internal)? else {
                return Err(AppError::not_found("group_not_found".to_string(), format!("resource group '{}' does not exist", code)));
            };
            if let Some(n) = spec.name { g.name = n; }
            if let Some(d) = spec.description { g.description = d; }
            g.members = spec.members;
            g.modified_at = Utc::now();
            txn.set_json(Keys::group(code), &g).map_err(internal)?;
            Ok(g)
        })
    }

    pub fn get_group(&self, code: &str) -> AppResult<Option<ResourceGroup>> {
        self.kv.get_json(&Keys::group(code)).map_err(internal)
    }

    pub fn require_group(&self, code: &str) -> AppResult<ResourceGroup> {
        self.get_group(code)?.ok_or_else(|| {
            AppError::not_found("group_not_found".to_string(), format!("resource group '{}' does not exist", code))
        })
    }

    pub fn list_groups(&self) -> Vec<ResourceGroup> {
        self.kv.scan_json(Keys::group_prefix())
    }

    pub fn assignments(&self, code: &str) -> Vec<Assignment> {
        self.kv.scan_json(&Keys::assignments_of(code))
    }

    /// Object ids of one content type tagged with `code`.
    pub fn object_ids(&self, code: &str, content_type: &str) -> Vec<u64> {
        self.assignments(code).into_iter().filter(|a| a.content_type == content_type).map(|a| a.object_id).collect()
    }

    /// Tag a node. Adding an existing assignment changes nothing.
    pub fn add_object(&self, code: &str, node: &StorageNode) -> AppResult<StorageNode> {
        self.require_group(code)?;
        let a = Assignment {
            group_code: code.to_string(),
            content_type: STORAGE_OBJECT.to_string(),
            object_id: node.id,
            object_user_code: node.path.clone(),
        };
        self.kv.set_json(Keys::assignment(code, STORAGE_OBJECT, node.id), &a).map_err(internal)?;
        self.index.update(&node.path, |n| {
            if !n.resource_groups.iter().any(|g| g == code) {
                n.resource_groups.push(code.to_string());
            }
        })
    }

    /// Untag a node. Missing assignments are ignored.
    pub fn remove_object(&self, code: &str, node: &StorageNode) -> AppResult<StorageNode> {
        self.kv.delete(&Keys::assignment(code, STORAGE_OBJECT, node.id));
        match self.index.update(&node.path, |n| n.resource_groups.retain(|g| g != code)) {
            Ok(n) => Ok(n),
            Err(e) if e.is_not_found() => Ok(node.clone()),
            Err(e) => Err(e),
        }
    }

    /// Remove every assignment of a group and prune the tagged nodes.
    pub fn destroy_assignments(&self, code: &str) -> AppResult<usize> {
        let assignments = self.assignments(code);
        for a in assignments.iter().filter(|a| a.content_type == STORAGE_OBJECT) {
            if let Some(node) = self.index.get_by_id(a.object_id)? {
                self.index.update(&node.path, |n| n.resource_groups.retain(|g| g != code))?;
            }
        }
        let n = self.kv.delete_prefix(&Keys::assignments_of(code));
        Ok(n)
    }

    pub fn delete_group(&self, code: &str) -> AppResult<()> {
        self.require_group(code)?;
        let removed = self.destroy_assignments(code)?;
        self.kv.delete(&Keys::group(code));
        info!(target: "fileplane::groups", code, assignments = removed, "resource group deleted");
        Ok(())
    }

    /// Replace the node's groups with exactly `codes`. Unknown codes are rejected up front.
    pub fn set_groups(&self, node: &StorageNode, codes: &[String]) -> AppResult<StorageNode> {
        let unknown: Vec<&str> = codes
            .iter()
            .filter(|c| self.kv.get(&Keys::group(c)).is_none())
            .map(|c| c.as_str())
            .collect();
        if !unknown.is_empty() {
            return Err(AppError::validation(
                "resource_groups".to_string(),
                format!("resource_groups: unknown resource group(s) {}", unknown.join(", ")),
            ));
        }
        let mut current = node.clone();
        for old in node.resource_groups.iter().filter(|g| !codes.contains(*g)) {
            current = self.remove_object(old, &current)?;
        }
        for code in codes {
            current = self.add_object(code, &current)?;
        }
        Ok(current)
    }

    /// Drop assignments of nodes that left the index.
    pub fn forget_nodes(&self, nodes: &[StorageNode]) -> usize {
        if nodes.is_empty() {
            return 0;
        }
        let ids: std::collections::HashSet<u64> = nodes.iter().map(|n| n.id).collect();
        self.kv.transaction(|txn| {
            let doomed: Vec<String> = txn
                .scan_json::<Assignment>(Keys::assignment_prefix())
                .into_iter()
                .filter(|(_, a)| a.content_type == STORAGE_OBJECT && ids.contains(&a.object_id))
                .map(|(k, _)| k)
                .collect();
            for k in doomed.iter() {
                txn.delete(k);
            }
            doomed.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, PathIndex, ResourceGroups) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        let index = PathIndex::open(&store, "space00000");
        let groups = ResourceGroups::open(&store, "space00000", index.clone());
        (tmp, index, groups)
    }

    fn group(code: &str) -> GroupSpec {
        GroupSpec { user_code: code.into(), ..GroupSpec::default() }
    }

    #[test]
    fn add_object_twice_leaves_one_entry() {
        let (_t, index, groups) = setup();
        groups.create_group(group("finance")).unwrap();
        let node = index.upsert_file("space00000/a.txt", 1).unwrap();
        groups.add_object("finance", &node).unwrap();
        let node = groups.add_object("finance", &node).unwrap();
        assert_eq!(node.resource_groups, vec!["finance".to_string()]);
        assert_eq!(groups.assignments("finance").len(), 1);
    }

    #[test]
    fn remove_object_is_idempotent() {
        let (_t, index, groups) = setup();
        groups.create_group(group("ops")).unwrap();
        let node = index.upsert_file("space00000/a.txt", 1).unwrap();
        let node = groups.add_object("ops", &node).unwrap();
        let node = groups.remove_object("ops", &node).unwrap();
        let node = groups.remove_object("ops", &node).unwrap();
        assert!(node.resource_groups.is_empty());
        assert!(groups.assignments("ops").is_empty());
    }

    #[test]
    fn deleting_group_prunes_nodes() {
        let (_t, index, groups) = setup();
        groups.create_group(group("g1")).unwrap();
        groups.create_group(group("g2")).unwrap();
        let a = index.upsert_file("space00000/a.txt", 1).unwrap();
        let b = index.upsert_directory("space00000/docs/").unwrap();
        groups.set_groups(&a, &["g1".to_string(), "g2".to_string()]).unwrap();
        groups.add_object("g1", &b).unwrap();

        groups.delete_group("g1").unwrap();
        assert!(groups.get_group("g1").unwrap().is_none());
        assert_eq!(index.get_by_path("space00000/a.txt").unwrap().unwrap().resource_groups, vec!["g2".to_string()]);
        assert!(index.get_by_path("space00000/docs/*").unwrap().unwrap().resource_groups.is_empty());
        assert!(groups.assignments("g1").is_empty());
    }

    #[test]
    fn set_groups_replaces_and_validates() {
        let (_t, index, groups) = setup();
        groups.create_group(group("a")).unwrap();
        groups.create_group(group("b")).unwrap();
        let n = index.upsert_file("space00000/x.txt", 1).unwrap();
        let n = groups.set_groups(&n, &["a".to_string()]).unwrap();
        let n = groups.set_groups(&n, &["b".to_string()]).unwrap();
        assert_eq!(n.resource_groups, vec!["b".to_string()]);
        assert!(groups.assignments("a").is_empty());

        let err = groups.set_groups(&n, &["nope".to_string()]).unwrap_err();
        assert_eq!(err.error_key(), "validation_error");
        assert!(err.message().contains("nope"));

        let n = groups.set_groups(&n, &[]).unwrap();
        assert!(n.resource_groups.is_empty());
        assert!(groups.assignments("b").is_empty());
    }

    #[test]
    fn duplicate_group_conflicts_and_missing_group_is_not_found() {
        let (_t, index, groups) = setup();
        groups.create_group(group("dup")).unwrap();
        assert_eq!(groups.create_group(group("dup")).unwrap_err().error_key(), "conflict");
        assert_eq!(groups.create_group(group("  ")).unwrap_err().error_key(), "validation_error");
        let n = index.upsert_file("space00000/x.txt", 1).unwrap();
        assert!(groups.add_object("ghost", &n).unwrap_err().is_not_found());
    }

    #[test]
    fn forgetting_deleted_nodes_drops_assignments() {
        let (_t, index, groups) = setup();
        groups.create_group(group("g")).unwrap();
        let n = index.upsert_file("space00000/d/x.txt", 1).unwrap();
        groups.add_object("g", &n).unwrap();
        let removed = index.delete_by_path("space00000/d/*").unwrap();
        assert_eq!(groups.forget_nodes(&removed), 1);
        assert!(groups.assignments("g").is_empty());
    }
}
