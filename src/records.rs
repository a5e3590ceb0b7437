//! Domain records: the rows bulk delete acts on.
//!
//! Records are free-form JSON objects grouped by content type. Three fields carry
//! meaning here: `user_code` (the `-` code marks the built-in default row),
//! `is_systemic`, and `is_deleted`, whose presence switches delete to a soft delete.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::storage::{KvStore, SharedStore};

pub const STORE_NAME: &str = "records";

/// User code of the default row every content type ships with.
pub const DASH_USER_CODE: &str = "-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: u64,
    pub content_type: String,
    pub user_code: String,
    #[serde(default)]
    pub is_systemic: bool,
    /// `None` when the content type has no soft-delete flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_deleted: Option<bool>,
    #[serde(default, flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn is_protected(&self) -> bool {
        self.user_code == DASH_USER_CODE || self.is_systemic
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordSpec {
    pub user_code: String,
    #[serde(default)]
    pub is_systemic: bool,
    #[serde(default)]
    pub is_deleted: Option<bool>,
    #[serde(default, flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Deletion {
    Soft,
    Hard,
}

pub struct Keys;

impl Keys {
    pub fn record(content_type: &str, id: u64) -> String { format!("rec::{}::{:020}", content_type, id) }
    pub fn of_type(content_type: &str) -> String { format!("rec::{}::", content_type) }
    pub fn seq() -> &'static str { "rec.seq" }
}

fn internal(e: anyhow::Error) -> AppError {
    AppError::internal("records_store".to_string(), e.to_string())
}

#[derive(Clone)]
pub struct RecordStore {
    kv: KvStore,
}

impl RecordStore {
    pub fn open(store: &SharedStore, space: &str) -> Self {
        Self { kv: store.kv_store(space, STORE_NAME) }
    }

    pub fn insert(&self, content_type: &str, spec: RecordSpec) -> AppResult<Record> {
        if content_type.trim().is_empty() {
            return Err(AppError::validation("content_type", "content_type: may not be blank"));
        }
        if spec.user_code.trim().is_empty() {
            return Err(AppError::validation("user_code", "user_code: may not be blank"));
        }
        self.kv.transaction(|txn| {
            let taken = txn
                .scan_json::<Record>(&Keys::of_type(content_type))
                .into_iter()
                .any(|(_, r)| r.user_code == spec.user_code);
            if taken {
                return Err(AppError::conflict(
                    "duplicate_user_code".to_string(),
                    format!("{} '{}' already exists", content_type, spec.user_code),
                ));
            }
            let id = txn.incr(Keys::seq(), 1) as u64;
            let mut fields = spec.fields;
            fields.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
            let rec = Record {
                id,
                content_type: content_type.to_string(),
                user_code: spec.user_code,
                is_systemic: spec.is_systemic,
                is_deleted: spec.is_deleted,
                fields,
            };
            txn.set_json(Keys::record(content_type, id), &rec).map_err(internal)?;
            Ok(rec)
        })
    }

    pub fn get(&self, content_type: &str, id: u64) -> AppResult<Option<Record>> {
        self.kv.get_json(&Keys::record(content_type, id)).map_err(internal)
    }

    pub fn require(&self, content_type: &str, id: u64) -> AppResult<Record> {
        self.get(content_type, id)?
            .ok_or_else(|| AppError::not_found("record_not_found".to_string(), format!("{} {} not found", content_type, id)))
    }

    /// Records of a type, soft-deleted ones only when asked for.
    pub fn list(&self, content_type: &str, include_deleted: bool) -> Vec<Record> {
        self.kv
            .scan_json::<Record>(&Keys::of_type(content_type))
            .into_iter()
            .filter(|r| include_deleted || r.is_deleted != Some(true))
            .collect()
    }

    /// Load every record in `ids` and refuse the whole batch when any is missing or
    /// protected. Nothing is modified.
    pub fn check_deletable(&self, content_type: &str, ids: &[u64]) -> AppResult<Vec<Record>> {
        self.kv.transaction(|txn| {
            let mut found = Vec::with_capacity(ids.len());
            for id in ids {
                let rec = txn
                    .get_json::<Record>(&Keys::record(content_type, *id))
                    .map_err(internal)?
                    .ok_or_else(|| AppError::not_found("record_not_found".to_string(), format!("{} {} not found", content_type, id)))?;
                if rec.is_protected() {
                    return Err(AppError::conflict(
                        "protected_record".to_string(),
                        format!("cannot delete default or systemic {} '{}' (id {})", content_type, rec.user_code, rec.id),
                    ));
                }
                found.push(rec);
            }
            Ok(found)
        })
    }

    /// Soft delete when the record has an `is_deleted` flag, remove it otherwise.
    pub fn delete_one(&self, content_type: &str, id: u64) -> AppResult<Deletion> {
        let key = Keys::record(content_type, id);
        let outcome = self.kv.transaction(|txn| {
            let Some(mut rec) = txn.get_json::<Record>(&key).map_err(internal)? else {
                return Err(AppError::not_found("record_not_found".to_string(), format!("{} {} not found", content_type, id)));
            };
            if rec.is_protected() {
                return Err(AppError::conflict(
                    "protected_record".to_string(),
                    format!("cannot delete default or systemic {} '{}'", content_type, rec.user_code),
                ));
            }
            match rec.is_deleted {
                Some(_) => {
                    rec.is_deleted = Some(true);
                    rec.fields.insert("deleted_at".into(), Value::String(Utc::now().to_rfc3339()));
                    txn.set_json(key.clone(), &rec).map_err(internal)?;
                    Ok(Deletion::Soft)
                }
                None => {
                    txn.delete(&key);
                    Ok(Deletion::Hard)
                }
            }
        })?;
        info!(target: "fileplane::records", content_type, id, deletion = ?outcome, "record deleted");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, RecordStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        (tmp, RecordStore::open(&store, "space00000"))
    }

    fn spec(code: &str, soft: bool) -> RecordSpec {
        RecordSpec { user_code: code.into(), is_deleted: soft.then_some(false), ..RecordSpec::default() }
    }

    #[test]
    fn soft_and_hard_delete() {
        let (_t, s) = fixture();
        let soft = s.insert("portfolio", spec("p1", true)).unwrap();
        let hard = s.insert("portfolio", spec("p2", false)).unwrap();
        assert_eq!(s.delete_one("portfolio", soft.id).unwrap(), Deletion::Soft);
        assert_eq!(s.delete_one("portfolio", hard.id).unwrap(), Deletion::Hard);
        assert_eq!(s.require("portfolio", soft.id).unwrap().is_deleted, Some(true));
        assert!(s.get("portfolio", hard.id).unwrap().is_none());
        assert!(s.list("portfolio", false).is_empty());
        assert_eq!(s.list("portfolio", true).len(), 1);
    }

    #[test]
    fn protected_records_block_the_batch() {
        let (_t, s) = fixture();
        let ok = s.insert("account", spec("a1", false)).unwrap();
        let dash = s.insert("account", spec("-", false)).unwrap();
        let sys = s.insert("account", RecordSpec { is_systemic: true, ..spec("sys", false) }).unwrap();
        for bad in [dash.id, sys.id] {
            let err = s.check_deletable("account", &[ok.id, bad]).unwrap_err();
            assert_eq!(err.error_key(), "conflict");
        }
        assert_eq!(s.check_deletable("account", &[ok.id, 999]).unwrap_err().error_key(), "not_found");
        assert!(s.get("account", ok.id).unwrap().is_some());
    }

    #[test]
    fn extra_fields_survive_and_user_codes_are_unique() {
        let (_t, s) = fixture();
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String("Main".into()));
        let r = s.insert("portfolio", RecordSpec { fields, ..spec("main", false) }).unwrap();
        assert_eq!(s.require("portfolio", r.id).unwrap().fields.get("name"), Some(&Value::String("Main".into())));
        assert_eq!(s.insert("portfolio", spec("main", false)).unwrap_err().error_key(), "conflict");
    }
}
