use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::driver::archive;
use crate::groups::GroupSpec;
use crate::records::{RecordSpec, RecordStore};
use crate::storage::SharedStore;
use crate::tasks::{Progress, TaskRunner, TaskStatus, TaskStore};

const SPACE: &str = "space00000";

struct Fixture {
    _tmp: tempfile::TempDir,
    storage: Storage,
    index: PathIndex,
    groups: ResourceGroups,
    records: RecordStore,
    runner: TaskRunner,
}

fn fixture_with(max_files: usize) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let store = SharedStore::new(tmp.path()).unwrap();
    let storage = Storage::memory(None);
    let index = PathIndex::open(&store, SPACE);
    let groups = ResourceGroups::open(&store, SPACE, index.clone());
    let records = RecordStore::open(&store, SPACE);
    let ops = Operations::new(storage.clone(), index.clone(), groups.clone(), records.clone()).with_max_files(max_files);
    let runner = TaskRunner::start(TaskStore::open(&store, SPACE), Arc::new(ops), 2);
    Fixture { _tmp: tmp, storage, index, groups, records, runner }
}

fn fixture() -> Fixture {
    fixture_with(MAX_FILES)
}

impl Fixture {
    async fn run(&self, options: TaskOptions) -> Task {
        let t = self.runner.submit(options, "alice").unwrap();
        self.runner.wait_terminal(t.id, Duration::from_secs(5)).await.unwrap()
    }

    async fn put(&self, key: &str, bytes: &[u8]) {
        self.storage.save(key, bytes).await.unwrap();
    }

    fn saved(&self) -> Vec<String> {
        self.storage.memory_backend().unwrap().saved_keys()
    }

    fn clear_calls(&self) {
        self.storage.memory_backend().unwrap().clear_calls();
    }

    async fn bytes_under(&self, dir: &str) -> u64 {
        self.storage
            .walk_files(dir)
            .await
            .unwrap()
            .iter()
            .filter(|o| !o.key.ends_with(paths::INIT_MARKER))
            .map(|o| o.size)
            .sum()
    }
}

fn mv(target: &str, items: &[&str]) -> TaskOptions {
    TaskOptions::Move { target_directory_path: target.into(), items: items.iter().map(|s| s.to_string()).collect() }
}

fn cp(target: &str, items: &[&str]) -> TaskOptions {
    TaskOptions::Copy { target_directory_path: target.into(), items: items.iter().map(|s| s.to_string()).collect() }
}

#[tokio::test]
async fn moving_one_file_reports_full_progress() {
    let f = fixture();
    f.put("space00000/test/", b"").await;
    f.put("space00000/file.txt", b"hello world").await;
    let t = f.run(mv("space00000/test/*", &["space00000/file.txt"])).await;
    assert_eq!(t.status, TaskStatus::Done, "{:?}", t.error_message);
    assert_eq!(t.verbose_result.as_deref(), Some("moved 1 items"));
    assert_eq!(
        t.progress,
        Progress { current: 1, total: 1, percent: 100, description: "move_directory_in_storage finished".into() }
    );
    assert!(!f.storage.exists("space00000/file.txt").await.unwrap());
    assert_eq!(f.storage.open("space00000/test/file.txt").await.unwrap(), b"hello world");
    assert_eq!(f.index.get_by_path("space00000/test/file.txt").unwrap().unwrap().size, 11);
}

#[tokio::test]
async fn moving_a_tree_preserves_bytes_and_empties_the_source() {
    let f = fixture();
    f.put("space00000/docs/a.csv", b"1,2").await;
    f.put("space00000/docs/deep/b.txt", b"four").await;
    f.put("space00000/docs/empty/", b"").await;
    f.put("space00000/archive/", b"").await;
    f.index.upsert_file("space00000/docs/a.csv", 3).unwrap();
    let before_source = f.bytes_under("space00000/docs/").await;
    let before_target = f.bytes_under("space00000/archive/").await;

    let t = f.run(mv("space00000/archive/*", &["space00000/docs/*"])).await;
    assert_eq!(t.status, TaskStatus::Done, "{:?}", t.error_message);
    assert_eq!(t.verbose_result.as_deref(), Some("moved 2 items"));
    assert_eq!(f.bytes_under("space00000/archive/").await, before_target + before_source);
    assert!(f.storage.walk_files("space00000/docs/").await.unwrap().is_empty());
    assert!(f.storage.exists("space00000/archive/docs/empty/.init").await.unwrap());
    assert!(f.index.get_by_path("space00000/docs/*").unwrap().is_none());
    assert!(f.index.get_by_path("space00000/docs/a.csv").unwrap().is_none());
    assert!(f.index.get_by_path("space00000/archive/docs/deep/b.txt").unwrap().is_some());
    assert!(f.index.get_by_path("space00000/archive/docs/empty/*").unwrap().is_some());
}

#[tokio::test]
async fn too_many_files_aborts_before_any_copy() {
    let f = fixture_with(2);
    f.put("space00000/t/", b"").await;
    for name in ["a", "b", "c"] {
        f.put(&format!("space00000/src/{}.txt", name), b"x").await;
    }
    f.clear_calls();
    let t = f.run(mv("space00000/t/*", &["space00000/src"])).await;
    assert_eq!(t.status, TaskStatus::Error);
    assert!(t.error_message.unwrap().contains("at most 2"));
    assert!(f.saved().is_empty());
    assert_eq!(f.storage.walk_files("space00000/src/").await.unwrap().len(), 3);
}

#[tokio::test]
async fn transfer_validation() {
    let f = fixture();
    f.put("space00000/t/inner.txt", b"x").await;
    f.put("space00000/t/sub/", b"").await;
    let ops = Operations::new(f.storage.clone(), f.index.clone(), f.groups.clone(), f.records.clone());
    let key = |r: AppResult<()>| r.unwrap_err().error_key();
    assert_eq!(key(ops.validate_transfer("space00000/missing/*", &["space00000/x".into()]).await), "validation_error");
    assert_eq!(key(ops.validate_transfer("space00000/t/*", &["space00000/t".into()]).await), "validation_error");
    assert_eq!(key(ops.validate_transfer("space00000/t/*", &["space00000/t/inner.txt".into()]).await), "validation_error");
    assert_eq!(key(ops.validate_transfer("space00000/t/sub/*", &["space00000/t/*".into()]).await), "validation_error");
    assert!(ops.validate_transfer("space00000/t/sub/*", &["space00000/t/inner.txt".into()]).await.is_ok());
    assert!(ops.validate_transfer("space00000/t/*", &["space00000/other.txt".into()]).await.is_ok());
}

#[tokio::test]
async fn copy_keeps_sources_and_picks_free_names() {
    let f = fixture();
    f.put("space00000/report.final.csv", b"1").await;
    f.put("space00000/docs/a.txt", b"a").await;
    f.put("space00000/t/report.final.csv", b"old").await;
    f.put("space00000/t/docs/keep.txt", b"k").await;

    let t = f.run(cp("space00000/t/*", &["space00000/report.final.csv", "space00000/docs"])).await;
    assert_eq!(t.status, TaskStatus::Done, "{:?}", t.error_message);
    assert_eq!(t.verbose_result.as_deref(), Some("copied 2 items"));
    assert_eq!(f.storage.open("space00000/t/report_copy(1).final.csv").await.unwrap(), b"1");
    assert_eq!(f.storage.open("space00000/t/report.final.csv").await.unwrap(), b"old");
    assert_eq!(f.storage.open("space00000/t/docs_copy(1)/a.txt").await.unwrap(), b"a");
    assert!(f.storage.exists("space00000/report.final.csv").await.unwrap());

    let again = f.run(cp("space00000/t/*", &["space00000/report.final.csv"])).await;
    assert_eq!(again.status, TaskStatus::Done);
    assert!(f.storage.exists("space00000/t/report_copy(2).final.csv").await.unwrap());
}

#[tokio::test]
async fn rename_file_keeps_groups_and_refuses_existing_names() {
    let f = fixture();
    f.put("space00000/a.txt", b"A").await;
    f.put("space00000/b.txt", b"B").await;
    f.groups.create_group(GroupSpec { user_code: "finance".into(), ..GroupSpec::default() }).unwrap();
    let node = f.index.upsert_file("space00000/a.txt", 1).unwrap();
    f.groups.add_object("finance", &node).unwrap();

    let clash = f.run(TaskOptions::Rename { path: "space00000/a.txt".into(), new_name: "b.txt".into() }).await;
    assert_eq!(clash.status, TaskStatus::Error);
    assert!(clash.error_message.unwrap().contains("already exists"));

    let t = f.run(TaskOptions::Rename { path: "space00000/a.txt".into(), new_name: "c.txt".into() }).await;
    assert_eq!(t.verbose_result.as_deref(), Some("renamed file"));
    assert_eq!(f.storage.open("space00000/c.txt").await.unwrap(), b"A");
    let renamed = f.index.get_by_path("space00000/c.txt").unwrap().unwrap();
    assert_eq!(renamed.resource_groups, vec!["finance".to_string()]);
    assert_eq!(f.groups.object_ids("finance", crate::groups::STORAGE_OBJECT), vec![renamed.id]);
    assert!(f.index.get_by_path("space00000/a.txt").unwrap().is_none());
}

#[tokio::test]
async fn rename_directory_moves_children() {
    let f = fixture();
    f.put("space00000/old/x.txt", b"x").await;
    f.put("space00000/old/sub/y.txt", b"yy").await;
    f.index.upsert_file("space00000/old/x.txt", 1).unwrap();
    let t = f.run(TaskOptions::Rename { path: "space00000/old/*".into(), new_name: "new".into() }).await;
    assert_eq!(t.status, TaskStatus::Done, "{:?}", t.error_message);
    assert_eq!(t.verbose_result.as_deref(), Some("renamed directory"));
    assert_eq!(t.progress.current, 2);
    assert!(f.storage.walk_files("space00000/old/").await.unwrap().is_empty());
    assert_eq!(f.storage.open("space00000/new/sub/y.txt").await.unwrap(), b"yy");
    assert!(f.index.get_by_path("space00000/old/*").unwrap().is_none());
    assert!(f.index.get_by_path("space00000/new/x.txt").unwrap().is_some());
}

#[tokio::test]
async fn unzip_skips_system_entries() {
    let f = fixture();
    let zip = archive::zip_entries(&[("a.txt", b"alpha"), ("__MACOSX/.DS_Store", b"junk"), ("._a.txt", b"rsrc")]).unwrap();
    f.put("space00000/in.zip", &zip).await;
    f.put("space00000/target/", b"").await;
    f.clear_calls();

    let t = f
        .run(TaskOptions::Unzip { file_path: "space00000/in.zip".into(), target_directory_path: "space00000/target/*".into() })
        .await;
    assert_eq!(t.status, TaskStatus::Done, "{:?}", t.error_message);
    assert_eq!(t.verbose_result.as_deref(), Some("unzip space00000/in.zip to space00000/target/"));
    assert_eq!(f.saved(), vec!["space00000/target/a.txt".to_string()]);
    assert_eq!(f.storage.open("space00000/target/a.txt").await.unwrap(), b"alpha");
    assert_eq!((t.progress.current, t.progress.total), (1, 1));
}

#[tokio::test]
async fn unzip_requires_a_zip_and_an_existing_target() {
    let f = fixture();
    f.put("space00000/in.tar", b"x").await;
    let t = f
        .run(TaskOptions::Unzip { file_path: "space00000/in.tar".into(), target_directory_path: "space00000/t/*".into() })
        .await;
    assert_eq!(t.status, TaskStatus::Error);
    assert!(t.error_message.unwrap().contains(".zip"));
}

#[tokio::test]
async fn sync_task_rebuilds_file_nodes() {
    let f = fixture();
    f.put("space00000/a.txt", b"a").await;
    f.put("space00000/d/b.txt", b"b").await;
    f.index.upsert_file("space00000/stale.txt", 9).unwrap();
    let t = f.run(TaskOptions::Sync { space_code: SPACE.into() }).await;
    assert_eq!(t.status, TaskStatus::Done, "{:?}", t.error_message);
    assert_eq!(t.verbose_result.as_deref(), Some("synced 2 files"));
    assert_eq!(t.progress.description, "sync_storage_with_database finished");
    assert!(f.index.get_by_path("space00000/stale.txt").unwrap().is_none());
    assert!(f.index.get_by_path("space00000/d/b.txt").unwrap().is_some());
}

#[tokio::test]
async fn bulk_delete_soft_hard_and_protected() {
    let f = fixture();
    let soft = f.records.insert("portfolio", RecordSpec { user_code: "p1".into(), is_deleted: Some(false), ..RecordSpec::default() }).unwrap();
    let hard = f.records.insert("portfolio", RecordSpec { user_code: "p2".into(), ..RecordSpec::default() }).unwrap();
    let dash = f.records.insert("portfolio", RecordSpec { user_code: "-".into(), ..RecordSpec::default() }).unwrap();

    let refused = f.run(TaskOptions::BulkDelete { content_type: "portfolio".into(), ids: vec![hard.id, dash.id] }).await;
    assert_eq!(refused.status, TaskStatus::Error);
    assert!(f.records.get("portfolio", hard.id).unwrap().is_some());

    let t = f.run(TaskOptions::BulkDelete { content_type: "portfolio".into(), ids: vec![soft.id, hard.id] }).await;
    assert_eq!(t.status, TaskStatus::Done, "{:?}", t.error_message);
    assert_eq!(t.result, Some(serde_json::json!({"soft_deleted": 1, "deleted": 1})));
    assert_eq!(f.records.require("portfolio", soft.id).unwrap().is_deleted, Some(true));
    assert!(f.records.get("portfolio", hard.id).unwrap().is_none());
}

#[tokio::test]
async fn canceled_task_copies_nothing() {
    let f = fixture();
    f.put("space00000/t/", b"").await;
    f.put("space00000/a.txt", b"a").await;
    let tmp = tempfile::tempdir().unwrap();
    let store = TaskStore::open(&SharedStore::new(tmp.path()).unwrap(), SPACE);
    let task = store.create(mv("space00000/t/*", &["space00000/a.txt"]), "alice", None).unwrap();
    store.cancel(task.id).unwrap();
    f.clear_calls();

    let ops = Operations::new(f.storage.clone(), f.index.clone(), f.groups.clone(), f.records.clone());
    let handle = TaskHandle::new(task.id, store.clone());
    let err = ops.execute(&task, &handle).await.unwrap_err();
    assert_eq!(err.error_key(), "task_invalid_state");
    assert!(f.saved().is_empty());
    assert!(f.storage.exists("space00000/a.txt").await.unwrap());
}
