use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;
use crate::groups::GroupSpec;
use crate::iam::{Member, MemberSpec, PolicySpec};
use crate::identity::Principal;
use crate::records::RecordStore;
use crate::storage::SharedStore;
use crate::tasks::{TaskStatus, TaskStore};

const SPACE: &str = "space00000";
const ROOT_DIR: &str = "space00000/*";

struct Fixture {
    _tmp: tempfile::TempDir,
    explorer: Explorer,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let store = SharedStore::new(tmp.path()).unwrap();
    let storage = Storage::memory(None);
    let index = PathIndex::open(&store, SPACE);
    let groups = ResourceGroups::open(&store, SPACE, index.clone());
    let records = RecordStore::open(&store, SPACE);
    let iam = Iam::open(&store, SPACE, "local.poms.space00000", "finmars");
    let gate = AccessGate::new(index.clone(), iam.clone());
    let ops = Operations::new(storage, index.clone(), groups, records);
    let runner = TaskRunner::start(TaskStore::open(&store, SPACE), Arc::new(ops.clone()), 2);
    index.upsert_directory(ROOT_DIR).unwrap();
    for name in ["alice", "bob"] {
        iam.directory().ensure_member(name).unwrap();
    }
    iam.directory().upsert_member(MemberSpec { username: "root".into(), is_admin: true, ..MemberSpec::default() }).unwrap();
    let explorer = Explorer::new(SPACE, ops, gate, iam, runner);
    Fixture { _tmp: tmp, explorer }
}

impl Fixture {
    fn ctx(&self, username: &str) -> RequestContext {
        let member = self.explorer.iam().directory().get_member(username).unwrap().unwrap_or_else(Member::anonymous);
        RequestContext::new(Principal { username: username.into(), ..Principal::default() }, member, SPACE)
    }

    fn grant(&self, path: &str, access: AccessLevel, username: &str) {
        self.explorer.gate().grant(path, access, username).unwrap();
    }

    async fn put(&self, key: &str, bytes: &[u8]) {
        self.explorer.storage().save(key, bytes).await.unwrap();
    }

    fn memory(&self) -> &crate::driver::memory::MemoryBackend {
        self.explorer.storage().memory_backend().unwrap()
    }
}

#[tokio::test]
async fn create_folder_saves_one_marker_and_is_idempotent() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Write, "alice");
    let ctx = f.ctx("alice");
    f.memory().clear_calls();

    let res = f.explorer.create_folder(&ctx, "test/test").await.unwrap();
    assert_eq!(res.path, "space00000/test/test/");
    assert_eq!(f.memory().saved_keys(), vec!["space00000/test/test/.init".to_string()]);

    f.explorer.create_folder(&ctx, "test/test").await.unwrap();
    let dirs: Vec<_> = f.explorer.index().list_nodes("space00000/test/test/").into_iter().filter(|n| n.is_dir()).collect();
    assert_eq!(dirs.len(), 1);
    assert!(ctx.enforcements().iter().all(|e| e.allowed));
}

#[tokio::test]
async fn create_folder_without_policy_is_denied_before_any_io() {
    let f = fixture();
    let ctx = f.ctx("bob");
    f.memory().clear_calls();
    let err = f.explorer.create_folder(&ctx, "test/test").await.unwrap_err();
    assert_eq!(err.http_status(), 403);
    assert!(f.memory().calls().is_empty());
    assert_eq!(ctx.enforcements().len(), 1);
    assert!(!ctx.enforcements()[0].allowed);
}

#[tokio::test]
async fn delete_rejects_system_and_root_paths() {
    let f = fixture();
    let ctx = f.ctx("root");
    for bad in [".system/super", "/", "a/.system/b"] {
        let err = f.explorer.delete(&ctx, bad, false).await.unwrap_err();
        assert_eq!(err.error_key(), "invalid_path", "{}", bad);
    }
}

#[tokio::test]
async fn delete_directory_removes_objects_and_nodes() {
    let f = fixture();
    let ctx = f.ctx("root");
    f.explorer.create_folder(&ctx, "old").await.unwrap();
    f.explorer.upload(&ctx, "old", vec![Upload { name: "a.txt".into(), bytes: b"a".to_vec() }]).await.unwrap();
    f.explorer.delete(&ctx, "old", true).await.unwrap();
    assert!(f.memory().object_keys().iter().all(|k| !k.starts_with("space00000/old/")));
    assert!(f.explorer.index().list_nodes("space00000/old/").is_empty());
    assert!(f.explorer.index().get_by_path("space00000/old/*").unwrap().is_none());
}

#[tokio::test]
async fn move_target_with_leading_slash_is_invalid() {
    let f = fixture();
    let ctx = f.ctx("root");
    let err = f.explorer.move_items(&ctx, "/test", &["file.txt".to_string()]).await.unwrap_err();
    assert_eq!(err.error_key(), "invalid_path");
    assert_eq!(err.http_status(), 400);
}

#[tokio::test]
async fn move_runs_as_a_task() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Write, "alice");
    f.put("space00000/test/", b"").await;
    f.put("space00000/file.txt", b"hello world").await;
    let ctx = f.ctx("alice");
    let accepted = f.explorer.move_items(&ctx, "test", &["file.txt".to_string()]).await.unwrap();
    assert_eq!(accepted.status, "ok");
    let task = f.explorer.runner().wait_terminal(accepted.task_id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.verbose_result.as_deref(), Some("moved 1 items"));
    assert_eq!(task.member, "alice");
    assert!(f.explorer.storage().exists("space00000/test/file.txt").await.unwrap());
}

#[tokio::test]
async fn move_into_itself_fails_synchronously() {
    let f = fixture();
    let ctx = f.ctx("root");
    f.put("space00000/a/b/", b"").await;
    let err = f.explorer.move_items(&ctx, "a/b", &["a".to_string()]).await.unwrap_err();
    assert_eq!(err.error_key(), "validation_error");
}

#[tokio::test]
async fn uploaded_bytes_view_back() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Write, "alice");
    f.grant(ROOT_DIR, AccessLevel::Read, "alice");
    let ctx = f.ctx("alice");
    let res = f.explorer.upload(&ctx, "docs", vec![Upload { name: "a b.txt".into(), bytes: b"payload".to_vec() }]).await.unwrap();
    assert!(res.is_ok());
    assert_eq!(res.path, "space00000/docs");
    assert_eq!(res.files, vec!["space00000/docs/a b.txt".to_string()]);

    let body = f.explorer.view(&ctx, "docs/a b.txt").await.unwrap();
    assert_eq!(body.bytes, b"payload");
    assert_eq!(body.content_type, "plain/text");
    assert!(f.explorer.index().get_by_path("space00000/docs/a b.txt").unwrap().is_some());
}

#[tokio::test]
async fn read_grant_does_not_allow_writes() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Read, "alice");
    let ctx = f.ctx("alice");
    let err = f.explorer.upload(&ctx, "docs", vec![Upload { name: "x.txt".into(), bytes: vec![1] }]).await.unwrap_err();
    assert_eq!(err.error_key(), "permission_denied");
}

#[tokio::test]
async fn missing_path_is_404_for_writers_and_403_otherwise() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Write, "alice");
    f.grant(ROOT_DIR, AccessLevel::Read, "alice");
    assert_eq!(f.explorer.view(&f.ctx("alice"), "nope.txt").await.unwrap_err().http_status(), 404);
    assert_eq!(f.explorer.view(&f.ctx("bob"), "nope.txt").await.unwrap_err().http_status(), 403);
}

#[tokio::test]
async fn server_file_appends_html() {
    let f = fixture();
    let ctx = f.ctx("root");
    f.put("space00000/site/index.html", b"<p>hi</p>").await;
    let body = f.explorer.server_file(&ctx, "site/index").await.unwrap();
    assert_eq!(body.name, "index.html");
    assert_eq!(body.content_type, "text/html");
}

#[tokio::test]
async fn listing_hides_system_entries_and_other_homes() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Read, "alice");
    f.put("space00000/alice/x.txt", b"x").await;
    f.put("space00000/bob/y.txt", b"y").await;
    f.put("space00000/.system/z", b"z").await;
    f.put("space00000/shared/", b"").await;
    f.put("space00000/readme.txt", b"hello").await;

    let page = f.explorer.list(&f.ctx("alice"), "", PageRequest::new(None, None, 40)).await.unwrap();
    assert_eq!(page.count, 3);
    assert_eq!(page.results[0], ListEntry::Dir { name: "alice".into() });
    assert_eq!(page.results[1], ListEntry::Dir { name: "shared".into() });
    match &page.results[2] {
        ListEntry::File(e) => {
            assert_eq!(e.name, "readme.txt");
            assert_eq!(e.file_path, "/readme.txt");
            assert_eq!(e.size, 5);
        }
        other => panic!("expected a file, got {:?}", other),
    }

    let shared = f.explorer.list(&f.ctx("alice"), "shared", PageRequest::new(None, None, 40)).await.unwrap();
    assert_eq!(shared.count, 0);
}

struct RecordingHook {
    seen: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl ImportHook for RecordingHook {
    async fn run_procedures(&self, _member: &Member, procedures: &[String], _files: &[String]) -> AppResult<()> {
        self.seen.lock().extend(procedures.iter().cloned());
        if self.fail {
            return Err(AppError::validation("procedure", "procedure: load_prices failed"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn uploads_into_import_run_procedures() {
    let f = fixture();
    let hook = Arc::new(RecordingHook { seen: Mutex::new(Vec::new()), fail: false });
    let explorer = f.explorer.clone().with_importer(hook.clone());
    f.put("space00000/import/.settings.json", br#"{"on_create":{"expression_procedure":["load_prices"]}}"#).await;
    let ctx = f.ctx("root");
    let res = explorer.upload(&ctx, "import", vec![Upload { name: "prices.csv".into(), bytes: b"a,b".to_vec() }]).await.unwrap();
    assert!(res.is_ok());
    assert_eq!(*hook.seen.lock(), vec!["load_prices".to_string()]);

    let failing = f.explorer.clone().with_importer(Arc::new(RecordingHook { seen: Mutex::new(Vec::new()), fail: true }));
    let res = failing.upload(&ctx, "import", vec![Upload { name: "prices.csv".into(), bytes: b"a,b".to_vec() }]).await.unwrap();
    assert_eq!(res.status, "error");
    assert_eq!(res.path, "space00000/import");
    assert!(res.details.unwrap().contains("load_prices"));
}

#[tokio::test]
async fn search_only_returns_readable_files() {
    let f = fixture();
    let idx = f.explorer.index();
    idx.upsert_file("space00000/a/report.csv", 10).unwrap();
    idx.upsert_file("space00000/b/report-2.csv", 20).unwrap();
    idx.upsert_file("space00000/a/notes.txt", 1).unwrap();
    f.grant("space00000/a/*", AccessLevel::Read, "alice");

    let page = f.explorer.search(&f.ctx("alice"), "REPORT", PageRequest::new(None, None, 40)).unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.results[0].file_path, "/a/report.csv");
    let all = f.explorer.search(&f.ctx("root"), "report", PageRequest::new(None, None, 40)).unwrap();
    assert_eq!(all.count, 2);
}

#[tokio::test]
async fn resource_groups_set_and_clear() {
    let f = fixture();
    let ctx = f.ctx("root");
    f.explorer.groups().create_group(GroupSpec { user_code: "finance".into(), ..GroupSpec::default() }).unwrap();
    f.explorer.index().upsert_file("space00000/q1.csv", 3).unwrap();

    let node = f.explorer.set_resource_group(&ctx, "q1.csv", &["finance".to_string()]).unwrap();
    assert_eq!(node.resource_groups, vec!["finance".to_string()]);
    let again = f.explorer.set_resource_group(&ctx, "q1.csv", &["finance".to_string()]).unwrap();
    assert_eq!(again.resource_groups.len(), 1);
    let cleared = f.explorer.set_resource_group(&ctx, "q1.csv", &[]).unwrap();
    assert!(cleared.resource_groups.is_empty());
    assert!(f.explorer.groups().object_ids("finance", crate::groups::STORAGE_OBJECT).is_empty());

    let err = f.explorer.set_resource_group(&ctx, "q1.csv", &["nope".to_string()]).unwrap_err();
    assert_eq!(err.error_key(), "validation_error");
}

#[tokio::test]
async fn storage_object_patch_only_touches_groups() {
    let f = fixture();
    let ctx = f.ctx("root");
    f.explorer.groups().create_group(GroupSpec { user_code: "finance".into(), ..GroupSpec::default() }).unwrap();
    let node = f.explorer.index().upsert_file("space00000/q1.csv", 3).unwrap();

    let err = f.explorer.patch_storage_object(&ctx, node.id, serde_json::json!({"path": "space00000/other.csv"})).unwrap_err();
    assert_eq!(err.error_key(), "validation_error");
    let patched = f.explorer.patch_storage_object(&ctx, node.id, serde_json::json!({"resource_groups": ["finance"]})).unwrap();
    assert_eq!(patched.path, "space00000/q1.csv");
    assert_eq!(patched.resource_groups, vec!["finance".to_string()]);
    assert_eq!(f.explorer.get_storage_object(&ctx, node.id).unwrap().resource_groups, vec!["finance".to_string()]);
}

#[tokio::test]
async fn storage_objects_are_filtered_by_statements() {
    let f = fixture();
    let idx = f.explorer.index();
    idx.upsert_file("space00000/public/readme.md", 1).unwrap();
    idx.upsert_file("space00000/private/salaries.csv", 1).unwrap();
    f.explorer
        .iam()
        .directory()
        .create_policy(PolicySpec {
            user_code: "public-objects".into(),
            policy: Some(
                serde_json::from_value(serde_json::json!({
                    "Statement": [{
                        "Effect": "Allow", "Principal": "*",
                        "Action": "finmars:storageobject:<safe_methods>",
                        "Resource": "frn:finmars:explorer:storageobject:space00000/public/*"
                    }]
                }))
                .unwrap(),
            ),
            members: vec!["alice".into()],
            ..PolicySpec::default()
        })
        .unwrap();

    let page = f.explorer.list_storage_objects(&f.ctx("alice"), None, PageRequest::new(None, None, 40)).unwrap();
    let paths: Vec<&str> = page.results.iter().map(|n| n.path.as_str()).collect();
    assert_eq!(paths, vec!["space00000/public/*", "space00000/public/readme.md"]);
    let hidden = idx.get_by_path("space00000/private/salaries.csv").unwrap().unwrap();
    assert_eq!(f.explorer.get_storage_object(&f.ctx("alice"), hidden.id).unwrap_err().error_key(), "policy_deny");
}

#[tokio::test]
async fn sharing_requires_write_and_a_known_member() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Write, "alice");
    f.explorer.index().upsert_file("space00000/a/x.pdf", 1).unwrap();

    let p = f.explorer.set_access_policy(&f.ctx("alice"), "a/x.pdf", "read", "bob").unwrap();
    assert!(p.members.contains(&"bob".to_string()));
    let node = f.explorer.index().get_by_path("space00000/a/x.pdf").unwrap().unwrap();
    assert!(f.explorer.gate().has_access(&f.explorer.iam().directory().get_member("bob").unwrap().unwrap(), &node, AccessLevel::Read).unwrap());

    assert_eq!(f.explorer.set_access_policy(&f.ctx("alice"), "a/x.pdf", "admin", "bob").unwrap_err().error_key(), "validation_error");
    assert_eq!(f.explorer.set_access_policy(&f.ctx("alice"), "a/x.pdf", "read", "ghost").unwrap_err().error_key(), "not_found");
    assert_eq!(f.explorer.set_access_policy(&f.ctx("bob"), "a/x.pdf", "write", "bob").unwrap_err().error_key(), "permission_denied");
}

#[tokio::test]
async fn download_as_zip_packs_files_and_directories() {
    let f = fixture();
    f.grant(ROOT_DIR, AccessLevel::Read, "alice");
    f.put("space00000/docs/a.txt", b"alpha").await;
    f.put("space00000/docs/sub/b.txt", b"beta").await;
    f.put("space00000/top.txt", b"top").await;

    let body = f.explorer.download_as_zip(&f.ctx("alice"), &["docs".to_string(), "top.txt".to_string()]).await.unwrap();
    assert_eq!(body.content_type, "application/zip");
    let entries = crate::driver::archive::entries(&body.bytes).unwrap();
    let data = |name: &str| entries.iter().find(|e| e.name == name).map(|e| e.data.clone());
    assert_eq!(data("docs/a.txt"), Some(b"alpha".to_vec()));
    assert_eq!(data("docs/sub/b.txt"), Some(b"beta".to_vec()));
    assert_eq!(data("top.txt"), Some(b"top".to_vec()));

    let single = f.explorer.download(&f.ctx("alice"), "top.txt").await.unwrap();
    assert_eq!(single.bytes, b"top");
    assert_eq!(f.explorer.download_as_zip(&f.ctx("bob"), &["docs".to_string()]).await.unwrap_err().http_status(), 403);
    assert_eq!(f.explorer.download_as_zip(&f.ctx("alice"), &[]).await.unwrap_err().error_key(), "validation_error");
}
