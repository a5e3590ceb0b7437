use super::*;
use crate::driver::memory::DriverOp;

fn local_storage(cipher: Option<Cipher>) -> (tempfile::TempDir, Storage) {
    let tmp = tempfile::tempdir().unwrap();
    let backend = local::LocalFsBackend::new(&tmp.path().to_string_lossy()).unwrap();
    (tmp, Storage::new(Backend::LocalFs(backend), cipher))
}

fn key() -> Cipher {
    Cipher::from_hex(&"ab".repeat(32)).unwrap()
}

#[tokio::test]
async fn directory_marker_saves_init_sentinel_once() {
    let st = Storage::memory(None);
    let written = st.save("space00000/test/test/", b"ignored").await.unwrap();
    assert_eq!(written, "space00000/test/test/.init");
    let mem = st.memory_backend().unwrap();
    assert_eq!(mem.saved_keys(), vec!["space00000/test/test/.init".to_string()]);
    assert_eq!(st.open("space00000/test/test/.init").await.unwrap(), b"");

    let written = st.save("space00000/other/*", b"").await.unwrap();
    assert_eq!(written, "space00000/other/.init");
}

#[tokio::test]
async fn encrypted_payloads_roundtrip_and_differ_at_rest() {
    let st = Storage::memory(Some(key()));
    st.save("space00000/a.txt", b"hello world").await.unwrap();
    let raw = st.open_skip_decrypt("space00000/a.txt").await.unwrap();
    assert_ne!(raw, b"hello world");
    assert_eq!(raw.len(), 12 + 11 + 16);
    assert_eq!(st.open("space00000/a.txt").await.unwrap(), b"hello world");
}

#[tokio::test]
async fn decrypting_plain_bytes_fails_with_encryption_error() {
    let st = Storage::memory(Some(key()));
    st.save_raw("space00000/plain.txt", b"not encrypted at all, long enough").await.unwrap();
    let err = st.open("space00000/plain.txt").await.unwrap_err();
    assert!(matches!(err, DriverError::Encryption(_)));
    let app: AppError = err.into();
    assert_eq!(app.error_key(), "encryption_error");
}

#[tokio::test]
async fn listdir_of_missing_or_empty_directory_is_empty() {
    let (_tmp, st) = local_storage(None);
    assert_eq!(st.listdir("space00000/nothing/").await.unwrap(), (vec![], vec![]));
    let mem = Storage::memory(None);
    assert_eq!(mem.listdir("space00000/nothing/*").await.unwrap(), (vec![], vec![]));
}

#[tokio::test]
async fn listdir_splits_dirs_and_files_sorted() {
    let (_tmp, local) = local_storage(None);
    for st in [Storage::memory(None), local] {
        st.save("space00000/b.txt", b"b").await.unwrap();
        st.save("space00000/a.txt", b"a").await.unwrap();
        st.save("space00000/docs/x.txt", b"x").await.unwrap();
        st.save("space00000/docs/deep/y.txt", b"y").await.unwrap();
        st.save("space00000/empty/", b"").await.unwrap();
        let (dirs, files) = st.listdir("space00000/").await.unwrap();
        assert_eq!(dirs, vec!["docs".to_string(), "empty".to_string()], "backend {}", st.backend_name());
        assert_eq!(files, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }
}

#[tokio::test]
async fn exists_and_size_follow_writes() {
    let (_tmp, st) = local_storage(None);
    assert!(!st.exists("space00000/f.bin").await.unwrap());
    st.save("space00000/f.bin", &[0u8; 42]).await.unwrap();
    assert!(st.exists("space00000/f.bin").await.unwrap());
    assert!(st.exists("space00000/").await.unwrap());
    assert!(!st.exists("space00000/f.bin/").await.unwrap());
    assert_eq!(st.size("space00000/f.bin").await.unwrap(), 42);
    assert!(st.size("space00000/none").await.unwrap_err().is_not_found());
    assert!(st.modified("space00000/f.bin").await.is_ok());
    assert!(st.created("space00000/f.bin").await.is_ok());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (_tmp, st) = local_storage(None);
    st.save("space00000/x.txt", b"x").await.unwrap();
    st.delete("space00000/x.txt").await.unwrap();
    st.delete("space00000/x.txt").await.unwrap();
    assert!(!st.exists("space00000/x.txt").await.unwrap());
}

#[tokio::test]
async fn delete_directory_removes_prefix_and_refuses_root() {
    let (_tmp, local) = local_storage(None);
    for st in [Storage::memory(None), local] {
        st.save("space00000/d/a.txt", b"a").await.unwrap();
        st.save("space00000/d/e/b.txt", b"b").await.unwrap();
        st.save("space00000/keep.txt", b"k").await.unwrap();
        assert_eq!(st.delete_directory("space00000/d/*").await.unwrap(), 2);
        assert!(!st.dir_exists("space00000/d/").await.unwrap());
        assert!(st.exists("space00000/keep.txt").await.unwrap());
        assert!(matches!(st.delete_directory("/*").await, Err(DriverError::Config(_))));
    }
}

#[tokio::test]
async fn walk_files_lists_everything_below() {
    let st = Storage::memory(None);
    st.save("space00000/d/a.txt", b"a").await.unwrap();
    st.save("space00000/d/e/b.txt", b"bb").await.unwrap();
    st.save("space00000/dd.txt", b"no").await.unwrap();
    let keys: Vec<String> = st.walk_files("space00000/d/").await.unwrap().into_iter().map(|m| m.key).collect();
    assert_eq!(keys, vec!["space00000/d/a.txt".to_string(), "space00000/d/e/b.txt".to_string()]);
}

#[tokio::test]
async fn directory_zip_contains_decrypted_relative_files() {
    let st = Storage::memory(Some(key()));
    st.save("space00000/d/a.txt", b"alpha").await.unwrap();
    st.save("space00000/d/sub/b.txt", b"beta").await.unwrap();
    let zip = st.download_directory_as_zip("space00000/d/").await.unwrap();
    let entries = archive::entries(&zip).unwrap();
    let a = entries.iter().find(|e| e.name == "a.txt").unwrap();
    assert_eq!(a.data, b"alpha");
    assert!(entries.iter().any(|e| e.name == "sub/b.txt" && e.data == b"beta"));
}

#[tokio::test]
async fn multi_path_zip_uses_basenames_and_dir_names() {
    let st = Storage::memory(None);
    st.save("space00000/one.txt", b"1").await.unwrap();
    st.save("space00000/folder/two.txt", b"2").await.unwrap();
    let zip = st
        .download_paths_as_zip(&["space00000/one.txt".to_string(), "space00000/folder/".to_string()])
        .await
        .unwrap();
    let names: Vec<String> = archive::entries(&zip).unwrap().into_iter().filter(|e| !e.is_dir).map(|e| e.name).collect();
    assert!(names.contains(&"one.txt".to_string()));
    assert!(names.contains(&"folder/two.txt".to_string()));
}

#[tokio::test]
async fn rotate_key_reencrypts_everything() {
    let st = Storage::memory(Some(key()));
    st.save("space00000/a.txt", b"one").await.unwrap();
    st.save("space00000/d/b.txt", b"two").await.unwrap();
    let fresh = Cipher::from_hex(&"cd".repeat(32)).unwrap();
    assert_eq!(st.rotate_key("space00000/", &fresh).await.unwrap(), 2);
    let raw = st.open_skip_decrypt("space00000/d/b.txt").await.unwrap();
    assert_eq!(fresh.decrypt(&raw).unwrap(), b"two");
    assert!(st.open("space00000/d/b.txt").await.is_err());
}

#[tokio::test]
async fn memory_journal_records_io() {
    let st = Storage::memory(None);
    st.save("space00000/a.txt", b"a").await.unwrap();
    st.open("space00000/a.txt").await.unwrap();
    st.delete("space00000/a.txt").await.unwrap();
    let ops: Vec<DriverOp> = st.memory_backend().unwrap().calls().into_iter().map(|c| c.op).collect();
    assert_eq!(ops, vec![DriverOp::Write, DriverOp::Read, DriverOp::Delete]);
}

#[test]
fn driver_errors_map_to_app_errors() {
    let e: AppError = DriverError::NotFound("k".into()).into();
    assert!(e.is_not_found());
    let e: AppError = DriverError::Transport { key: "k".into(), message: "refused".into(), transient: true }.into();
    assert!(e.is_transient());
    let e: AppError = DriverError::Http { key: "k".into(), status: 500, body: "boom".into() }.into();
    assert!(!e.is_transient());
    assert_eq!(e.error_key(), "driver_error");
}
