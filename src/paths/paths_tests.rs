use super::*;

#[test]
fn normalize_directories_and_files() {
    assert_eq!(normalize("/space00000/test/").unwrap(), "space00000/test/*");
    assert_eq!(normalize("space00000//test/*").unwrap(), "space00000/test/*");
    assert_eq!(normalize("space00000/./a.txt").unwrap(), "space00000/a.txt");
    assert_eq!(normalize("/*").unwrap(), ROOT);
    assert_eq!(normalize("/").unwrap(), ROOT);
    assert!(normalize("").is_err());
    assert!(normalize("a/../b").is_err());
    let with_nul = "a\u{0000}b".to_string();
    assert!(normalize(&with_nul).is_err());
}

#[test]
fn normalize_is_nfc() {
    let s = "space00000/Cafe\u{0301}.txt";
    assert_eq!(normalize(s).unwrap(), "space00000/Caf\u{e9}.txt");
}

#[test]
fn length_boundary() {
    let ok = format!("s/{}", "a".repeat(MAX_PATH_LEN - 2));
    assert_eq!(ok.chars().count(), 2048);
    assert!(normalize(&ok).is_ok());
    assert!(validate_wire_path(&ok).is_ok());

    let too_long = format!("s/{}", "a".repeat(MAX_PATH_LEN - 1));
    let err = normalize(&too_long).unwrap_err();
    assert_eq!(err.error_key(), "invalid_path");
    assert_eq!(validate_wire_path(&too_long).unwrap_err().error_key(), "invalid_path");
}

#[test]
fn wire_validation() {
    assert!(validate_wire_path("test/file name.txt").is_ok());
    assert!(validate_wire_path("/").is_err());
    for bad in ["a:b", "a*b", "a?b", "a\"b", "a<b", "a>b", "a|b", "a;b", "a&b"] {
        assert!(validate_wire_path(bad).is_err(), "{bad} should be rejected");
    }
    assert!(validate_wire_path("a/../b").is_err());
    assert!(reject_system_path(".system/super").is_err());
    assert!(reject_system_path("space00000/.system/x").is_err());
    assert!(reject_system_path("space00000/.systemd/x").is_ok());
}

#[test]
fn join_paths() {
    assert_eq!(join("space00000", "test/test/"), "space00000/test/test/");
    assert_eq!(join("space00000/", "/a.txt"), "space00000/a.txt");
    assert_eq!(join("space00000", ""), "space00000/");
    assert_eq!(join("space00000", "a//b/*"), "space00000/a/b/*");
    assert!(!join("space00000", "a/b").ends_with('/'));
}

#[test]
fn parents_and_ancestors() {
    assert_eq!(parent_of("space00000/a/b.txt").as_deref(), Some("space00000/a/*"));
    assert_eq!(parent_of("space00000/a/*").as_deref(), Some("space00000/*"));
    assert_eq!(parent_of("space00000/*"), None);
    assert_eq!(parent_of(ROOT), None);
    assert_eq!(
        ancestor_paths("root/a/b/x.pdf"),
        vec!["root/*".to_string(), "root/a/*".to_string(), "root/a/b/*".to_string()]
    );
    assert!(ancestor_paths("root/*").is_empty());
}

#[test]
fn names_and_extensions() {
    assert_eq!(basename("space00000/a/b.TXT"), "b.TXT");
    assert_eq!(basename("space00000/a/*"), "a");
    assert_eq!(extension("b.TXT").as_deref(), Some("txt"));
    assert_eq!(extension(".init"), None);
    assert_eq!(extension("archive.tar.gz").as_deref(), Some("gz"));
    assert_eq!(last_dir_name("space00000/a/b/"), "b/");
    assert_eq!(depth_of("space00000/*"), 0);
    assert_eq!(depth_of("space00000/a/b.txt"), 2);
}

#[test]
fn directory_prefixes() {
    assert!(is_dir("a/b/*"));
    assert!(!is_dir("a/b"));
    assert!(starts_with_dir("a/b/c.txt", "a/b/*"));
    assert!(starts_with_dir("a/b/*", "a/b/*"));
    assert!(!starts_with_dir("a/bc/d.txt", "a/b/*"));
    assert!(starts_with_dir("anything", ROOT));
    assert_eq!(to_storage_key("a/b/*"), "a/b/");
    assert_eq!(from_storage_key("a/b/"), "a/b/*");
    assert_eq!(to_dir_path("a/b/"), "a/b/*");
    assert_eq!(to_dir_path(""), ROOT);
}

#[test]
fn mime_types() {
    assert_eq!(mime_of("report.PDF"), Some("application/pdf"));
    assert_eq!(mime_of("a.txt"), Some("plain/text"));
    assert_eq!(mime_of("a.yml"), mime_of("a.yaml"));
    assert_eq!(mime_of("a.bin"), None);
    assert_eq!(mime_of("noext"), None);
}

#[test]
fn truthy_and_system_names() {
    for t in ["true", "TRUE", "1", "Yes"] { assert!(is_true_value(t)); }
    for f in ["false", "0", "on", ""] { assert!(!is_true_value(f)); }
    assert!(is_system_name(".init"));
    assert!(!is_system_name("init"));
    assert!(is_hidden_name(".hello-world"));
}

#[test]
fn sizes() {
    assert_eq!(pretty_size(0), "0B");
    assert_eq!(pretty_size(11), "11.0 B");
    assert_eq!(pretty_size(1536), "1.5 KB");
    assert_eq!(pretty_size(1024 * 1024), "1.0 MB");
}
