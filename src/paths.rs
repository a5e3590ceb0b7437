//! Path utilities shared by the index, the gate and the explorer boundary.
//!
//! Two spellings of the same location exist:
//! - index paths: directories end with `DIR_SUFFIX` (`space00000/a/*`), files do not;
//! - storage keys: directories end with a bare `/` (`space00000/a/`).
//! Conversions between them live here so no other module slices suffixes by hand.

use crate::error::{AppError, AppResult};
use unicode_normalization::UnicodeNormalization;

/// Suffix that marks a directory in the path index.
pub const DIR_SUFFIX: &str = "/*";
/// The root of the whole index.
pub const ROOT: &str = "/*";
pub const MAX_PATH_LEN: usize = 2048;

/// Names created by the system itself; hidden from listings.
pub const SYSTEM_NAMES: [&str; 3] = [".hello-world", ".system", ".init"];

/// Directory marker written by `create_folder`.
pub const INIT_MARKER: &str = ".init";

const FORBIDDEN_CHARS: [char; 9] = [':', '*', '?', '"', '<', '>', '|', ';', '&'];
const TRUTHY_VALUES: [&str; 3] = ["true", "1", "yes"];

/// Normalize a UTF-8 string to NFC.
pub fn normalize_nfc(input: &str) -> String {
    input.nfc().collect::<String>()
}

fn check_length(path: &str) -> AppResult<()> {
    let n = path.chars().count();
    if n > MAX_PATH_LEN {
        return Err(AppError::invalid_path(
            "path_too_long".to_string(),
            format!("path is {} characters long, at most {} allowed", n, MAX_PATH_LEN),
        ));
    }
    Ok(())
}

/// Canonical index form of `p`.
///
/// Strips leading slashes, collapses `//`, drops `.` segments and rejects `..` and NUL.
/// A trailing `/` or `/*` marks a directory and yields exactly one `DIR_SUFFIX`.
/// An empty directory path is the root.
pub fn normalize(p: &str) -> AppResult<String> {
    check_length(p)?;
    if p.contains('\u{0000}') {
        return Err(AppError::invalid_path("nul_in_path", "path cannot contain NUL characters"));
    }
    let p = normalize_nfc(p);
    let is_dir = p.ends_with(DIR_SUFFIX) || p.ends_with('/') || p == "*";
    let body = p.strip_suffix(DIR_SUFFIX).unwrap_or(&p);
    let body = if body == "*" { "" } else { body };

    let mut segments: Vec<&str> = Vec::new();
    for seg in body.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(AppError::invalid_path(
                    "parent_segment".to_string(),
                    format!("'..' is not allowed in path '{}'", p),
                ))
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        if is_dir {
            return Ok(ROOT.to_string());
        }
        return Err(AppError::invalid_path("empty_path", "path cannot be empty"));
    }
    let joined = segments.join("/");
    Ok(if is_dir { format!("{}{}", joined, DIR_SUFFIX) } else { joined })
}

/// Boundary validation for a path received from a client (relative to the space).
/// Rejects over-long paths, forbidden characters, `..` and the bare root `/`.
pub fn validate_wire_path(p: &str) -> AppResult<()> {
    check_length(p)?;
    if p.trim() == "/" {
        return Err(AppError::invalid_path("root_path", "'/' is not a valid path"));
    }
    if let Some(c) = p.chars().find(|c| FORBIDDEN_CHARS.contains(c) || *c == '\u{0000}') {
        return Err(AppError::invalid_path(
            "forbidden_character".to_string(),
            format!("path '{}' contains forbidden character '{}'", p, c),
        ));
    }
    if p.split('/').any(|s| s == "..") {
        return Err(AppError::invalid_path(
            "parent_segment".to_string(),
            format!("'..' is not allowed in path '{}'", p),
        ));
    }
    Ok(())
}

/// Rejects paths touching the `.system` subtree.
pub fn reject_system_path(p: &str) -> AppResult<()> {
    if split_segments(p).iter().any(|s| *s == ".system") {
        return Err(AppError::invalid_path(
            "system_path".to_string(),
            format!("path '{}' is inside the .system area", p),
        ));
    }
    Ok(())
}

/// Join a space code and a space-relative path with exactly one separator.
/// A trailing `/` or `/*` on `sub` is preserved; an empty `sub` yields the space directory.
pub fn join(space: &str, sub: &str) -> String {
    let left = space.trim_end_matches('/');
    let right = sub.trim_start_matches('/');
    if right.is_empty() {
        return format!("{}/", left);
    }
    let mut out = String::with_capacity(left.len() + right.len() + 1);
    out.push_str(left);
    out.push('/');
    let mut prev_slash = true;
    for c in right.chars() {
        if c == '/' && prev_slash {
            continue;
        }
        prev_slash = c == '/';
        out.push(c);
    }
    out
}

pub fn is_dir(p: &str) -> bool {
    p.ends_with(DIR_SUFFIX)
}

/// Segments of a path with any directory marker removed.
pub fn split_segments(p: &str) -> Vec<&str> {
    let body = p.strip_suffix(DIR_SUFFIX).unwrap_or(p);
    body.split('/').filter(|s| !s.is_empty() && *s != "*").collect()
}

/// Parent directory (index form) of an index path. Top-level entries have no parent.
pub fn parent_of(p: &str) -> Option<String> {
    if p == ROOT {
        return None;
    }
    let body = p.strip_suffix(DIR_SUFFIX).unwrap_or(p).trim_end_matches('/');
    let (head, _) = body.rsplit_once('/')?;
    if head.is_empty() {
        return None;
    }
    Some(format!("{}{}", head, DIR_SUFFIX))
}

/// All strict ancestors of an index path, root-first.
pub fn ancestor_paths(p: &str) -> Vec<String> {
    let segs = split_segments(p);
    let n = segs.len().saturating_sub(1);
    (1..=n).map(|i| format!("{}{}", segs[..i].join("/"), DIR_SUFFIX)).collect()
}

pub fn basename(p: &str) -> &str {
    split_segments(p).last().copied().unwrap_or("")
}

/// Lower-cased extension of the last segment, without the dot. Leading dots do not count.
pub fn extension(p: &str) -> Option<String> {
    let name = basename(p);
    let stem_start = name.len() - name.trim_start_matches('.').len();
    let rest = &name[stem_start..];
    let (_, ext) = rest.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

/// True when `p` is `d` itself or lies below directory `d` (both index form).
pub fn starts_with_dir(p: &str, d: &str) -> bool {
    if d == ROOT {
        return true;
    }
    if p == d {
        return true;
    }
    p.starts_with(&dir_prefix(d))
}

/// `a/b/*` and `a/b` become `a/b/`.
pub fn dir_prefix(d: &str) -> String {
    if d == ROOT {
        return String::new();
    }
    let body = d.strip_suffix(DIR_SUFFIX).unwrap_or(d).trim_end_matches('/');
    format!("{}/", body)
}

/// `a/b`, `a/b/` and `a/b/*` all become `a/b/*`.
pub fn to_dir_path(p: &str) -> String {
    let body = p.strip_suffix(DIR_SUFFIX).unwrap_or(p).trim_end_matches('/');
    if body.is_empty() {
        return ROOT.to_string();
    }
    format!("{}{}", body, DIR_SUFFIX)
}

/// Index path to storage key: directories keep a bare trailing `/`.
pub fn to_storage_key(p: &str) -> String {
    if is_dir(p) { dir_prefix(p) } else { p.to_string() }
}

/// Storage key to index path.
pub fn from_storage_key(key: &str) -> String {
    if key.ends_with('/') { to_dir_path(key) } else { key.to_string() }
}

/// Depth of an index path: `a/*` is 0, `a/b.txt` and `a/b/*` are 1.
pub fn depth_of(p: &str) -> usize {
    split_segments(p).len().saturating_sub(1)
}

/// Last directory name with a trailing slash, `a/b/` gives `b/`.
pub fn last_dir_name(p: &str) -> String {
    let name = basename(p);
    if name.is_empty() { String::new() } else { format!("{}/", name) }
}

pub fn mime_of(filename: &str) -> Option<&'static str> {
    let ext = extension(filename)?;
    let mime = match ext.as_str() {
        "html" => "text/html",
        "txt" => "plain/text",
        "js" => "text/javascript",
        "csv" => "text/csv",
        "json" => "application/json",
        "yml" | "yaml" => "application/yaml",
        "py" => "text/x-python",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        "doc" | "docx" => "application/msword",
        "css" => "text/css",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => return None,
    };
    Some(mime)
}

pub fn is_true_value(v: &str) -> bool {
    let v = v.trim().to_lowercase();
    TRUTHY_VALUES.contains(&v.as_str())
}

/// Names starting with a dot are system entries.
pub fn is_system_name(name: &str) -> bool {
    name.starts_with('.')
}

pub fn is_hidden_name(name: &str) -> bool {
    SYSTEM_NAMES.contains(&name)
}

/// Human readable size: `0B`, `11.0 B`, `1.5 KB`.
pub fn pretty_size(bytes: u64) -> String {
    const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    if bytes == 0 {
        return "0B".to_string();
    }
    let mut i = 0usize;
    let mut v = bytes as f64;
    while v >= 1024.0 && i < UNITS.len() - 1 {
        v /= 1024.0;
        i += 1;
    }
    let rounded = (v * 100.0).round() / 100.0;
    let mut s = format!("{:.2}", rounded);
    while s.ends_with('0') && !s.ends_with(".0") {
        s.pop();
    }
    format!("{} {}", s, UNITS[i])
}

#[cfg(test)]
mod paths_tests;
