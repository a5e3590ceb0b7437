//! Zip packing and unpacking. Both sides are blocking and run on the blocking pool.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{DriverError, DriverResult};

/// One member of an archive, with its name as stored (always `/`-separated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub is_dir: bool,
    pub data: Vec<u8>,
}

/// Zip every file below `root`; archive names are relative to `root`.
pub fn zip_tree(root: &Path) -> DriverResult<Vec<u8>> {
    let mut zw = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for ent in WalkDir::new(root).sort_by_file_name() {
        let ent = ent.map_err(|e| DriverError::Zip(e.to_string()))?;
        let Ok(rel) = ent.path().strip_prefix(root) else { continue };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect::<Vec<_>>().join("/");
        if ent.file_type().is_dir() {
            zw.add_directory(format!("{}/", name), opts)?;
        } else if ent.file_type().is_file() {
            let bytes = std::fs::read(ent.path()).map_err(|e| DriverError::io(&name, e))?;
            zw.start_file(name.clone(), opts)?;
            zw.write_all(&bytes).map_err(|e| DriverError::io(&name, e))?;
        }
    }
    Ok(zw.finish()?.into_inner())
}

/// Read every member. Entries whose names escape the archive root are rejected.
pub fn entries(bytes: &[u8]) -> DriverResult<Vec<ArchiveEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut out = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let raw = file.name().to_string();
        if file.enclosed_name().is_none() {
            return Err(DriverError::Zip(format!("unsafe entry name '{}'", raw)));
        }
        let is_dir = file.is_dir();
        let mut data = Vec::new();
        if !is_dir {
            file.read_to_end(&mut data).map_err(|e| DriverError::io(&raw, e))?;
        }
        out.push(ArchiveEntry { name: raw.replace('\\', "/"), is_dir, data });
    }
    Ok(out)
}

/// Build an archive from in-memory `(name, bytes)` pairs.
pub fn zip_entries(files: &[(&str, &[u8])]) -> DriverResult<Vec<u8>> {
    let mut zw = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in files {
        if name.ends_with('/') {
            zw.add_directory(name.to_string(), opts)?;
        } else {
            zw.start_file(name.to_string(), opts)?;
            zw.write_all(bytes).map_err(|e| DriverError::io(name, e))?;
        }
    }
    Ok(zw.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_is_zipped_with_relative_names() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs/sub")).unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(tmp.path().join("docs/sub/b.txt"), b"beta").unwrap();

        let bytes = zip_tree(tmp.path()).unwrap();
        let got = entries(&bytes).unwrap();
        let names: Vec<&str> = got.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "docs/", "docs/sub/", "docs/sub/b.txt"]);
        let b = got.iter().find(|e| e.name == "docs/sub/b.txt").unwrap();
        assert_eq!(b.data, b"beta");
        assert!(got.iter().find(|e| e.name == "docs/").unwrap().is_dir);
    }

    #[test]
    fn in_memory_archive_reads_back() {
        let bytes = zip_entries(&[("x/", &b""[..]), ("x/y.csv", &b"1,2"[..])]).unwrap();
        let got = entries(&bytes).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[0].is_dir);
        assert_eq!(got[1].data, b"1,2");
    }

    #[test]
    fn garbage_is_zip_error() {
        assert!(matches!(entries(b"not a zip"), Err(DriverError::Zip(_))));
    }
}
