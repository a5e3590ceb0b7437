//! File explorer for one tenant space.
//!
//! Methods take client paths (relative to the space), validate them, gate them
//! against the calling member and record each decision on the request context.
//! Move, copy, rename, unzip and sync are validated here and handed to the task
//! runner; everything else completes inside the request.

pub mod listing;
pub mod import;
pub mod objects;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::driver::Storage;
use crate::error::{AppError, AppResult};
use crate::gate::{AccessGate, AccessLevel};
use crate::groups::ResourceGroups;
use crate::iam::Iam;
use crate::identity::RequestContext;
use crate::index::PathIndex;
use crate::ops::{rename::validate_new_name, Operations};
use crate::paths;
use crate::tasks::{TaskOptions, TaskRunner};

pub use import::{ImportHook, LoggingImportHook};
pub use listing::{FileEntry, ListEntry, PageRequest, Paged};

pub const DEFAULT_PAGE_SIZE: usize = 40;

/// File content plus what the HTTP layer needs to serve it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileBody {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// One uploaded file.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadResult {
    pub status: &'static str,
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl UploadResult {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PathResult {
    pub status: &'static str,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskAccepted {
    pub status: &'static str,
    pub task_id: u64,
}

/// Boundary check of a client path. `strip` trims surrounding slashes (list, upload,
/// create-folder, rename, copy); otherwise a leading slash is INVALID_PATH.
pub fn client_path(raw: &str, field: &str, strip: bool) -> AppResult<String> {
    let p = if strip {
        raw.trim().trim_matches('/')
    } else {
        paths::validate_wire_path(raw)?;
        if raw.starts_with('/') {
            return Err(AppError::invalid_path(
                "leading_slash".to_string(),
                format!("{}: '{}' must not start with '/'", field, raw),
            ));
        }
        raw.trim_end_matches('/')
    };
    paths::validate_wire_path(p)?;
    paths::reject_system_path(p)?;
    Ok(p.to_string())
}

fn non_empty(p: String, field: &str) -> AppResult<String> {
    if p.is_empty() {
        return Err(AppError::invalid_path("empty_path".to_string(), format!("{}: may not be blank", field)));
    }
    Ok(p)
}

#[derive(Clone)]
pub struct Explorer {
    space_code: String,
    storage: Storage,
    index: PathIndex,
    groups: ResourceGroups,
    gate: AccessGate,
    iam: Iam,
    ops: Operations,
    runner: TaskRunner,
    importer: Arc<dyn ImportHook>,
    page_size: usize,
}

impl Explorer {
    pub fn new(space_code: &str, ops: Operations, gate: AccessGate, iam: Iam, runner: TaskRunner) -> Self {
        Self {
            space_code: space_code.to_string(),
            storage: ops.storage().clone(),
            index: ops.index().clone(),
            groups: ops.groups().clone(),
            gate,
            iam,
            ops,
            runner,
            importer: Arc::new(LoggingImportHook),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_importer(mut self, importer: Arc<dyn ImportHook>) -> Self {
        self.importer = importer;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn space_code(&self) -> &str { &self.space_code }
    pub fn page_size(&self) -> usize { self.page_size }
    pub fn storage(&self) -> &Storage { &self.storage }
    pub fn index(&self) -> &PathIndex { &self.index }
    pub fn groups(&self) -> &ResourceGroups { &self.groups }
    pub fn gate(&self) -> &AccessGate { &self.gate }
    pub fn iam(&self) -> &Iam { &self.iam }
    pub fn runner(&self) -> &TaskRunner { &self.runner }

    fn full(&self, rel: &str) -> String {
        paths::join(&self.space_code, rel)
    }

    /// Storage key of a space directory, always ending in `/`.
    fn dir_key(&self, rel: &str) -> String {
        let full = self.full(rel);
        if full.ends_with('/') { full } else { format!("{}/", full) }
    }

    async fn stored(&self, full: &str) -> AppResult<bool> {
        let body = full.trim_end_matches('/');
        if !full.ends_with('/') && self.storage.exists(body).await? {
            return Ok(true);
        }
        Ok(self.storage.dir_exists(&format!("{}/", body)).await?)
    }

    async fn gate_existing(&self, ctx: &RequestContext, full: &str, access: AccessLevel) -> AppResult<()> {
        if self.index.resolve(full)?.is_some() {
            return self.gate.require(&ctx.member, full, access).map(|_| ());
        }
        // present in storage but not yet indexed: gate on the indexed ancestors
        if self.stored(full).await? {
            return self.gate.require_new(&ctx.member, full, access);
        }
        self.gate.require(&ctx.member, full, access).map(|_| ())
    }

    /// Gate an existing path and record the decision.
    async fn authorize_path(&self, ctx: &RequestContext, action: &str, full: &str, access: AccessLevel) -> AppResult<()> {
        let res = self.gate_existing(ctx, full, access).await;
        ctx.record(action, full, res.is_ok());
        res
    }

    /// Gate a path that may not exist yet; never touches the driver.
    fn authorize_new(&self, ctx: &RequestContext, action: &str, full: &str, access: AccessLevel) -> AppResult<()> {
        let res = self.gate.require_new(&ctx.member, full, access);
        ctx.record(action, full, res.is_ok());
        res
    }

    fn forget(&self, index_path: &str) -> AppResult<usize> {
        let removed = self.index.delete_by_path(index_path)?;
        let n = removed.len();
        self.groups.forget_nodes(&removed);
        Ok(n)
    }

    fn submit(&self, ctx: &RequestContext, options: TaskOptions) -> AppResult<TaskAccepted> {
        let kind = options.task_type();
        let task = self.runner.submit(options, &ctx.member.username)?;
        info!(target: "fileplane::explorer", request_id = %ctx.request_id, task_id = task.id, kind, "task submitted");
        Ok(TaskAccepted { status: "ok", task_id: task.id })
    }

    /// Immediate children of a directory, directories first. At the space root,
    /// directories named after other members are not shown.
    pub async fn list(&self, ctx: &RequestContext, path: &str, page: PageRequest) -> AppResult<Paged<ListEntry>> {
        let rel = client_path(path, "path", true)?;
        let dir_key = self.dir_key(&rel);
        self.authorize_path(ctx, "explorer:list", &dir_key, AccessLevel::Read).await?;

        let (dirs, files) = self.storage.listdir(&dir_key).await?;
        let foreign_homes: HashSet<String> = if rel.is_empty() {
            self.iam
                .directory()
                .list_members()
                .into_iter()
                .map(|m| m.username)
                .filter(|u| *u != ctx.member.username)
                .collect()
        } else {
            HashSet::new()
        };
        let mut rows: Vec<(bool, String)> = dirs
            .into_iter()
            .filter(|d| !paths::is_hidden_name(d) && !foreign_homes.contains(d))
            .map(|d| (true, d))
            .collect();
        rows.extend(files.into_iter().filter(|f| !paths::is_hidden_name(f)).map(|f| (false, f)));

        let page = listing::paginate(rows, page)?;
        let mut results = Vec::with_capacity(page.results.len());
        for (is_dir, name) in page.results.iter() {
            if *is_dir {
                results.push(ListEntry::Dir { name: name.clone() });
                continue;
            }
            let key = format!("{}{}", dir_key, name);
            let size = self.storage.size(&key).await?;
            let created = self.storage.created(&key).await?;
            let modified = self.storage.modified(&key).await?;
            results.push(ListEntry::File(FileEntry::new(&self.space_code, &key, size, created, modified)));
        }
        debug!(target: "fileplane::explorer", dir = %dir_key, count = page.count, "list");
        Ok(Paged { count: page.count, page: page.page, page_size: page.page_size, results })
    }

    pub async fn view(&self, ctx: &RequestContext, path: &str) -> AppResult<FileBody> {
        let rel = non_empty(client_path(path, "path", true)?, "path")?;
        let full = self.full(&rel);
        self.authorize_path(ctx, "explorer:view", &full, AccessLevel::Read).await?;
        let bytes = self.storage.open(&full).await?;
        let name = paths::basename(&full).to_string();
        let content_type = paths::mime_of(&name).unwrap_or("application/octet-stream").to_string();
        Ok(FileBody { name, content_type, bytes })
    }

    /// Like [`Explorer::view`]; a last segment without an extension gets `.html`.
    pub async fn server_file(&self, ctx: &RequestContext, path: &str) -> AppResult<FileBody> {
        let trimmed = path.trim_end_matches('/');
        if paths::basename(trimmed).contains('.') {
            self.view(ctx, trimmed).await
        } else {
            self.view(ctx, &format!("{}.html", trimmed)).await
        }
    }

    pub async fn download(&self, ctx: &RequestContext, path: &str) -> AppResult<FileBody> {
        let rel = non_empty(client_path(path, "path", true)?, "path")?;
        let full = self.full(&rel);
        self.authorize_path(ctx, "explorer:download", &full, AccessLevel::Read).await?;
        let bytes = self.storage.open(&full).await?;
        Ok(FileBody { name: paths::basename(&full).to_string(), content_type: "application/octet-stream".to_string(), bytes })
    }

    /// Zip of files and whole directories.
    pub async fn download_as_zip(&self, ctx: &RequestContext, items: &[String]) -> AppResult<FileBody> {
        if items.is_empty() {
            return Err(AppError::validation("paths", "paths: at least one path is required"));
        }
        let mut keys = Vec::with_capacity(items.len());
        for raw in items {
            let rel = non_empty(client_path(raw, "paths", true)?, "paths")?;
            let full = self.full(&rel);
            let key = if self.storage.exists(&full).await? { full } else { format!("{}/", full) };
            self.authorize_path(ctx, "explorer:download", &key, AccessLevel::Read).await?;
            if key.ends_with('/') && !self.storage.dir_exists(&key).await? {
                return Err(AppError::not_found("path_not_found".to_string(), format!("'{}' does not exist", rel)));
            }
            keys.push(key);
        }
        let bytes = self.storage.download_paths_as_zip(&keys).await?;
        info!(target: "fileplane::explorer", paths = keys.len(), bytes = bytes.len(), "zip built");
        Ok(FileBody { name: "archive.zip".to_string(), content_type: "application/zip".to_string(), bytes })
    }

    /// Save files into a directory and index them. Uploads into `<space>/import`
    /// also run the import procedures named in its settings file; a failure there
    /// is reported in the result instead of as an error.
    pub async fn upload(&self, ctx: &RequestContext, path: &str, files: Vec<Upload>) -> AppResult<UploadResult> {
        let rel = client_path(path, "path", true)?;
        let dir_key = self.dir_key(&rel);
        self.authorize_new(ctx, "explorer:upload", &paths::to_dir_path(&dir_key), AccessLevel::Write)?;
        if files.is_empty() {
            return Err(AppError::validation("file", "file: no files were uploaded"));
        }
        for f in files.iter() {
            if f.name.trim().is_empty() || f.name.contains('/') || paths::is_system_name(&f.name) {
                return Err(AppError::validation("file".to_string(), format!("file: '{}' is not a valid file name", f.name)));
            }
            paths::validate_wire_path(&f.name)?;
        }

        let mut saved = Vec::with_capacity(files.len());
        for f in files.into_iter() {
            let key = format!("{}{}", dir_key, f.name);
            self.storage.save(&key, &f.bytes).await?;
            let size = self.storage.size(&key).await?;
            self.index.upsert_file(&key, size)?;
            info!(target: "fileplane::explorer", key = %key, bytes = f.bytes.len(), "uploaded");
            saved.push(key);
        }

        let shown = dir_key.trim_end_matches('/').to_string();
        if rel == import::IMPORT_DIR {
            if let Err(e) = self.run_import(ctx, &dir_key, &saved).await {
                warn!(target: "fileplane::explorer", path = %shown, error = %e, "import procedures failed");
                return Ok(UploadResult { status: "error", path: shown, files: Vec::new(), details: Some(e.to_string()) });
            }
        }
        Ok(UploadResult { status: "ok", path: shown, files: saved, details: None })
    }

    async fn run_import(&self, ctx: &RequestContext, dir_key: &str, files: &[String]) -> AppResult<()> {
        let settings_key = format!("{}{}", dir_key, import::SETTINGS_FILE);
        if !self.storage.exists(&settings_key).await? {
            debug!(target: "fileplane::explorer", key = %settings_key, "no import settings");
            return Ok(());
        }
        let procedures = import::procedures_from_settings(&self.storage.open(&settings_key).await?)?;
        self.importer.run_procedures(&ctx.member, &procedures, files).await
    }

    /// Create a directory with its `.init` marker. Repeating it is harmless.
    pub async fn create_folder(&self, ctx: &RequestContext, path: &str) -> AppResult<PathResult> {
        let rel = non_empty(client_path(path, "path", true)?, "path")?;
        let dir_key = self.dir_key(&rel);
        let index_path = paths::to_dir_path(&dir_key);
        self.authorize_new(ctx, "explorer:create_folder", &index_path, AccessLevel::Write)?;
        self.storage.save(&dir_key, b"").await?;
        self.index.upsert_directory(&index_path)?;
        info!(target: "fileplane::explorer", path = %dir_key, "folder created");
        Ok(PathResult { status: "ok", path: dir_key })
    }

    /// Delete a file, or a directory with everything below it. The index follows.
    pub async fn delete(&self, ctx: &RequestContext, path: &str, is_dir: bool) -> AppResult<PathResult> {
        let rel = non_empty(client_path(path, "path", false)?, "path")?;
        let full = self.full(&rel);
        if is_dir {
            let key = format!("{}/", full);
            self.authorize_path(ctx, "explorer:delete", &key, AccessLevel::Write).await?;
            let objects = self.storage.delete_directory(&key).await?;
            let nodes = self.forget(&paths::to_dir_path(&key))?;
            info!(target: "fileplane::explorer", path = %key, objects, nodes, "directory deleted");
            Ok(PathResult { status: "ok", path: key })
        } else {
            self.authorize_path(ctx, "explorer:delete", &full, AccessLevel::Write).await?;
            self.storage.delete(&full).await?;
            self.forget(&full)?;
            info!(target: "fileplane::explorer", path = %full, "file deleted");
            Ok(PathResult { status: "ok", path: full })
        }
    }

    pub async fn delete_folder(&self, ctx: &RequestContext, path: &str) -> AppResult<PathResult> {
        self.delete(ctx, path, true).await
    }

    fn client_items(&self, items: &[String], strip: bool) -> AppResult<Vec<String>> {
        if items.is_empty() {
            return Err(AppError::validation("items", "items: at least one path is required"));
        }
        items
            .iter()
            .map(|i| client_path(i, "items", strip).and_then(|p| non_empty(p, "items")).map(|p| self.full(&p)))
            .collect()
    }

    pub async fn move_items(&self, ctx: &RequestContext, target: &str, items: &[String]) -> AppResult<TaskAccepted> {
        let target = client_path(target, "target_directory_path", false)?;
        let items = self.client_items(items, false)?;
        let target_key = self.dir_key(&target);
        self.authorize_path(ctx, "explorer:move", &target_key, AccessLevel::Write).await?;
        for item in items.iter() {
            self.authorize_path(ctx, "explorer:move", item, AccessLevel::Write).await?;
        }
        self.ops.validate_transfer(&target_key, &items).await?;
        self.submit(ctx, TaskOptions::Move { target_directory_path: target_key, items })
    }

    pub async fn copy_items(&self, ctx: &RequestContext, target: &str, items: &[String]) -> AppResult<TaskAccepted> {
        let target = client_path(target, "target_directory_path", true)?;
        let items = self.client_items(items, true)?;
        let target_key = self.dir_key(&target);
        self.authorize_path(ctx, "explorer:copy", &target_key, AccessLevel::Write).await?;
        for item in items.iter() {
            self.authorize_path(ctx, "explorer:copy", item, AccessLevel::Read).await?;
        }
        self.ops.validate_transfer(&target_key, &items).await?;
        self.submit(ctx, TaskOptions::Copy { target_directory_path: target_key, items })
    }

    pub async fn rename(&self, ctx: &RequestContext, path: &str, new_name: &str) -> AppResult<TaskAccepted> {
        let rel = non_empty(client_path(path, "path", true)?, "path")?;
        validate_new_name(new_name)?;
        let full = self.full(&rel);
        self.authorize_path(ctx, "explorer:rename", &full, AccessLevel::Write).await?;
        self.ops.classify(&full).await?;
        self.submit(ctx, TaskOptions::Rename { path: full, new_name: new_name.trim().to_string() })
    }

    pub async fn unzip(&self, ctx: &RequestContext, file_path: &str, target: &str) -> AppResult<TaskAccepted> {
        let file_rel = non_empty(client_path(file_path, "file_path", false)?, "file_path")?;
        let target = client_path(target, "target_directory_path", false)?;
        if !file_rel.to_lowercase().ends_with(".zip") {
            return Err(AppError::validation(
                "file_path".to_string(),
                format!("file_path: '{}' should be a zip file, with '.zip' extension", file_rel),
            ));
        }
        let file_full = self.full(&file_rel);
        let target_key = self.dir_key(&target);
        self.authorize_path(ctx, "explorer:unzip", &file_full, AccessLevel::Read).await?;
        self.authorize_path(ctx, "explorer:unzip", &target_key, AccessLevel::Write).await?;
        if !self.storage.exists(&file_full).await? {
            return Err(AppError::not_found("path_not_found".to_string(), format!("'{}' does not exist", file_rel)));
        }
        if !self.ops.directory_exists(&target_key).await? {
            return Err(AppError::validation(
                "target_directory_path".to_string(),
                format!("target_directory_path: target folder '{}' does not exist", target_key),
            ));
        }
        self.submit(ctx, TaskOptions::Unzip { file_path: file_full, target_directory_path: target_key })
    }

    /// Rebuild the space's file nodes from storage in the background.
    pub async fn sync(&self, ctx: &RequestContext) -> AppResult<TaskAccepted> {
        let root = self.dir_key("");
        self.authorize_path(ctx, "explorer:sync", &root, AccessLevel::Write).await?;
        self.submit(ctx, TaskOptions::Sync { space_code: self.space_code.clone() })
    }

    /// Case-insensitive substring search over indexed files the caller may read.
    pub fn search(&self, ctx: &RequestContext, query: &str, page: PageRequest) -> AppResult<Paged<FileEntry>> {
        let within = format!("{}/", self.space_code);
        let mut hits = Vec::new();
        for node in self.index.search(query.trim(), &within) {
            if ctx.member.bypasses_policies() || self.gate.has_access(&ctx.member, &node, AccessLevel::Read)? {
                hits.push(node);
            }
        }
        ctx.record("explorer:search", &within, true);
        let page = listing::paginate(hits, page)?;
        Ok(page.map(|n| FileEntry::from_node(&self.space_code, &n)))
    }
}

#[cfg(test)]
mod explorer_tests;
