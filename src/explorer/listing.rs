//! Listing entries and page-number pagination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::index::StorageNode;
use crate::paths;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub mime_type: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Space-relative, with a leading `/`
    pub file_path: String,
    pub size: u64,
    pub size_pretty: String,
}

impl FileEntry {
    pub fn new(space_code: &str, key: &str, size: u64, created_at: DateTime<Utc>, modified_at: DateTime<Utc>) -> Self {
        let name = paths::basename(key).to_string();
        FileEntry {
            mime_type: paths::mime_of(&name).map(str::to_string),
            file_path: space_relative(space_code, key),
            name,
            created_at,
            modified_at,
            size,
            size_pretty: paths::pretty_size(size),
        }
    }

    pub fn from_node(space_code: &str, node: &StorageNode) -> Self {
        Self::new(space_code, &node.path, node.size, node.created_at, node.modified_at)
    }
}

/// `space00000/a/b.txt` becomes `/a/b.txt`.
pub fn space_relative(space_code: &str, key: &str) -> String {
    let rest = key.strip_prefix(space_code).unwrap_or(key).trim_start_matches('/');
    format!("/{}", rest)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListEntry {
    Dir { name: String },
    File(FileEntry),
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(page: Option<usize>, page_size: Option<usize>, default_size: usize) -> Self {
        PageRequest { page: page.unwrap_or(1), page_size: page_size.unwrap_or(default_size).max(1) }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Paged<T> {
    pub count: usize,
    pub page: usize,
    pub page_size: usize,
    pub results: Vec<T>,
}

impl<T> Paged<T> {
    pub fn previous_page(&self) -> Option<usize> {
        if self.page > 1 { Some(self.page - 1) } else { None }
    }

    pub fn next_page(&self) -> Option<usize> {
        if self.page * self.page_size < self.count { Some(self.page + 1) } else { None }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paged<U> {
        Paged { count: self.count, page: self.page, page_size: self.page_size, results: self.results.into_iter().map(f).collect() }
    }
}

/// Slice one page out of `items`. The first page always exists; any other page past
/// the end is NOT_FOUND.
pub fn paginate<T>(items: Vec<T>, req: PageRequest) -> AppResult<Paged<T>> {
    if req.page == 0 {
        return Err(AppError::validation("page", "page: pages are numbered from 1"));
    }
    let count = items.len();
    let start = (req.page - 1).saturating_mul(req.page_size);
    if req.page > 1 && start >= count {
        return Err(AppError::not_found("invalid_page".to_string(), format!("page {} is past the last page", req.page)));
    }
    let results = items.into_iter().skip(start).take(req.page_size).collect();
    Ok(Paged { count, page: req.page, page_size: req.page_size, results })
}
