//! `/api/v1/explorer/*`: the storage explorer over HTTP.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::explorer::{PageRequest, Upload};

use super::context::Caller;
use super::response::{file_response, ok_json, paged_body, truthy, ApiResult};
use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/explorer/explorer/", get(list))
        .route("/api/v1/explorer/view/", get(view))
        .route("/api/v1/explorer/server-file/{*path}", get(server_file))
        .route("/api/v1/explorer/upload/", post(upload))
        .route("/api/v1/explorer/delete/", post(delete))
        .route("/api/v1/explorer/create-folder/", post(create_folder))
        .route("/api/v1/explorer/delete-folder/", post(delete_folder))
        .route("/api/v1/explorer/download-as-zip/", post(download_as_zip))
        .route("/api/v1/explorer/download/", post(download))
        .route("/api/v1/explorer/move/", post(move_items))
        .route("/api/v1/explorer/copy/", post(copy_items))
        .route("/api/v1/explorer/rename/", post(rename))
        .route("/api/v1/explorer/unzip/", post(unzip))
        .route("/api/v1/explorer/sync/", post(sync))
        .route("/api/v1/explorer/search/", get(search))
        .route("/api/v1/explorer/set-access-policy/", post(set_access_policy))
        .route("/api/v1/explorer/set-resource-group/", post(set_resource_group))
        .route("/api/v1/explorer/storage-object/", get(list_storage_objects))
        .route("/api/v1/explorer/storage-object/{id}/", get(get_storage_object).patch(patch_storage_object))
}

/// An empty body reads as `{}` so optional-only payloads may be omitted.
pub(super) fn json_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(serde_json::from_str("{}")?);
    }
    Ok(serde_json::from_slice(body)?)
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PageQuery {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl PageQuery {
    pub fn page(&self, default_size: usize) -> PageRequest {
        PageRequest::new(self.page, self.page_size, default_size)
    }
}

async fn list(State(state): State<AppState>, Caller(ctx): Caller, uri: Uri, Query(q): Query<PageQuery>) -> ApiResult<Response> {
    let path = q.path.clone().unwrap_or_default();
    let page = state.explorer.list(&ctx, &path, q.page(state.explorer.page_size())).await?;
    let mut body = paged_body(uri.path(), &[("path", path.as_str())], &page);
    body["status"] = json!("ok");
    body["path"] = json!(path.trim_matches('/'));
    ok_json(body)
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

async fn view(State(state): State<AppState>, Caller(ctx): Caller, Query(q): Query<PathQuery>) -> ApiResult<Response> {
    Ok(file_response(state.explorer.view(&ctx, &q.path).await?, false))
}

async fn server_file(State(state): State<AppState>, Caller(ctx): Caller, Path(path): Path<String>) -> ApiResult<Response> {
    Ok(file_response(state.explorer.server_file(&ctx, &path).await?, false))
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> AppError {
    AppError::validation("file".to_string(), format!("file: {}", e.body_text()))
}

async fn upload(State(state): State<AppState>, Caller(ctx): Caller, mut multipart: Multipart) -> ApiResult<Response> {
    let mut path = String::new();
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "path" => path = field.text().await.map_err(bad_multipart)?,
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                files.push(Upload { name: file_name, bytes: bytes.to_vec() });
            }
            _ => {}
        }
    }
    let result = state.explorer.upload(&ctx, &path, files).await?;
    let status = if result.is_ok() { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    Ok((status, Json(result)).into_response())
}

/// Delete takes `path` and `is_dir` from the query string or a JSON body.
async fn delete(State(state): State<AppState>, Caller(ctx): Caller, Query(q): Query<HashMap<String, String>>, body: Bytes) -> ApiResult<Response> {
    let payload: Value = json_body(&body)?;
    let path = q
        .get("path")
        .cloned()
        .or_else(|| payload.get("path").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    let is_dir = match q.get("is_dir") {
        Some(v) => truthy(Some(&Value::String(v.clone()))),
        None => truthy(payload.get("is_dir")),
    };
    ok_json(state.explorer.delete(&ctx, &path, is_dir).await?)
}

#[derive(Debug, Deserialize)]
struct PathBody {
    #[serde(default)]
    path: String,
}

async fn create_folder(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: PathBody = json_body(&body)?;
    ok_json(state.explorer.create_folder(&ctx, &b.path).await?)
}

async fn delete_folder(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: PathBody = json_body(&body)?;
    ok_json(state.explorer.delete_folder(&ctx, &b.path).await?)
}

async fn download(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: PathBody = json_body(&body)?;
    Ok(file_response(state.explorer.download(&ctx, &b.path).await?, true))
}

#[derive(Debug, Deserialize)]
struct PathsBody {
    #[serde(default)]
    paths: Vec<String>,
}

async fn download_as_zip(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: PathsBody = json_body(&body)?;
    Ok(file_response(state.explorer.download_as_zip(&ctx, &b.paths).await?, true))
}

#[derive(Debug, Deserialize)]
struct TransferBody {
    #[serde(default)]
    target_directory_path: String,
    #[serde(default)]
    items: Vec<String>,
}

async fn move_items(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: TransferBody = json_body(&body)?;
    ok_json(state.explorer.move_items(&ctx, &b.target_directory_path, &b.items).await?)
}

async fn copy_items(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: TransferBody = json_body(&body)?;
    ok_json(state.explorer.copy_items(&ctx, &b.target_directory_path, &b.items).await?)
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    #[serde(default)]
    path: String,
    #[serde(default)]
    new_name: String,
}

async fn rename(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: RenameBody = json_body(&body)?;
    ok_json(state.explorer.rename(&ctx, &b.path, &b.new_name).await?)
}

#[derive(Debug, Deserialize)]
struct UnzipBody {
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    target_directory_path: String,
}

async fn unzip(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: UnzipBody = json_body(&body)?;
    ok_json(state.explorer.unzip(&ctx, &b.file_path, &b.target_directory_path).await?)
}

async fn sync(State(state): State<AppState>, Caller(ctx): Caller) -> ApiResult<Response> {
    ok_json(state.explorer.sync(&ctx).await?)
}

async fn search(State(state): State<AppState>, Caller(ctx): Caller, uri: Uri, Query(q): Query<PageQuery>) -> ApiResult<Response> {
    let query = q.query.clone().unwrap_or_default();
    let page = state.explorer.search(&ctx, &query, q.page(state.explorer.page_size()))?;
    let mut body = paged_body(uri.path(), &[("query", query.as_str())], &page);
    body["status"] = json!("ok");
    ok_json(body)
}

#[derive(Debug, Deserialize)]
struct AccessPolicyBody {
    #[serde(default)]
    path: String,
    #[serde(default)]
    access: String,
    #[serde(default)]
    username: String,
}

async fn set_access_policy(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: AccessPolicyBody = json_body(&body)?;
    let policy = state.explorer.set_access_policy(&ctx, &b.path, &b.access, &b.username)?;
    ok_json(json!({ "status": "ok", "policy": policy }))
}

#[derive(Debug, Deserialize)]
struct ResourceGroupBody {
    #[serde(default)]
    path: String,
    #[serde(default)]
    resource_groups: Vec<String>,
}

async fn set_resource_group(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let b: ResourceGroupBody = json_body(&body)?;
    let node = state.explorer.set_resource_group(&ctx, &b.path, &b.resource_groups)?;
    ok_json(node)
}

async fn list_storage_objects(State(state): State<AppState>, Caller(ctx): Caller, uri: Uri, Query(q): Query<PageQuery>) -> ApiResult<Response> {
    let page = state.explorer.list_storage_objects(&ctx, q.path.as_deref(), q.page(state.explorer.page_size()))?;
    let path = q.path.clone().unwrap_or_default();
    ok_json(paged_body(uri.path(), &[("path", path.as_str())], &page))
}

async fn get_storage_object(State(state): State<AppState>, Caller(ctx): Caller, Path(id): Path<u64>) -> ApiResult<Response> {
    ok_json(state.explorer.get_storage_object(&ctx, id)?)
}

async fn patch_storage_object(State(state): State<AppState>, Caller(ctx): Caller, Path(id): Path<u64>, body: Bytes) -> ApiResult<Response> {
    let b: Value = json_body(&body)?;
    ok_json(state.explorer.patch_storage_object(&ctx, id, b)?)
}
