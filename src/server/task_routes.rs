//! `/api/v1/tasks/*` and `/api/v1/records/*`.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::error::AppError;
use crate::identity::RequestContext;
use crate::records::RecordSpec;
use crate::tasks::{Task, TaskOptions};

use super::context::Caller;
use super::explorer_routes::json_body;
use super::response::{ok_json, ApiResult};
use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/tasks/task/", get(list_tasks))
        .route("/api/v1/tasks/task/{id}/", get(get_task))
        .route("/api/v1/tasks/task/{id}/cancel/", post(cancel_task))
        .route("/api/v1/tasks/task/{id}/relaunch/", post(relaunch_task))
        .route("/api/v1/records/{content_type}/", get(list_records).post(create_record))
        .route("/api/v1/records/{content_type}/bulk-delete/", post(bulk_delete))
        .route("/api/v1/records/{content_type}/{id}/", get(get_record))
}

const TASK: &str = "task";

/// True when the policies allow `action` on any task, not just the caller's own.
fn may_act_on_all(state: &AppState, ctx: &RequestContext, action: &str, method: &str) -> ApiResult<bool> {
    let iam = state.explorer.iam();
    let req = iam.request(TASK, action, method);
    Ok(iam.evaluate(&ctx.member, &req)?.allow)
}

/// The task, if the caller submitted it or is allowed `action` on every task.
fn owned_task(state: &AppState, ctx: &RequestContext, id: u64, action: &str, method: &str) -> ApiResult<Task> {
    let task = state.explorer.runner().store().require(id)?;
    let allowed = (!ctx.member.is_anonymous() && task.member == ctx.member.username) || may_act_on_all(state, ctx, action, method)?;
    ctx.record(&format!("{}:{}:{}", state.explorer.iam().service(), TASK, action), &id.to_string(), allowed);
    if !allowed {
        // Someone else's task looks the same as a missing one
        return Err(AppError::task_not_found("task_not_found".to_string(), format!("task {} not found", id)));
    }
    Ok(task)
}

#[derive(Debug, Default, Deserialize)]
struct TaskQuery {
    #[serde(default)]
    status: Option<String>,
}

async fn list_tasks(State(state): State<AppState>, Caller(ctx): Caller, Query(q): Query<TaskQuery>) -> ApiResult<Response> {
    let all = may_act_on_all(&state, &ctx, "list", "GET")?;
    let tasks: Vec<Task> = state
        .explorer
        .runner()
        .store()
        .list()
        .into_iter()
        .filter(|t| all || (!ctx.member.is_anonymous() && t.member == ctx.member.username))
        .filter(|t| q.status.as_deref().map_or(true, |s| t.status.as_str().eq_ignore_ascii_case(s)))
        .collect();
    ok_json(json!({ "count": tasks.len(), "results": tasks }))
}

async fn get_task(State(state): State<AppState>, Caller(ctx): Caller, Path(id): Path<u64>) -> ApiResult<Response> {
    ok_json(owned_task(&state, &ctx, id, "retrieve", "GET")?)
}

async fn cancel_task(State(state): State<AppState>, Caller(ctx): Caller, Path(id): Path<u64>) -> ApiResult<Response> {
    owned_task(&state, &ctx, id, "cancel", "POST")?;
    ok_json(state.explorer.runner().cancel(id)?)
}

#[derive(Debug, Default, Deserialize)]
struct RelaunchBody {
    #[serde(default)]
    options: Option<serde_json::Value>,
}

async fn relaunch_task(State(state): State<AppState>, Caller(ctx): Caller, Path(id): Path<u64>, body: Bytes) -> ApiResult<Response> {
    let b: RelaunchBody = json_body(&body)?;
    owned_task(&state, &ctx, id, "relaunch", "POST")?;
    let task = state.explorer.runner().relaunch(id, b.options, &ctx.member.username)?;
    ok_json(json!({ "status": "ok", "task_id": task.id }))
}

// ---- records ----

fn authorize_records(state: &AppState, ctx: &RequestContext, content_type: &str, action: &str, method: &str) -> ApiResult<()> {
    let iam = state.explorer.iam();
    let req = iam.request(content_type, action, method);
    let res = iam.authorize(&ctx.member, &req);
    ctx.record(&req.action_string(), content_type, res.is_ok());
    res
}

#[derive(Debug, Default, Deserialize)]
struct RecordQuery {
    #[serde(default)]
    include_deleted: Option<String>,
}

async fn list_records(State(state): State<AppState>, Caller(ctx): Caller, Path(content_type): Path<String>, Query(q): Query<RecordQuery>) -> ApiResult<Response> {
    authorize_records(&state, &ctx, &content_type, "list", "GET")?;
    let include_deleted = q.include_deleted.as_deref().is_some_and(crate::paths::is_true_value);
    let rows = state.records.list(&content_type, include_deleted);
    ok_json(json!({ "count": rows.len(), "results": rows }))
}

async fn create_record(State(state): State<AppState>, Caller(ctx): Caller, Path(content_type): Path<String>, body: Bytes) -> ApiResult<Response> {
    let spec: RecordSpec = json_body(&body)?;
    authorize_records(&state, &ctx, &content_type, "create", "POST")?;
    let rec = state.records.insert(&content_type, spec)?;
    Ok((StatusCode::CREATED, Json(rec)).into_response())
}

async fn get_record(State(state): State<AppState>, Caller(ctx): Caller, Path((content_type, id)): Path<(String, u64)>) -> ApiResult<Response> {
    authorize_records(&state, &ctx, &content_type, "retrieve", "GET")?;
    ok_json(state.records.require(&content_type, id)?)
}

#[derive(Debug, Default, Deserialize)]
struct BulkDeleteBody {
    #[serde(default)]
    ids: Vec<u64>,
}

async fn bulk_delete(State(state): State<AppState>, Caller(ctx): Caller, Path(content_type): Path<String>, body: Bytes) -> ApiResult<Response> {
    let b: BulkDeleteBody = json_body(&body)?;
    if b.ids.is_empty() {
        return Err(AppError::validation("ids", "ids: may not be empty"));
    }
    authorize_records(&state, &ctx, &content_type, "bulk_delete", "POST")?;
    let task = state
        .explorer
        .runner()
        .submit(TaskOptions::BulkDelete { content_type, ids: b.ids }, &ctx.member.username)?;
    ok_json(json!({ "status": "ok", "task_id": task.id }))
}
