//! `/api/v1/iam/*`: access policies, roles, groups, members and resource groups.
//!
//! Every route is itself policy-checked as `<service>:<viewset>:<action>` on
//! `frn:<service>:iam:<viewset>:<code>`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::error::AppError;
use crate::groups::GroupSpec;
use crate::iam::{ContainerSpec, MemberSpec, PolicySpec, ResourceRef};
use crate::identity::RequestContext;

use super::context::Caller;
use super::explorer_routes::json_body;
use super::response::{ok_json, ApiResult};
use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/iam/access-policy/", get(list_policies).post(create_policy))
        .route("/api/v1/iam/access-policy/{code}/", get(get_policy).put(update_policy).delete(delete_policy))
        .route("/api/v1/iam/role/", get(list_roles).post(create_role))
        .route("/api/v1/iam/role/{code}/", get(get_role).put(update_role).delete(delete_role))
        .route("/api/v1/iam/group/", get(list_groups).post(create_group))
        .route("/api/v1/iam/group/{code}/", get(get_group).put(update_group).delete(delete_group))
        .route("/api/v1/iam/member/", get(list_members).post(upsert_member))
        .route("/api/v1/iam/member/{username}/", get(get_member).delete(delete_member))
        .route("/api/v1/iam/resource-group/", get(list_resource_groups).post(create_resource_group))
        .route(
            "/api/v1/iam/resource-group/{code}/",
            get(get_resource_group).put(update_resource_group).delete(delete_resource_group),
        )
}

fn authorize(state: &AppState, ctx: &RequestContext, viewset: &str, action: &str, method: &str, code: Option<&str>) -> ApiResult<()> {
    let iam = state.explorer.iam();
    let mut req = iam.request(viewset, action, method);
    if let Some(code) = code {
        req = req.on(ResourceRef::new(format!("iam:{}", viewset), code));
    }
    let res = iam.authorize(&ctx.member, &req);
    ctx.record(&req.action_string(), code.unwrap_or("*"), res.is_ok());
    res
}

fn created<T: serde::Serialize>(v: T) -> ApiResult<Response> {
    Ok((StatusCode::CREATED, Json(v)).into_response())
}

fn deleted() -> ApiResult<Response> {
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn not_found(kind: &str, code: &str) -> AppError {
    AppError::not_found(format!("{}_not_found", kind), format!("{} '{}' does not exist", kind, code))
}

/// The body's `user_code` must agree with the one in the URL.
fn same_code(url: &str, body: &str) -> ApiResult<()> {
    if !body.is_empty() && body != url {
        return Err(AppError::validation("user_code", "user_code: field is immutable"));
    }
    Ok(())
}

// ---- access policies ----

const POLICY: &str = "accesspolicy";

async fn list_policies(State(state): State<AppState>, Caller(ctx): Caller) -> ApiResult<Response> {
    authorize(&state, &ctx, POLICY, "list", "GET", None)?;
    ok_json(state.explorer.iam().directory().list_policies())
}

async fn create_policy(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let spec: PolicySpec = json_body(&body)?;
    authorize(&state, &ctx, POLICY, "create", "POST", Some(spec.user_code.as_str()))?;
    created(state.explorer.iam().directory().create_policy(spec)?)
}

async fn get_policy(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, POLICY, "retrieve", "GET", Some(code.as_str()))?;
    ok_json(state.explorer.iam().directory().require_policy(&code)?)
}

async fn update_policy(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>, body: Bytes) -> ApiResult<Response> {
    let mut spec: PolicySpec = json_body(&body)?;
    same_code(&code, &spec.user_code)?;
    spec.user_code = code.clone();
    authorize(&state, &ctx, POLICY, "update", "PUT", Some(code.as_str()))?;
    ok_json(state.explorer.iam().directory().update_policy(&code, spec)?)
}

async fn delete_policy(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, POLICY, "destroy", "DELETE", Some(code.as_str()))?;
    state.explorer.iam().directory().delete_policy(&code)?;
    deleted()
}

// ---- roles ----

const ROLE: &str = "role";

async fn list_roles(State(state): State<AppState>, Caller(ctx): Caller) -> ApiResult<Response> {
    authorize(&state, &ctx, ROLE, "list", "GET", None)?;
    ok_json(state.explorer.iam().directory().list_roles())
}

async fn create_role(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let spec: ContainerSpec = json_body(&body)?;
    authorize(&state, &ctx, ROLE, "create", "POST", Some(spec.user_code.as_str()))?;
    created(state.explorer.iam().directory().create_role(spec)?)
}

async fn get_role(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, ROLE, "retrieve", "GET", Some(code.as_str()))?;
    let role = state.explorer.iam().directory().get_role(&code)?.ok_or_else(|| not_found(ROLE, &code))?;
    ok_json(role)
}

async fn update_role(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>, body: Bytes) -> ApiResult<Response> {
    let mut spec: ContainerSpec = json_body(&body)?;
    same_code(&code, &spec.user_code)?;
    spec.user_code = code.clone();
    authorize(&state, &ctx, ROLE, "update", "PUT", Some(code.as_str()))?;
    ok_json(state.explorer.iam().directory().update_role(&code, spec)?)
}

async fn delete_role(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, ROLE, "destroy", "DELETE", Some(code.as_str()))?;
    state.explorer.iam().directory().delete_role(&code)?;
    deleted()
}

// ---- groups ----

const GROUP: &str = "group";

async fn list_groups(State(state): State<AppState>, Caller(ctx): Caller) -> ApiResult<Response> {
    authorize(&state, &ctx, GROUP, "list", "GET", None)?;
    ok_json(state.explorer.iam().directory().list_groups())
}

async fn create_group(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let spec: ContainerSpec = json_body(&body)?;
    authorize(&state, &ctx, GROUP, "create", "POST", Some(spec.user_code.as_str()))?;
    created(state.explorer.iam().directory().create_group(spec)?)
}

async fn get_group(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, GROUP, "retrieve", "GET", Some(code.as_str()))?;
    let group = state.explorer.iam().directory().get_group(&code)?.ok_or_else(|| not_found(GROUP, &code))?;
    ok_json(group)
}

async fn update_group(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>, body: Bytes) -> ApiResult<Response> {
    let mut spec: ContainerSpec = json_body(&body)?;
    same_code(&code, &spec.user_code)?;
    spec.user_code = code.clone();
    authorize(&state, &ctx, GROUP, "update", "PUT", Some(code.as_str()))?;
    ok_json(state.explorer.iam().directory().update_group(&code, spec)?)
}

async fn delete_group(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, GROUP, "destroy", "DELETE", Some(code.as_str()))?;
    state.explorer.iam().directory().delete_group(&code)?;
    deleted()
}

// ---- members ----

const MEMBER: &str = "member";

async fn list_members(State(state): State<AppState>, Caller(ctx): Caller) -> ApiResult<Response> {
    authorize(&state, &ctx, MEMBER, "list", "GET", None)?;
    ok_json(state.explorer.iam().directory().list_members())
}

async fn upsert_member(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let spec: MemberSpec = json_body(&body)?;
    authorize(&state, &ctx, MEMBER, "create", "POST", Some(spec.username.as_str()))?;
    // Only members who bypass policies may hand out the bypass
    if (spec.is_admin || spec.is_superuser) && !ctx.member.bypasses_policies() {
        return Err(AppError::permission_denied("admin_flag".to_string(), "only admins may grant admin flags".to_string()));
    }
    ok_json(state.explorer.iam().directory().upsert_member(spec)?)
}

async fn get_member(State(state): State<AppState>, Caller(ctx): Caller, Path(username): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, MEMBER, "retrieve", "GET", Some(username.as_str()))?;
    let member = state.explorer.iam().directory().get_member(&username)?.ok_or_else(|| not_found(MEMBER, &username))?;
    ok_json(member)
}

async fn delete_member(State(state): State<AppState>, Caller(ctx): Caller, Path(username): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, MEMBER, "destroy", "DELETE", Some(username.as_str()))?;
    state.explorer.iam().directory().delete_member(&username)?;
    deleted()
}

// ---- resource groups ----

const RESOURCE_GROUP: &str = "resourcegroup";

async fn list_resource_groups(State(state): State<AppState>, Caller(ctx): Caller) -> ApiResult<Response> {
    authorize(&state, &ctx, RESOURCE_GROUP, "list", "GET", None)?;
    ok_json(state.explorer.groups().list_groups())
}

async fn create_resource_group(State(state): State<AppState>, Caller(ctx): Caller, body: Bytes) -> ApiResult<Response> {
    let spec: GroupSpec = json_body(&body)?;
    authorize(&state, &ctx, RESOURCE_GROUP, "create", "POST", Some(spec.user_code.as_str()))?;
    created(state.explorer.groups().create_group(spec)?)
}

async fn get_resource_group(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, RESOURCE_GROUP, "retrieve", "GET", Some(code.as_str()))?;
    let groups = state.explorer.groups();
    let group = groups.require_group(&code)?;
    ok_json(json!({ "group": group, "assignments": groups.assignments(&code) }))
}

async fn update_resource_group(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>, body: Bytes) -> ApiResult<Response> {
    let mut spec: GroupSpec = json_body(&body)?;
    same_code(&code, &spec.user_code)?;
    spec.user_code = code.clone();
    authorize(&state, &ctx, RESOURCE_GROUP, "update", "PUT", Some(code.as_str()))?;
    ok_json(state.explorer.groups().update_group(&code, spec)?)
}

async fn delete_resource_group(State(state): State<AppState>, Caller(ctx): Caller, Path(code): Path<String>) -> ApiResult<Response> {
    authorize(&state, &ctx, RESOURCE_GROUP, "destroy", "DELETE", Some(code.as_str()))?;
    state.explorer.groups().delete_group(&code)?;
    deleted()
}
