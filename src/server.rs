//!
//! fileplane HTTP server
//! ---------------------
//! Axum application serving the explorer, IAM administration, task and record APIs
//! for one space.
//!
//! Responsibilities:
//! - Wiring the stores (index, resource groups, IAM, records, tasks) over one `SharedStore`.
//! - Resolving the caller from identity headers on every request.
//! - Rendering every `AppError` as `{status: "error", error_key, message}`.
//! - Background tickers: task garbage collection and KV sweep/snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::EffectiveConfig;
use crate::driver::Storage;
use crate::error::AppResult;
use crate::explorer::Explorer;
use crate::gate::{AccessGate, BOT_MEMBER};
use crate::groups::ResourceGroups;
use crate::iam::Iam;
use crate::identity::MemberResolver;
use crate::index::PathIndex;
use crate::ops::Operations;
use crate::records::RecordStore;
use crate::storage::SharedStore;
use crate::tasks::{TaskRunner, TaskStore};

pub mod context;
pub mod response;
pub mod explorer_routes;
pub mod admin_routes;
pub mod task_routes;

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const KV_SWEEP_EVERY: Duration = Duration::from_secs(5);
const KV_SNAPSHOT_EVERY: Duration = Duration::from_secs(60);

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EffectiveConfig>,
    pub store: SharedStore,
    pub explorer: Explorer,
    pub resolver: MemberResolver,
    pub records: RecordStore,
}

/// Open every store for the configured space over `storage` and start the task workers.
pub fn build_state(cfg: EffectiveConfig, storage: Storage) -> AppResult<AppState> {
    let space = cfg.space_code.clone();
    let store = SharedStore::new(&cfg.data_root)?;
    let index = PathIndex::open(&store, &space);
    let groups = ResourceGroups::open(&store, &space, index.clone());
    let records = RecordStore::open(&store, &space);
    let iam = Iam::open(&store, &space, &cfg.configuration_code, &cfg.service_name);
    let gate = AccessGate::new(index.clone(), iam.clone());
    let ops = Operations::new(storage, index.clone(), groups, records.clone()).with_max_files(cfg.max_files);
    let runner = TaskRunner::start(TaskStore::open(&store, &space), Arc::new(ops.clone()), cfg.task_workers);

    // The space root is always indexed so gating new paths has an ancestor to stop at
    index.upsert_directory(&format!("{}/*", space))?;
    iam.directory().ensure_member(BOT_MEMBER)?;

    let resolver = MemberResolver::new(iam.directory().clone());
    let explorer = Explorer::new(&space, ops, gate, iam, runner).with_page_size(cfg.page_size);
    info!(target: "fileplane::server", space = %space, configuration = %cfg.configuration_code, "state ready");
    Ok(AppState { config: Arc::new(cfg), store, explorer, resolver, records })
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "space_code": state.config.space_code }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(explorer_routes::routes())
        .merge(admin_routes::routes())
        .merge(task_routes::routes())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Task GC plus KV sweep and snapshot tickers.
pub fn spawn_background(state: &AppState) -> Vec<tokio::task::JoinHandle<()>> {
    let cfg = &state.config;
    let mut handles = Vec::new();
    if cfg.task_gc_interval_secs > 0 {
        handles.push(
            state
                .explorer
                .runner()
                .spawn_gc(Duration::from_secs(cfg.task_gc_interval_secs), Duration::from_secs(cfg.task_ttl_secs)),
        );
    }
    let registry = state.store.kv_registry();
    handles.push(tokio::spawn(async move {
        let mut sweep = tokio::time::interval(KV_SWEEP_EVERY);
        let mut snapshot = tokio::time::interval(KV_SNAPSHOT_EVERY);
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let removed = registry.sweep_all();
                    if removed > 0 { debug!(target: "fileplane::server", removed, "kv_sweep"); }
                }
                _ = snapshot.tick() => {
                    let failed = registry.snapshot_all();
                    if failed > 0 { warn!(target: "fileplane::server", failed, "kv_snapshot"); }
                }
            }
        }
    }));
    handles
}

/// Serve on an already bound listener until the process stops.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let background = spawn_background(&state);
    info!(target: "fileplane::server", %addr, "listening");
    let res = axum::serve(listener, router(state.clone())).await;
    for h in background {
        h.abort();
    }
    if state.store.kv_registry().snapshot_all() > 0 {
        warn!(target: "fileplane::server", "final kv snapshot incomplete");
    }
    res.context("http server failed")
}

pub async fn run(cfg: EffectiveConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.data_root).with_context(|| format!("Failed to create or access data root: {}", cfg.data_root))?;
    let storage = Storage::from_settings(&cfg.storage).map_err(crate::error::AppError::from)?;
    info!(target: "fileplane::server", data_root = %cfg.data_root, backend = ?cfg.storage.kind, "storage configured");
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let state = build_state(cfg, storage)?;
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("While binding {}", addr))?;
    serve(listener, state).await
}
