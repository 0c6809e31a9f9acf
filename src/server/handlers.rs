//! HTTP and WebSocket request handlers.
//!
//! Thin glue: every handler extracts parameters, calls one gateway
//! operation and serializes the result. Errors become the structured
//! payload produced by [`AppError`]'s `IntoResponse`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State, WebSocketUpgrade},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{AppError, Result};
use crate::gateway::types::{JobSubmission, NetworkSpec, RuntimeInstallRequest, VolumeSpec};
use crate::server::events::PushKind;
use crate::server::stream::PushChannel;
use crate::server::AppState;

type Shared = State<Arc<AppState>>;

/// `?node=` selector; absent means the current node.
#[derive(Debug, Default, Deserialize)]
pub struct NodeQuery {
    pub node: Option<String>,
}

impl NodeQuery {
    fn node(&self) -> Option<&str> {
        self.node.as_deref().filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct SwitchNodeRequest {
    pub node: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateSpecRequest {
    pub spec_yaml: String,
}

/// Query of the sampling WebSocket routes.
#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    pub node: Option<String>,
    /// Sampling interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Comma separated filter, e.g. `exec,connect` or `cpu,memory`.
    #[serde(default)]
    pub types: Option<String>,
}

fn default_interval() -> u32 {
    5
}

impl TailQuery {
    fn node(&self) -> Option<&str> {
        self.node.as_deref().filter(|n| !n.is_empty())
    }

    fn types(&self) -> Vec<String> {
        self.types
            .as_deref()
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallObserveQuery {
    /// Skip events already returned by the install request.
    #[serde(default)]
    pub skip_delivered: bool,
}

fn require_upgrade(ws: Option<WebSocketUpgrade>) -> Result<WebSocketUpgrade> {
    ws.ok_or_else(|| AppError::Validation("WebSocket upgrade required".to_string()))
}

// ---- Service ----

/// Health check endpoint.
pub async fn health_check(State(state): Shared) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "jobdeck",
        "version": env!("CARGO_PKG_VERSION"),
        "currentNode": state.gateway.current_node(),
    }))
}

/// Prometheus exposition.
pub async fn prometheus_metrics(State(state): Shared) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

pub async fn stats(State(state): Shared) -> impl IntoResponse {
    Json(json!({
        "service": state.metrics.to_json(),
        "cache": state.gateway.cache_stats(),
        "installSessions": state.gateway.live_install_sessions(),
    }))
}

// ---- Nodes ----

pub async fn list_nodes(State(state): Shared) -> impl IntoResponse {
    Json(state.gateway.list_nodes())
}

pub async fn current_node(State(state): Shared) -> impl IntoResponse {
    Json(json!({ "current": state.gateway.current_node() }))
}

pub async fn switch_node(State(state): Shared, Json(body): Json<SwitchNodeRequest>) -> Result<impl IntoResponse> {
    let previous = state.gateway.switch_node(&body.node)?;
    info!("Current node switched from '{}' to '{}'", previous, body.node);
    Ok(Json(json!({ "previous": previous, "current": body.node })))
}

pub async fn reload_nodes(State(state): Shared) -> impl IntoResponse {
    Json(state.gateway.reload_nodes())
}

// ---- Jobs ----

pub async fn list_jobs(State(state): Shared, Query(q): Query<NodeQuery>) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.list_jobs(q.node()).await?))
}

pub async fn run_job(
    State(state): Shared,
    Query(q): Query<NodeQuery>,
    Json(submission): Json<JobSubmission>,
) -> Result<impl IntoResponse> {
    let started = state.gateway.run_job(q.node(), submission).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

pub async fn delete_all_jobs(State(state): Shared, Query(q): Query<NodeQuery>) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.delete_all_jobs(q.node()).await?))
}

pub async fn job_status(
    State(state): Shared,
    Path(id): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.job_status(q.node(), &id).await?))
}

pub async fn stop_job(
    State(state): Shared,
    Path(id): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.stop_job(q.node(), &id).await?))
}

pub async fn delete_job(
    State(state): Shared,
    Path(id): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.delete_job(q.node(), &id).await?))
}

// ---- Networks ----

pub async fn list_networks(State(state): Shared, Query(q): Query<NodeQuery>) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.list_networks(q.node()).await?))
}

pub async fn create_network(
    State(state): Shared,
    Query(q): Query<NodeQuery>,
    Json(spec): Json<NetworkSpec>,
) -> Result<impl IntoResponse> {
    let created = state.gateway.create_network(q.node(), spec).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn remove_network(
    State(state): Shared,
    Path(name): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.remove_network(q.node(), &name).await?))
}

// ---- Volumes ----

pub async fn list_volumes(State(state): Shared, Query(q): Query<NodeQuery>) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.list_volumes(q.node()).await?))
}

pub async fn create_volume(
    State(state): Shared,
    Query(q): Query<NodeQuery>,
    Json(spec): Json<VolumeSpec>,
) -> Result<impl IntoResponse> {
    let created = state.gateway.create_volume(q.node(), spec).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn remove_volume(
    State(state): Shared,
    Path(name): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.remove_volume(q.node(), &name).await?))
}

// ---- System ----

pub async fn system_status(State(state): Shared, Query(q): Query<NodeQuery>) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.system_status(q.node()).await?))
}

// ---- Runtimes ----

pub async fn list_runtimes(State(state): Shared, Query(q): Query<NodeQuery>) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.list_runtimes(q.node()).await?))
}

pub async fn runtime_info(
    State(state): Shared,
    Path(name): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.runtime_info(q.node(), &name).await?))
}

pub async fn remove_runtime(
    State(state): Shared,
    Path(name): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.remove_runtime(q.node(), &name).await?))
}

pub async fn validate_runtime_spec(
    State(state): Shared,
    Query(q): Query<NodeQuery>,
    Json(body): Json<ValidateSpecRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.validate_runtime_spec(q.node(), &body.spec_yaml).await?))
}

pub async fn install_runtime(
    State(state): Shared,
    Query(q): Query<NodeQuery>,
    Json(request): Json<RuntimeInstallRequest>,
) -> Result<impl IntoResponse> {
    let started = state.gateway.install_runtime(q.node(), request).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

pub async fn install_status(State(state): Shared, Path(id): Path<String>) -> Result<impl IntoResponse> {
    Ok(Json(state.gateway.install_status(&id)?))
}

// ---- Push channels ----
//
// Everything that can fail is checked before upgrading, so bad nodes,
// unknown sessions and capacity limits answer with a plain HTTP error.

pub async fn ws_job_logs(
    ws: Option<WebSocketUpgrade>,
    State(state): Shared,
    Path(job): Path<String>,
    Query(q): Query<NodeQuery>,
) -> Result<Response> {
    let ws = require_upgrade(ws)?;
    let permit = state.acquire_stream_slot()?;
    let subscription = state.gateway.tail_job_logs(q.node(), &job)?;
    let metrics = state.metrics.clone();
    Ok(ws.on_upgrade(move |socket| {
        PushChannel::new(socket, metrics, permit).relay(subscription, PushKind::Log, format!("logs for job {}", job))
    }))
}

pub async fn ws_job_metrics(
    ws: Option<WebSocketUpgrade>,
    State(state): Shared,
    Path(job): Path<String>,
    Query(q): Query<TailQuery>,
) -> Result<Response> {
    let ws = require_upgrade(ws)?;
    let permit = state.acquire_stream_slot()?;
    let subscription = state.gateway.tail_job_metrics(q.node(), &job, q.interval)?;
    let metrics = state.metrics.clone();
    Ok(ws.on_upgrade(move |socket| {
        PushChannel::new(socket, metrics, permit).relay(
            subscription,
            PushKind::Metrics,
            format!("metrics for job {}", job),
        )
    }))
}

pub async fn ws_job_telemetry(
    ws: Option<WebSocketUpgrade>,
    State(state): Shared,
    Path(job): Path<String>,
    Query(q): Query<TailQuery>,
) -> Result<Response> {
    let ws = require_upgrade(ws)?;
    let permit = state.acquire_stream_slot()?;
    let subscription = state.gateway.tail_job_telemetry(q.node(), &job, q.types())?;
    let metrics = state.metrics.clone();
    Ok(ws.on_upgrade(move |socket| {
        PushChannel::new(socket, metrics, permit).relay(
            subscription,
            PushKind::Telemetry,
            format!("telemetry for job {}", job),
        )
    }))
}

pub async fn ws_system_metrics(
    ws: Option<WebSocketUpgrade>,
    State(state): Shared,
    Query(q): Query<TailQuery>,
) -> Result<Response> {
    let ws = require_upgrade(ws)?;
    let permit = state.acquire_stream_slot()?;
    let subscription = state.gateway.tail_system_metrics(q.node(), q.interval, q.types())?;
    let metrics = state.metrics.clone();
    Ok(ws.on_upgrade(move |socket| {
        PushChannel::new(socket, metrics, permit).relay(
            subscription,
            PushKind::Metrics,
            "system metrics".to_string(),
        )
    }))
}

pub async fn ws_install(
    ws: Option<WebSocketUpgrade>,
    State(state): Shared,
    Path(id): Path<String>,
    Query(q): Query<InstallObserveQuery>,
) -> Result<Response> {
    let observer = state.gateway.observe_install(&id, q.skip_delivered)?;
    let ws = require_upgrade(ws)?;
    let permit = state.acquire_stream_slot()?;
    let metrics = state.metrics.clone();
    Ok(ws.on_upgrade(move |socket| PushChannel::new(socket, metrics, permit).observe_install(observer)))
}

/// Count requests and error answers for `/api/stats`.
async fn track_requests(State(state): Shared, request: Request, next: Next) -> Response {
    state.metrics.record_request();
    let response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        state.metrics.record_error();
    }
    response
}

/// Create the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/nodes", get(list_nodes))
        .route("/nodes/current", get(current_node).post(switch_node))
        .route("/nodes/reload", post(reload_nodes))
        .route("/jobs", get(list_jobs).post(run_job).delete(delete_all_jobs))
        .route("/jobs/:id", get(job_status).delete(delete_job))
        .route("/jobs/:id/stop", post(stop_job))
        .route("/networks", get(list_networks).post(create_network))
        .route("/networks/:name", axum::routing::delete(remove_network))
        .route("/volumes", get(list_volumes).post(create_volume))
        .route("/volumes/:name", axum::routing::delete(remove_volume))
        .route("/system", get(system_status))
        .route("/runtimes", get(list_runtimes))
        .route("/runtimes/validate", post(validate_runtime_spec))
        .route("/runtimes/install", post(install_runtime))
        .route("/runtimes/install/:id", get(install_status))
        .route("/runtimes/:name", get(runtime_info).delete(remove_runtime))
        .route("/stats", get(stats))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests));

    let ws = Router::new()
        .route("/logs/:job", get(ws_job_logs))
        .route("/metrics/:job", get(ws_job_metrics))
        .route("/telemetry/:job", get(ws_job_telemetry))
        .route("/system-metrics", get(ws_system_metrics))
        .route("/install/:id", get(ws_install));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .nest("/api", api)
        .nest("/ws", ws)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
