use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use fil_bus::LogQuery;
use fil_store::{export_state, import_state, ImportStrategy};

use super::state::ApiState;
use super::types::{GraphQuery, ImportRequest, LogQueryParams, PauseRequest};
use crate::api_error::ApiError;

/// Admin gate: when a token is configured, mutating admin endpoints
/// require a matching `x-admin-token` header (constant-time comparison).
fn require_admin(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(ref expected) = state.admin_token else {
        return Ok(());
    };
    match headers.get("x-admin-token").and_then(|v| v.to_str().ok()) {
        None => Err(ApiError::unauthorized("missing x-admin-token header")),
        Some(given) => {
            if given.as_bytes().ct_eq(expected.as_bytes()).into() {
                Ok(())
            } else {
                Err(ApiError::forbidden("bad admin token"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// GET /api/v1/health -- full report.
pub(crate) async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let providers = state.registry.health(None).await;
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "subscribers": state.bus.subscriber_count(),
        "dispatcher": state.dispatcher.status().await,
        "providers": providers,
    }))
}

/// GET /api/v1/health/live -- process liveness.
pub(crate) async fn health_live() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/v1/health/ready -- readiness; 503 when any registered
/// provider is unhealthy.
pub(crate) async fn health_ready(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let providers = state.registry.health(None).await;
    let unhealthy: Vec<&str> = providers
        .iter()
        .filter(|(_, h)| !h.healthy)
        .map(|(id, _)| id.as_str())
        .collect();
    if !unhealthy.is_empty() {
        return Err(ApiError::unavailable(format!(
            "unhealthy providers: {}",
            unhealthy.join(", ")
        )));
    }
    Ok(Json(serde_json::json!({ "status": "ready" })))
}

// ---------------------------------------------------------------------------
// Work graph
// ---------------------------------------------------------------------------

/// GET /api/v1/work-graph?project_id= -- adjacency-list form.
pub(crate) async fn work_graph(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<GraphQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.graph(query.project_id).await?))
}

// ---------------------------------------------------------------------------
// Dispatcher control
// ---------------------------------------------------------------------------

/// GET /api/v1/dispatcher
pub(crate) async fn dispatcher_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.dispatcher.status().await)
}

/// POST /api/v1/dispatcher/pause
pub(crate) async fn dispatcher_pause(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PauseRequest>,
) -> impl IntoResponse {
    state.dispatcher.pause(req.reason);
    Json(state.dispatcher.status().await)
}

/// POST /api/v1/dispatcher/resume
pub(crate) async fn dispatcher_resume(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.dispatcher.resume().await;
    Json(state.dispatcher.status().await)
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// GET /api/v1/logs -- query the indexed log.
pub(crate) async fn query_logs(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<LogQueryParams>,
) -> impl IntoResponse {
    let query = LogQuery {
        min_level: params.min_level,
        component: params.component,
        project_id: params.project_id,
        since_seq: params.since_seq,
    };
    Json(state.log_handler.query(&query, params.limit))
}

// ---------------------------------------------------------------------------
// Export / import (admin-gated)
// ---------------------------------------------------------------------------

/// GET /api/v1/export -- snapshot the full state document.
pub(crate) async fn export(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let agents = state.agents.list().await;
    let rules = state.motivation.list(&Default::default()).await;
    let document = export_state(
        &state.store,
        &state.decisions,
        &state.conversations,
        &state.locks,
        &agents,
        &rules,
    )
    .await;
    Ok(Json(document))
}

/// POST /api/v1/import -- load a state document.
///
/// `dry_run=true` validates (schema version, row shapes, conflicts)
/// without mutating. Schema-version mismatch is 409. Agents and
/// motivation rules are owned outside the store: their current ids feed
/// the conflict scan, and the surviving rows are reseeded into the agent
/// manager and motivation engine here.
pub(crate) async fn import(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(req): Json<ImportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let existing_agents: Vec<Uuid> = state.agents.list().await.iter().map(|a| a.id).collect();
    let existing_rules: Vec<Uuid> = state
        .motivation
        .list(&Default::default())
        .await
        .iter()
        .map(|r| r.id)
        .collect();

    let mut report = import_state(
        &req.document,
        &state.store,
        &state.decisions,
        &state.conversations,
        &state.locks,
        &existing_agents,
        &existing_rules,
        req.strategy,
        req.dry_run,
    )
    .await?;

    let agents = std::mem::take(&mut report.agents);
    let rules = std::mem::take(&mut report.rules);
    if !req.dry_run {
        if req.strategy == ImportStrategy::Replace {
            state.agents.clear_all().await;
            state.motivation.clear_all().await;
        }
        state.agents.reseed(agents).await;
        state.motivation.reseed(rules).await;
    }
    Ok((StatusCode::OK, Json(report)))
}
