use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use fil_store::NewBead;

use super::state::ApiState;
use super::types::{
    BeadQuery, ClaimRequest, CreateBeadRequest, EscalateRequest, RedispatchRequest,
    UpdateBeadRequest,
};
use crate::api_error::ApiError;

/// GET /api/v1/beads -- list beads.
///
/// Filters compose conjunctively over `project_id`, `status`, `type`,
/// `priority` and `assigned_to` (comma-separated set of agent ids).
pub(crate) async fn list_beads(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BeadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.into_filter()?;
    let beads = state.store.list(&filter).await;
    Ok(Json(beads))
}

/// POST /api/v1/beads -- create a bead.
pub(crate) async fn create_bead(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateBeadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut new = NewBead::new(req.title, req.bead_type, req.project_id);
    new.description = req.description;
    new.priority = req.priority;
    new.parent_id = req.parent_id;
    new.tags = req.tags;
    new.blocked_by = req.blocked_by;
    new.context = req.context;

    let bead = state.store.create(new).await?;
    Ok((StatusCode::CREATED, Json(bead)))
}

/// GET /api/v1/beads/{id}
pub(crate) async fn get_bead(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let bead = state.store.get(id).await?;
    Ok(Json(bead))
}

/// PATCH /api/v1/beads/{id} -- partial update.
///
/// Rejects dependency cycles with 400; the graph is left untouched.
pub(crate) async fn update_bead(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBeadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bead = state.store.update(id, req.into()).await?;
    Ok(Json(bead))
}

/// POST /api/v1/beads/{id}/claim -- atomic claim.
///
/// Exactly one of two concurrent claims succeeds; the loser gets 409.
pub(crate) async fn claim_bead(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bead = state.coordinator.claim(id, req.agent_id).await?;
    Ok(Json(bead))
}

/// POST /api/v1/beads/{id}/redispatch -- operator action.
pub(crate) async fn redispatch_bead(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RedispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let bead = state.coordinator.redispatch(id, req.reason).await?;
    Ok(Json(bead))
}

/// POST /api/v1/beads/{id}/escalate -- escalate into a decision.
pub(crate) async fn escalate_bead(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<EscalateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = state
        .coordinator
        .escalate(id, req.reason, req.options)
        .await?;
    Ok((StatusCode::CREATED, Json(decision)))
}

/// GET /api/v1/beads/{id}/conversation -- transcript joined by bead id.
pub(crate) async fn bead_conversation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 distinguishes a missing bead from a bead with no transcript yet.
    state.store.get(id).await?;
    let session = state.conversations.get_by_bead(id).await?;
    Ok(Json(session))
}
