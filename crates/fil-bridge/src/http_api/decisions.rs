use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use fil_core::types::DecisionStatus;

use super::state::ApiState;
use super::types::DecideRequest;
use crate::api_error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DecisionQuery {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<DecisionStatus>,
}

/// GET /api/v1/decisions
pub(crate) async fn list_decisions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DecisionQuery>,
) -> impl IntoResponse {
    Json(state.decisions.list(query.project_id, query.status).await)
}

/// GET /api/v1/decisions/{id}
pub(crate) async fn get_decision(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.decisions.get(id).await?))
}

/// POST /api/v1/decisions/{id}/decide -- resolve a decision.
///
/// Applies the chosen branch: the escalated bead reopens or terminates,
/// and the branch's follow-up bead (if any) is created.
pub(crate) async fn decide(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<DecideRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = state
        .coordinator
        .resolve_decision(id, req.decider_id, req.decision, req.rationale)
        .await?;
    Ok(Json(decision))
}
