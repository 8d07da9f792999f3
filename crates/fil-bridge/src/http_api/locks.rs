use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::state::ApiState;
use super::types::{CreateLockRequest, LockQuery, ReleaseLockQuery};
use crate::api_error::ApiError;

/// GET /api/v1/file-locks
pub(crate) async fn list_locks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LockQuery>,
) -> impl IntoResponse {
    Json(state.locks.list(query.project_id))
}

/// POST /api/v1/file-locks -- acquire, 201 on success, 409 when another
/// agent holds the canonical path.
pub(crate) async fn acquire_lock(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateLockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let lock = state
        .locks
        .acquire(req.project_id, &req.file_path, req.agent_id, req.bead_id)?;
    Ok((StatusCode::CREATED, Json(lock)))
}

/// DELETE /api/v1/file-locks/{project}/{path}?agent_id= -- release, 204.
pub(crate) async fn release_lock(
    State(state): State<Arc<ApiState>>,
    Path((project_id, path)): Path<(Uuid, String)>,
    Query(query): Query<ReleaseLockQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.locks.release(project_id, &path, query.agent_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/agents/{id}/file-locks -- teardown sweep.
pub(crate) async fn release_agent_locks(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<Uuid>,
) -> impl IntoResponse {
    let released = state.locks.release_by_agent(agent_id);
    Json(serde_json::json!({ "released": released }))
}
