use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::state::ApiState;
use super::types::{CreateProjectRequest, ProjectCommentRequest, ProjectStatusRequest};
use crate::api_error::ApiError;

/// GET /api/v1/projects
pub(crate) async fn list_projects(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.store.list_projects().await)
}

/// POST /api/v1/projects
pub(crate) async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("project name must not be empty"));
    }
    let project = state.store.create_project(req.name).await;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/v1/projects/{id}
pub(crate) async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.get_project(id).await?))
}

/// POST /api/v1/projects/{id}/status
///
/// Closing a project with open beads requires an approving decision bead
/// (409 otherwise).
pub(crate) async fn set_project_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProjectStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .store
        .set_project_status(id, req.status, req.approved_by)
        .await?;
    Ok(Json(project))
}

/// POST /api/v1/projects/{id}/comments -- append-only.
pub(crate) async fn add_comment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProjectCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state.store.add_project_comment(id, req.author, req.body).await?;
    Ok((StatusCode::CREATED, Json(project)))
}
