use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::state::ApiState;
use super::types::SpawnAgentRequest;
use crate::api_error::ApiError;

/// GET /api/v1/agents
pub(crate) async fn list_agents(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.agents.list().await)
}

/// POST /api/v1/agents -- register a worker.
pub(crate) async fn spawn_agent(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SpawnAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Fail early on an unknown provider binding.
    state.registry.get(&req.provider_id)?;
    let (agent, _inbox) = state
        .agents
        .spawn(req.name, req.role, req.project_id, req.provider_id, req.persona)
        .await;
    if req.multi_project {
        state.agents.set_multi_project(agent.id, true).await?;
    }
    let agent = state.agents.get(agent.id).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// GET /api/v1/agents/{id}
pub(crate) async fn get_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.agents.get(id).await?))
}

/// POST /api/v1/agents/{id}/pause
pub(crate) async fn pause_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.agents.pause(id).await?;
    Ok(Json(state.agents.get(id).await?))
}

/// POST /api/v1/agents/{id}/resume
pub(crate) async fn resume_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.agents.resume(id).await?;
    Ok(Json(state.agents.get(id).await?))
}

/// POST /api/v1/agents/{id}/stop -- teardown: releases the agent's file
/// locks and redispatches any in-flight bead.
pub(crate) async fn stop_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.agents.stop(id).await?;
    Ok(Json(state.agents.get(id).await?))
}

/// POST /api/v1/agents/{id}/wake -- nudge the agent's inbox.
pub(crate) async fn wake_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .agents
        .send_signal(id, fil_agents::AgentSignal::Wake)?;
    Ok(StatusCode::ACCEPTED)
}
