use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use fil_agents::{NewRule, RuleFilter, RulePatch};

use super::state::ApiState;
use super::types::{CreateRuleRequest, HistoryQuery, RuleQuery, UpdateRuleRequest};
use crate::api_error::ApiError;

/// GET /api/v1/motivations
pub(crate) async fn list_rules(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RuleQuery>,
) -> impl IntoResponse {
    let filter = RuleFilter {
        rule_type: query.rule_type,
        enabled: query.enabled,
        project_id: query.project_id,
    };
    Json(state.motivation.list(&filter).await)
}

/// POST /api/v1/motivations
pub(crate) async fn create_rule(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateRuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("rule name must not be empty"));
    }
    let rule = state
        .motivation
        .register(NewRule {
            name: req.name,
            rule_type: req.rule_type,
            condition: req.condition,
            params: req.params,
            cooldown_secs: req.cooldown_secs,
            priority: req.priority,
            create_bead: req.create_bead,
            wake_agent: req.wake_agent,
            project_id: req.project_id,
        })
        .await;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// GET /api/v1/motivations/{id}
pub(crate) async fn get_rule(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.motivation.get(id).await?))
}

/// PATCH /api/v1/motivations/{id}
pub(crate) async fn update_rule(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state
        .motivation
        .update(
            id,
            RulePatch {
                name: req.name,
                condition: req.condition,
                params: req.params,
                cooldown_secs: req.cooldown_secs,
                priority: req.priority,
                create_bead: req.create_bead,
                wake_agent: req.wake_agent,
                enabled: req.enabled,
            },
        )
        .await?;
    Ok(Json(rule))
}

/// DELETE /api/v1/motivations/{id} -- built-in rules refuse with 400.
pub(crate) async fn delete_rule(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.motivation.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/motivations/{id}/enable
pub(crate) async fn enable_rule(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.motivation.set_enabled(id, true).await?;
    Ok(Json(state.motivation.get(id).await?))
}

/// POST /api/v1/motivations/{id}/disable
pub(crate) async fn disable_rule(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.motivation.set_enabled(id, false).await?;
    Ok(Json(state.motivation.get(id).await?))
}

/// POST /api/v1/motivations/{id}/trigger -- manual fire, bypasses cooldown.
pub(crate) async fn trigger_rule(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    // Validates existence before firing.
    state.motivation.get(id).await?;
    let record = state.motivation.fire(id, None).await;
    Ok(Json(record))
}

/// GET /api/v1/motivations/history
pub(crate) async fn rule_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(state.motivation.history(query.limit))
}
