// ---------------------------------------------------------------------------
// HTTP API module directory
// ---------------------------------------------------------------------------
//
// Domain-oriented handler modules wired together by the router below.
// Everything is versioned under `/api/v1`.

mod agents;
mod beads;
mod chat;
mod decisions;
mod events;
mod locks;
mod misc;
mod motivations;
mod projects;
pub mod state;
pub mod types;

pub use state::ApiState;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::webhooks;

/// Build the full `/api/v1` router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let v1 = Router::new()
        // ---- beads --------------------------------------------------------
        .route("/beads", get(beads::list_beads).post(beads::create_bead))
        .route("/beads/{id}", get(beads::get_bead).patch(beads::update_bead))
        .route("/beads/{id}/claim", post(beads::claim_bead))
        .route("/beads/{id}/redispatch", post(beads::redispatch_bead))
        .route("/beads/{id}/escalate", post(beads::escalate_bead))
        .route("/beads/{id}/conversation", get(beads::bead_conversation))
        // ---- projects -----------------------------------------------------
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route("/projects/{id}", get(projects::get_project))
        .route("/projects/{id}/status", post(projects::set_project_status))
        .route("/projects/{id}/comments", post(projects::add_comment))
        // ---- decisions ----------------------------------------------------
        .route("/decisions", get(decisions::list_decisions))
        .route("/decisions/{id}", get(decisions::get_decision))
        .route("/decisions/{id}/decide", post(decisions::decide))
        // ---- file locks ---------------------------------------------------
        .route(
            "/file-locks",
            get(locks::list_locks).post(locks::acquire_lock),
        )
        .route("/file-locks/{project}/{*path}", delete(locks::release_lock))
        // ---- agents -------------------------------------------------------
        .route("/agents", get(agents::list_agents).post(agents::spawn_agent))
        .route("/agents/{id}", get(agents::get_agent))
        .route("/agents/{id}/pause", post(agents::pause_agent))
        .route("/agents/{id}/resume", post(agents::resume_agent))
        .route("/agents/{id}/stop", post(agents::stop_agent))
        .route("/agents/{id}/wake", post(agents::wake_agent))
        .route(
            "/agents/{id}/file-locks",
            delete(locks::release_agent_locks),
        )
        // ---- motivations --------------------------------------------------
        .route(
            "/motivations",
            get(motivations::list_rules).post(motivations::create_rule),
        )
        .route("/motivations/history", get(motivations::rule_history))
        .route(
            "/motivations/{id}",
            get(motivations::get_rule)
                .patch(motivations::update_rule)
                .delete(motivations::delete_rule),
        )
        .route("/motivations/{id}/enable", post(motivations::enable_rule))
        .route("/motivations/{id}/disable", post(motivations::disable_rule))
        .route("/motivations/{id}/trigger", post(motivations::trigger_rule))
        // ---- events -------------------------------------------------------
        .route("/events/stream", get(events::event_stream))
        .route("/events/recent", get(events::recent_events))
        .route("/events/subscribers", get(events::subscriber_count))
        // ---- chat proxy ---------------------------------------------------
        .route("/chat/completions", post(chat::completions))
        .route("/chat/completions/stream", post(chat::completions_stream))
        // ---- webhooks -----------------------------------------------------
        .route("/webhooks/{source}", post(webhooks::handle_webhook))
        // ---- graph / dispatcher / logs / admin ----------------------------
        .route("/work-graph", get(misc::work_graph))
        .route("/dispatcher", get(misc::dispatcher_status))
        .route("/dispatcher/pause", post(misc::dispatcher_pause))
        .route("/dispatcher/resume", post(misc::dispatcher_resume))
        .route("/logs", get(misc::query_logs))
        .route("/export", get(misc::export))
        .route("/import", post(misc::import))
        // ---- health -------------------------------------------------------
        .route("/health", get(misc::health))
        .route("/health/live", get(misc::health_live))
        .route("/health/ready", get(misc::health_ready));

    Router::new()
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
