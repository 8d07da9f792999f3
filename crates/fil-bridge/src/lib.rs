//! HTTP bridge for filament.
//!
//! Exposes the control plane under `/api/v1`: bead CRUD and claims, file
//! locks, decisions, motivations, the work graph, chat completion proxying,
//! server-sent event fan-out, webhooks and health probes.

pub mod api_error;
pub mod http_api;
pub mod webhooks;

pub use api_error::ApiError;
pub use http_api::{api_router, ApiState};
