//! HTTP API error translation.
//!
//! Component errors carry a taxonomy kind ([`ErrorKind`]); this module maps
//! kinds to transport status codes and renders a consistent
//! `{"error": ...}` body. Inside a streaming response, post-header errors
//! are delivered as `event: error` frames instead (see `http_api::chat`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use fil_agents::SessionError;
use fil_core::error::{Categorized, ErrorKind, StoreError};
use fil_harness::ProviderError;

/// Boundary error: a taxonomy kind plus a human-readable message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        let kind = match &err {
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::Unsupported(_) | ProviderError::NotConfigured(_) => {
                ErrorKind::InvalidArgument
            }
            ProviderError::Api { status, .. } if *status < 500 => ErrorKind::InvalidArgument,
            ProviderError::Http(_)
            | ProviderError::Api { .. }
            | ProviderError::RateLimited { .. }
            | ProviderError::Timeout => ErrorKind::Unavailable,
            ProviderError::Parse(_) | ProviderError::Stream(_) => ErrorKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Store(e) => e.into(),
            SessionError::Provider(e) => e.into(),
            SessionError::AgentUnavailable(id) => {
                ApiError::new(ErrorKind::Conflict, format!("agent {id} is not available"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.message, "internal error surfaced to client");
        }
        (status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn store_errors_map_by_kind() {
        let id = Uuid::new_v4();
        let api: ApiError = StoreError::BeadNotFound(id).into();
        assert_eq!(api.status(), StatusCode::NOT_FOUND);

        let api: ApiError = StoreError::AlreadyClaimed(id).into();
        assert_eq!(api.status(), StatusCode::CONFLICT);

        let api: ApiError = StoreError::DependencyCycle(id).into();
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn provider_errors_split_by_class() {
        let api: ApiError = ProviderError::Timeout.into();
        assert_eq!(api.status(), StatusCode::SERVICE_UNAVAILABLE);

        let api: ApiError = ProviderError::Api {
            status: 400,
            message: "bad".into(),
        }
        .into();
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);

        let api: ApiError = ProviderError::Api {
            status: 502,
            message: "bad gateway".into(),
        }
        .into();
        assert_eq!(api.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn response_body_carries_error_field() {
        let response = ApiError::not_found("bead not found").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("\"error\""));
        assert!(text.contains("bead not found"));
    }
}
