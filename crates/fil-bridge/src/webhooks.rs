//! Webhook router: normalizes external forge events onto the bus.
//!
//! When a per-source secret is configured, the request body is verified
//! with HMAC-SHA256 (`X-Hub-Signature-256: sha256=<hex>`, constant-time
//! comparison). Normalized events publish as `external.<source>.<event>`;
//! a `pr_opened` event optionally files a pr-review bead.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use ring::hmac;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use fil_bus::topics;
use fil_core::types::{BeadType, BusEvent};
use fil_store::NewBead;

use crate::api_error::ApiError;
use crate::http_api::ApiState;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}

/// Verify `sha256=<hex>` over the raw body in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Some(given) = hex_decode(hex_digest) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let expected = hmac::sign(&key, body);
    expected.as_ref().ct_eq(&given).into()
}

// ---------------------------------------------------------------------------
// Event normalization
// ---------------------------------------------------------------------------

/// Map a source-specific shape to a canonical event name.
///
/// GitHub-style payloads use the `X-GitHub-Event` header plus the payload
/// `action`; everything else is expected to carry an `event` field.
fn normalize_event(source: &str, headers: &HeaderMap, payload: &serde_json::Value) -> String {
    if source == "github" {
        let kind = headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        let action = payload.get("action").and_then(|v| v.as_str());
        return match (kind, action) {
            ("pull_request", Some("opened")) => "pr_opened".to_string(),
            ("pull_request", Some("closed")) => "pr_closed".to_string(),
            ("pull_request", Some(other)) => format!("pr_{other}"),
            ("issues", Some(action)) => format!("issue_{action}"),
            ("push", _) => "push".to_string(),
            (kind, _) => kind.to_string(),
        };
    }
    payload
        .get("event")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

fn pr_identifier(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("pull_request")
        .and_then(|pr| pr.get("number"))
        .or_else(|| payload.get("pr_number"))
        .and_then(|n| n.as_u64())
        .map(|n| n.to_string())
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// POST /api/v1/webhooks/{source}
pub(crate) async fn handle_webhook(
    State(state): State<Arc<ApiState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(secret) = state.config.webhooks.secrets.get(&source) {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing webhook signature"))?;
        if !verify_signature(secret, &body, signature) {
            tracing::warn!(source = %source, "webhook signature verification failed");
            return Err(ApiError::forbidden("bad webhook signature"));
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("bad webhook payload: {e}")))?;

    let event_name = normalize_event(&source, &headers, &payload);
    let event_type = format!("{}{source}.{event_name}", topics::EXTERNAL_PREFIX);
    let project_id = payload
        .get("project_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Uuid>().ok());

    let mut event = BusEvent::new(event_type.clone(), format!("webhook:{source}"));
    if let Some(project_id) = project_id {
        event.project_id = Some(project_id);
    }
    if let Some(object) = payload.as_object() {
        event.data = object.clone();
    }
    state.bus.publish(event);

    // Optional effect: file a review bead for freshly opened PRs.
    let mut created_bead = None;
    if event_name == "pr_opened" && state.config.webhooks.create_review_beads {
        match project_id {
            Some(project_id) => {
                let pr = pr_identifier(&payload).unwrap_or_else(|| "unknown".to_string());
                let mut new = NewBead::new(
                    format!("Review PR #{pr}"),
                    BeadType::PrReview,
                    project_id,
                );
                new.priority = 1;
                new.context.insert("pr".into(), pr);
                new.context.insert("source".into(), source.clone());
                match state.store.create(new).await {
                    Ok(bead) => created_bead = Some(bead.id),
                    Err(e) => {
                        // Best-effort: the normalized event already went out.
                        tracing::warn!(source = %source, error = %e, "pr-review bead creation failed");
                    }
                }
            }
            None => {
                tracing::debug!(source = %source, "pr_opened without project_id, no review bead");
            }
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "event_type": event_type,
            "created_bead": created_bead,
        })),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let tag = hmac::sign(&key, body);
        let hex: String = tag.as_ref().iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256={hex}")
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"event":"pr_opened"}"#;
        let header = sign("s3cret", body);
        assert!(verify_signature("s3cret", body, &header));
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"event":"pr_opened"}"#;
        let header = sign("s3cret", body);
        assert!(!verify_signature("other", body, &header));
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign("s3cret", br#"{"event":"pr_opened"}"#);
        assert!(!verify_signature("s3cret", br#"{"event":"pr_closed"}"#, &header));
    }

    #[test]
    fn malformed_header_fails() {
        assert!(!verify_signature("s", b"x", "sha1=abcd"));
        assert!(!verify_signature("s", b"x", "sha256=zz"));
        assert!(!verify_signature("s", b"x", "sha256=abc"));
    }

    #[test]
    fn github_pull_request_normalizes() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "pull_request".parse().unwrap());
        let payload = serde_json::json!({"action": "opened", "pull_request": {"number": 7}});
        assert_eq!(normalize_event("github", &headers, &payload), "pr_opened");
        assert_eq!(pr_identifier(&payload).as_deref(), Some("7"));
    }

    #[test]
    fn generic_source_uses_event_field() {
        let headers = HeaderMap::new();
        let payload = serde_json::json!({"event": "deploy_finished"});
        assert_eq!(
            normalize_event("buildkite", &headers, &payload),
            "deploy_finished"
        );
        assert_eq!(
            normalize_event("buildkite", &headers, &serde_json::json!({})),
            "unknown"
        );
    }
}
