// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP surface: signed unlock webhooks and an aggregate health endpoint.
//!
//! | Route                     | Outcome                                                   |
//! |---------------------------|-----------------------------------------------------------|
//! | `POST /webhook/{provider}` | 200 unlocked / ignored, 400 bad body, 401 bad signature, 404 unmapped, 500 unlock failed |
//! | `GET /health`             | 200 unless overall health is Unhealthy (503)              |

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::verifier::{SignatureError, WebhookVerifier};
use crate::bridge::{BridgeCore, HealthReport, UnlockError, UnlockSource, UnlockedDoor};
use crate::health::HealthStatus;

/// Events that request an unlock. Everything else is acknowledged and ignored.
const UNLOCK_EVENTS: [&str; 2] = ["door.unlock", "lock.unlock"];

/// What the router needs from the bridge.
#[async_trait]
pub trait WebhookBackend: Send + Sync {
    async fn unlock(&self, lock_id: &str, user: Option<&str>) -> Result<UnlockedDoor, UnlockError>;

    fn health_report(&self) -> HealthReport;
}

#[async_trait]
impl WebhookBackend for BridgeCore {
    async fn unlock(&self, lock_id: &str, user: Option<&str>) -> Result<UnlockedDoor, UnlockError> {
        BridgeCore::unlock(self, lock_id, UnlockSource::Webhook, user).await
    }

    fn health_report(&self) -> HealthReport {
        BridgeCore::health_report(self)
    }
}

#[derive(Clone)]
struct WebhookState {
    backend: Arc<dyn WebhookBackend>,
    verifier: Arc<WebhookVerifier>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload {
    event: String,
    #[serde(default)]
    lock: Option<LockRef>,
    #[serde(default)]
    lock_id: Option<String>,
    #[serde(default)]
    user: Option<UserRef>,
    #[serde(default)]
    user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LockRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UserRef {
    #[serde(default)]
    name: Option<String>,
}

impl WebhookPayload {
    fn lock_id(&self) -> Option<&str> {
        self.lock
            .as_ref()
            .map(|l| l.id.as_str())
            .or(self.lock_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn user_name(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|u| u.name.as_deref())
            .or(self.user_name.as_deref())
    }
}

/// Webhook failures, rendered as structured JSON.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("invalid provider '{0}'")]
    InvalidProvider(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Unauthorized(#[from] SignatureError),
    #[error(transparent)]
    Unlock(#[from] UnlockError),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            WebhookError::InvalidProvider(_) => (StatusCode::BAD_REQUEST, "invalid_provider"),
            WebhookError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            WebhookError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            WebhookError::Unlock(UnlockError::NotMapped(_)) => (StatusCode::NOT_FOUND, "not_mapped"),
            WebhookError::Unlock(UnlockError::Disabled(_)) => (StatusCode::NOT_FOUND, "mapping_disabled"),
            WebhookError::Unlock(UnlockError::CircuitOpen) => (StatusCode::INTERNAL_SERVER_ERROR, "circuit_open"),
            WebhookError::Unlock(UnlockError::Failed(_)) => (StatusCode::INTERNAL_SERVER_ERROR, "unlock_failed"),
        };

        let body = ErrorResponse {
            success: false,
            error: error_type.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        (status, Json(body)).into_response()
    }
}

/// Build the webhook router around `backend`.
pub fn router(backend: Arc<dyn WebhookBackend>, verifier: Arc<WebhookVerifier>) -> Router {
    Router::new()
        .route("/webhook/{provider}", post(handle_webhook))
        .route("/health", get(handle_health))
        .with_state(WebhookState { backend, verifier })
}

fn valid_provider(provider: &str) -> bool {
    !provider.is_empty()
        && provider.len() <= 64
        && provider.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, WebhookError> {
    if !valid_provider(&provider) {
        crate::metrics::record_webhook("invalid", "bad_provider");
        return Err(WebhookError::InvalidProvider(provider));
    }
    let provider = provider.to_ascii_lowercase();

    let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!(provider = %provider, error = %e, "Rejected malformed webhook");
        crate::metrics::record_webhook(&provider, "bad_payload");
        WebhookError::InvalidPayload(e.to_string())
    })?;

    if !UNLOCK_EVENTS.contains(&payload.event.as_str()) {
        debug!(provider = %provider, event = %payload.event, "Webhook event ignored");
        crate::metrics::record_webhook(&provider, "ignored");
        return Ok(Json(json!({ "success": true, "ignored": true, "event": payload.event })));
    }

    let header = format!("x-{}-signature", provider);
    let signature = headers.get(header.as_str()).and_then(|v| v.to_str().ok());
    state.verifier.verify(&body, signature).map_err(|e| {
        warn!(provider = %provider, reason = %e, "Rejected webhook with bad signature");
        crate::metrics::record_webhook(&provider, "unauthorized");
        WebhookError::Unauthorized(e)
    })?;

    let lock_id = payload
        .lock_id()
        .ok_or_else(|| WebhookError::InvalidPayload("missing lock id".into()))?;

    match state.backend.unlock(lock_id, payload.user_name()).await {
        Ok(door) => {
            info!(provider = %provider, lock = %lock_id, door = %door.door_id, "Webhook unlock complete");
            crate::metrics::record_webhook(&provider, "unlocked");
            Ok(Json(json!({
                "success": true,
                "doorName": door.door_name,
                "doorId": door.door_id,
            })))
        }
        Err(e) => {
            let outcome = if e.is_unroutable() { "not_mapped" } else { "failed" };
            crate::metrics::record_webhook(&provider, outcome);
            Err(e.into())
        }
    }
}

async fn handle_health(State(state): State<WebhookState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.backend.health_report();
    let status = if report.overall == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<S>(listener: tokio::net::TcpListener, router: Router, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Webhook server listening");
    }
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
    info!("Webhook server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_accepts_both_lock_shapes() {
        let nested: WebhookPayload =
            serde_json::from_value(json!({"event": "door.unlock", "lock": {"id": "L1"}, "user": {"name": "ann"}})).unwrap();
        assert_eq!(nested.lock_id(), Some("L1"));
        assert_eq!(nested.user_name(), Some("ann"));

        let flat: WebhookPayload =
            serde_json::from_value(json!({"event": "lock.unlock", "lockId": "L2", "userName": "bob"})).unwrap();
        assert_eq!(flat.lock_id(), Some("L2"));
        assert_eq!(flat.user_name(), Some("bob"));
    }

    #[test]
    fn test_provider_validation() {
        assert!(valid_provider("acme"));
        assert!(valid_provider("acme-cloud_2"));
        assert!(!valid_provider(""));
        assert!(!valid_provider("acme cloud"));
        assert!(!valid_provider("a\nb"));
    }

    #[test]
    fn test_error_status_codes() {
        let status = |e: WebhookError| e.into_response().status();

        assert_eq!(status(SignatureError::Missing.into()), StatusCode::UNAUTHORIZED);
        assert_eq!(status(UnlockError::NotMapped("L9".into()).into()), StatusCode::NOT_FOUND);
        assert_eq!(status(UnlockError::CircuitOpen.into()), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(WebhookError::InvalidPayload("x".into())), StatusCode::BAD_REQUEST);
    }
}
