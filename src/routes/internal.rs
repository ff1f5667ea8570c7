//! Worker callback: the inbound readiness path.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;
use crate::entities::DeploymentStatus;
use crate::error::VisgateError;

/// Optional callback body. Defaults to `{"status": "ready"}`.
#[derive(Debug, Deserialize)]
pub struct ReadyPayload {
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for ReadyPayload {
    fn default() -> Self {
        Self {
            status: default_status(),
            message: None,
            endpoint_url: None,
        }
    }
}

fn default_status() -> String {
    "ready".to_string()
}

/// `POST /internal/deployment-ready/{id}`.
///
/// Unauthenticated except for the optional shared-secret header. Always 200
/// when the CAS loses: a duplicate or stale callback is not an error.
pub async fn deployment_ready(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<Value>, VisgateError> {
    let secret = &state.engine.settings().internal_webhook_secret;
    if !secret.is_empty() {
        let provided = headers
            .get("x-internal-secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if provided != secret {
            warn!(deployment_id = %id, "Worker callback with bad internal secret");
            return Err(VisgateError::Unauthorized);
        }
    }

    // The worker may POST with no body at all; default to a ready signal.
    let payload: ReadyPayload = if body.is_empty() {
        ReadyPayload::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| VisgateError::Validation(format!("Bad callback payload: {e}")))?
    };

    let webhook_delivered = match payload.status.as_str() {
        "ready" => state
            .engine
            .mark_ready(&id, payload.endpoint_url.clone())
            .await
            .unwrap_or_else(|e| {
                warn!(deployment_id = %id, error = %e, "Ready callback failed");
                false
            }),
        "downloading_model" => {
            state
                .engine
                .record_worker_phase(
                    &id,
                    DeploymentStatus::DownloadingModel,
                    payload.message.as_deref(),
                )
                .await;
            false
        }
        "loading_model" => {
            state
                .engine
                .record_worker_phase(
                    &id,
                    DeploymentStatus::LoadingModel,
                    payload.message.as_deref(),
                )
                .await;
            false
        }
        "failed" => {
            let message = payload
                .message
                .as_deref()
                .unwrap_or("Worker reported failure");
            state.engine.fail_from_worker(&id, message).await;
            false
        }
        other => {
            return Err(VisgateError::Validation(format!(
                "Unknown worker status: {other}"
            )))
        }
    };

    Ok(Json(json!({
        "deployment_id": id,
        "status": payload.status,
        "webhook_delivered": webhook_delivered,
    })))
}
