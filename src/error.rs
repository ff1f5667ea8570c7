//! Error taxonomy shared across the engine and the HTTP surface.
//!
//! Every failure a caller can observe maps to one variant here; the route
//! layer converts variants to `{"error": kind, "message": ..., "details"}`
//! JSON bodies. `ProviderCapacity` is internal only: the engine consumes it
//! to drive cost-ordered fallback and it never crosses the HTTP boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum VisgateError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid or missing provider API key")]
    Unauthorized,

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("Hugging Face model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("Model {model_id} is gated; supply a Hugging Face token with accepted access")]
    ModelGated { model_id: String },

    #[error("Access denied for model {model_id}; the supplied token cannot read it")]
    ModelAccessDenied { model_id: String },

    #[error("Hugging Face Hub unreachable: {0}")]
    ModelRegistryUnreachable(String),

    #[error("Cannot size model {model_id}: not registered and no parameter metadata")]
    UnsupportedModel { model_id: String },

    #[error("Requested GPU tier {requested} has insufficient VRAM (required >= {required_vram_gb} GB)")]
    UnsupportedGpu {
        requested: String,
        required_vram_gb: u32,
    },

    #[error("No GPU tier with sufficient VRAM (required >= {required_vram_gb} GB)")]
    InsufficientGpu { required_vram_gb: u32 },

    /// Provider has no capacity for the tier. Drives fallback; never surfaced.
    #[error("No capacity for GPU tier {tier_id}: {message}")]
    ProviderCapacity { tier_id: String, message: String },

    #[error("Provider API error: {message}")]
    Provider { message: String },

    #[error("Deployment timed out during {phase}")]
    Timeout { phase: String },

    #[error("Webhook delivery failed after retries: {url}")]
    WebhookDelivery { url: String },

    #[error("Rate limit exceeded. Try again later.")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Store error: {0}")]
    Store(String),
}

impl VisgateError {
    /// Stable error kind string exposed in HTTP bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VisgateError::Validation(_) => "ValidationError",
            VisgateError::Unauthorized => "UnauthorizedError",
            VisgateError::DeploymentNotFound(_) => "DeploymentNotFoundError",
            VisgateError::ModelNotFound { .. } => "ModelNotFoundError",
            VisgateError::ModelGated { .. } => "ModelGatedError",
            VisgateError::ModelAccessDenied { .. } => "ModelAccessDeniedError",
            VisgateError::ModelRegistryUnreachable(_) => "ModelRegistryUnreachableError",
            VisgateError::UnsupportedModel { .. } => "UnsupportedModelError",
            VisgateError::UnsupportedGpu { .. } => "UnsupportedGPUError",
            VisgateError::InsufficientGpu { .. } => "InsufficientGPUError",
            VisgateError::ProviderCapacity { .. } => "ProviderCapacityError",
            VisgateError::Provider { .. } => "ProviderError",
            VisgateError::Timeout { .. } => "TimeoutError",
            VisgateError::WebhookDelivery { .. } => "WebhookDeliveryError",
            VisgateError::RateLimited { .. } => "RateLimitError",
            VisgateError::Store(_) => "StoreError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VisgateError::Validation(_)
            | VisgateError::ModelNotFound { .. }
            | VisgateError::ModelGated { .. }
            | VisgateError::ModelAccessDenied { .. }
            | VisgateError::UnsupportedModel { .. }
            | VisgateError::UnsupportedGpu { .. } => StatusCode::BAD_REQUEST,
            VisgateError::Unauthorized => StatusCode::UNAUTHORIZED,
            VisgateError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
            VisgateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            VisgateError::InsufficientGpu { .. } => StatusCode::SERVICE_UNAVAILABLE,
            VisgateError::ModelRegistryUnreachable(_)
            | VisgateError::Provider { .. }
            | VisgateError::ProviderCapacity { .. }
            | VisgateError::WebhookDelivery { .. } => StatusCode::BAD_GATEWAY,
            VisgateError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            VisgateError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured details for the HTTP error body. Never contains secrets.
    fn details(&self) -> serde_json::Value {
        match self {
            VisgateError::DeploymentNotFound(id) => json!({ "deployment_id": id }),
            VisgateError::ModelNotFound { model_id }
            | VisgateError::ModelGated { model_id }
            | VisgateError::ModelAccessDenied { model_id }
            | VisgateError::UnsupportedModel { model_id } => json!({ "hf_model_id": model_id }),
            VisgateError::UnsupportedGpu {
                requested,
                required_vram_gb,
            } => json!({ "requested_tier": requested, "required_vram_gb": required_vram_gb }),
            VisgateError::InsufficientGpu { required_vram_gb } => {
                json!({ "required_vram_gb": required_vram_gb })
            }
            VisgateError::Timeout { phase } => json!({ "phase": phase }),
            VisgateError::WebhookDelivery { url } => json!({ "webhook_url": url }),
            VisgateError::RateLimited {
                retry_after_seconds,
            } => json!({ "retry_after_seconds": retry_after_seconds }),
            _ => json!({}),
        }
    }

    /// Whether the engine should retry rather than fail the deployment.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VisgateError::ModelRegistryUnreachable(_) | VisgateError::ProviderCapacity { .. }
        )
    }
}

impl IntoResponse for VisgateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "details": self.details(),
        });

        let mut response = (status, Json(body)).into_response();
        if let VisgateError::RateLimited {
            retry_after_seconds,
        } = self
        {
            if let Ok(value) = retry_after_seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
