//! GPU provider abstraction.
//!
//! The engine talks to a [`GpuProvider`] trait object; the RunPod adapter is
//! the production implementation and tests substitute their own. Errors are
//! classified two ways (capacity vs everything else) because only capacity
//! errors may drive tier fallback.

mod runpod;

pub use runpod::RunpodProvider;

use async_trait::async_trait;
use std::collections::BTreeMap;

/// Provider-side failure, pre-classified for the fallback loop.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No GPUs of the requested tier are currently available.
    #[error("no capacity for tier {tier_id}: {message}")]
    Capacity { tier_id: String, message: String },

    /// Any other provider failure (auth, validation, 5xx, malformed reply).
    #[error("provider API error: {message}")]
    Api { message: String },
}

impl ProviderError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, ProviderError::Capacity { .. })
    }
}

/// Request to create one serverless endpoint.
#[derive(Debug, Clone)]
pub struct CreateEndpointRequest {
    /// Deterministic name (`visgate-<id>`) for later discovery.
    pub name: String,
    pub image: String,
    pub template_id: String,
    pub gpu_tier_id: String,
    /// Worker environment; ordered so request bodies are deterministic.
    pub env: BTreeMap<String, String>,
    pub workers_min: u32,
    pub workers_max: u32,
    pub idle_timeout_seconds: u32,
    pub scaler_type: String,
    pub scaler_value: u32,
}

/// A created endpoint.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    pub endpoint_id: String,
    pub url: String,
}

/// Point-in-time view of an endpoint used by the readiness poller.
#[derive(Debug, Clone, Default)]
pub struct EndpointStatus {
    pub created: bool,
    pub workers_ready: u32,
    pub last_error: Option<String>,
}

/// Summary row from `list_endpoints`.
#[derive(Debug, Clone)]
pub struct EndpointSummary {
    pub endpoint_id: String,
    pub name: String,
    pub gpu_tier_id: String,
}

/// Serverless GPU platform operations the engine depends on.
///
/// The API key is passed per call: keys are caller-supplied and
/// request-scoped, never stored by the gateway.
#[async_trait]
pub trait GpuProvider: Send + Sync {
    async fn create_endpoint(
        &self,
        api_key: &str,
        request: &CreateEndpointRequest,
    ) -> Result<EndpointHandle, ProviderError>;

    async fn delete_endpoint(&self, api_key: &str, endpoint_id: &str) -> Result<(), ProviderError>;

    async fn list_endpoints(&self, api_key: &str) -> Result<Vec<EndpointSummary>, ProviderError>;

    async fn get_endpoint_status(
        &self,
        api_key: &str,
        endpoint_id: &str,
    ) -> Result<EndpointStatus, ProviderError>;
}

/// Classify a provider error message: capacity phrasings drive fallback,
/// everything else is terminal for the deployment.
pub(crate) fn classify_message(tier_id: &str, message: &str) -> ProviderError {
    let lower = message.to_ascii_lowercase();
    let capacity = [
        "no gpu",
        "no instances",
        "not available",
        "unavailable",
        "capacity",
        "out of stock",
        "no longer any instances",
    ]
    .iter()
    .any(|needle| lower.contains(needle));

    if capacity {
        ProviderError::Capacity {
            tier_id: tier_id.to_string(),
            message: message.to_string(),
        }
    } else {
        ProviderError::Api {
            message: message.to_string(),
        }
    }
}
