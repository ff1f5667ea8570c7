//! Deployment documents and the status machine they move through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a deployment.
///
/// Transitions only move along the edges enforced by the engine's
/// compare-and-set updates; the only back-edge is terminal -> `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Validating,
    SelectingGpu,
    CreatingEndpoint,
    DownloadingModel,
    LoadingModel,
    Ready,
    Failed,
    WebhookFailed,
    Deleted,
    Timeout,
}

impl DeploymentStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [DeploymentStatus; 10] = [
        DeploymentStatus::Validating,
        DeploymentStatus::SelectingGpu,
        DeploymentStatus::CreatingEndpoint,
        DeploymentStatus::DownloadingModel,
        DeploymentStatus::LoadingModel,
        DeploymentStatus::Ready,
        DeploymentStatus::Failed,
        DeploymentStatus::WebhookFailed,
        DeploymentStatus::Deleted,
        DeploymentStatus::Timeout,
    ];

    /// Statuses in which the engine is waiting for the worker container.
    /// Both readiness paths (inbound callback, outbound poll) CAS from this
    /// set, which is what makes duplicate triggers no-ops.
    pub const WAITING: [DeploymentStatus; 3] = [
        DeploymentStatus::CreatingEndpoint,
        DeploymentStatus::DownloadingModel,
        DeploymentStatus::LoadingModel,
    ];

    /// No further transitions happen from these states except delete.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Ready
                | DeploymentStatus::Failed
                | DeploymentStatus::WebhookFailed
                | DeploymentStatus::Deleted
                | DeploymentStatus::Timeout
        )
    }

    pub fn is_waiting_for_worker(self) -> bool {
        Self::WAITING.contains(&self)
    }

    /// Wire name (snake_case), matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Validating => "validating",
            DeploymentStatus::SelectingGpu => "selecting_gpu",
            DeploymentStatus::CreatingEndpoint => "creating_endpoint",
            DeploymentStatus::DownloadingModel => "downloading_model",
            DeploymentStatus::LoadingModel => "loading_model",
            DeploymentStatus::Ready => "ready",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::WebhookFailed => "webhook_failed",
            DeploymentStatus::Deleted => "deleted",
            DeploymentStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<DeploymentStatus> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the worker fetches model weights from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// Weights pulled fresh from the Hub on every cold start.
    #[default]
    Off,
    /// Platform-managed object store cache.
    Shared,
    /// Caller-owned S3-compatible storage.
    Private,
}

/// Caller-supplied S3 credentials for `CacheScope::Private`.
///
/// Never persisted: these live in the engine task for the lifetime of the
/// deployment run and are injected into the worker environment.
#[derive(Debug, Clone)]
pub struct S3CacheCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    pub model_url: String,
}

/// Terminal error recorded on a deployment document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentError {
    pub kind: String,
    pub message: String,
}

/// One endpoint-creation attempt, kept for capacity-fallback audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attempt {
    pub tier_id: String,
    pub failure_reason: String,
}

/// Severity of an appended log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Append-only audit log entry, parented by deployment id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// The central entity: one caller request to run one model on a rented GPU.
///
/// Raw provider keys and HF tokens are never stored here, only the
/// `owner_hash` digest that proves ownership on later reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    /// SHA-256 hex digest of the caller's provider key.
    pub owner_hash: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_tier: Option<String>,
    /// Display name of the allocated GPU (e.g. "NVIDIA A40").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_allocated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_vram_gb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    pub webhook_url: String,
    #[serde(default)]
    pub cache_scope: CacheScope,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeploymentError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
}

impl Deployment {
    /// Fresh document in the initial `Validating` state.
    pub fn new(
        id: String,
        owner_hash: String,
        model_id: String,
        webhook_url: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner_hash,
            model_id,
            provider_hint: None,
            model_name_alias: None,
            requested_tier: None,
            resolved_tier: None,
            gpu_allocated: None,
            min_vram_gb: None,
            endpoint_id: None,
            endpoint_url: None,
            webhook_url,
            cache_scope: CacheScope::Off,
            status: DeploymentStatus::Validating,
            error: None,
            created_at: now,
            updated_at: now,
            ready_at: None,
            attempts: Vec::new(),
        }
    }
}

/// Generate a deployment id: `dep_<year>_<8 hex chars>`.
pub fn generate_deployment_id(now: DateTime<Utc>) -> String {
    use chrono::Datelike;
    use rand::Rng;

    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
            .collect()
    };
    format!("dep_{}_{}", now.year(), suffix)
}

/// SHA-256 hex digest of a provider key, used as stateless ownership proof.
pub fn owner_hash(provider_key: &str) -> String {
    use sha2::{Digest, Sha256};
    use std::fmt::Write;

    let digest = Sha256::digest(provider_key.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
