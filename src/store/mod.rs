//! Persistence abstraction for deployment documents and audit logs.
//!
//! Two interchangeable implementations satisfy [`DeploymentStore`]: the
//! Redis-backed one for production and an in-memory one with identical
//! semantics for local development and tests. All status transitions go
//! through [`DeploymentStore::update`]'s compare-and-set, which is what
//! totally orders a deployment's lifecycle across tasks and processes.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{Attempt, Deployment, DeploymentError, DeploymentStatus, LogEntry, LogLevel};

/// Store-level failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("deployment already exists: {0}")]
    AlreadyExists(String),

    #[error("deployment not found: {0}")]
    NotFound(String),

    /// Compare-and-set observed a different current status. Carries the
    /// actual status so callers can decide whether the mismatch is benign.
    #[error("status conflict: current status is {actual}")]
    Conflict { actual: DeploymentStatus },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Partial update applied under compare-and-set. Unset fields are left
/// untouched; `push_attempt` appends to the audit list.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPatch {
    pub status: Option<DeploymentStatus>,
    pub min_vram_gb: Option<u32>,
    pub resolved_tier: Option<String>,
    pub gpu_allocated: Option<String>,
    pub endpoint_id: Option<String>,
    pub endpoint_url: Option<String>,
    pub error: Option<DeploymentError>,
    pub ready_at: Option<DateTime<Utc>>,
    pub push_attempt: Option<Attempt>,
}

impl DeploymentPatch {
    pub fn status(status: DeploymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.min_vram_gb.is_none()
            && self.resolved_tier.is_none()
            && self.gpu_allocated.is_none()
            && self.endpoint_id.is_none()
            && self.endpoint_url.is_none()
            && self.error.is_none()
            && self.ready_at.is_none()
            && self.push_attempt.is_none()
    }

    /// Apply to a document in place (shared by both store implementations).
    pub(crate) fn apply(&self, dep: &mut Deployment, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            dep.status = status;
        }
        if let Some(v) = self.min_vram_gb {
            dep.min_vram_gb = Some(v);
        }
        if let Some(ref v) = self.resolved_tier {
            dep.resolved_tier = Some(v.clone());
        }
        if let Some(ref v) = self.gpu_allocated {
            dep.gpu_allocated = Some(v.clone());
        }
        if let Some(ref v) = self.endpoint_id {
            dep.endpoint_id = Some(v.clone());
        }
        if let Some(ref v) = self.endpoint_url {
            dep.endpoint_url = Some(v.clone());
        }
        if let Some(ref v) = self.error {
            dep.error = Some(v.clone());
        }
        if let Some(v) = self.ready_at {
            // ready_at is write-once: the first CAS winner sets it for good.
            if dep.ready_at.is_none() {
                dep.ready_at = Some(v);
            }
        }
        if let Some(ref attempt) = self.push_attempt {
            dep.attempts.push(attempt.clone());
        }
        dep.updated_at = now;
    }
}

/// Abstract persistence for deployments.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a fresh document. Fails if the id already exists.
    async fn create(&self, deployment: &Deployment) -> Result<(), StoreError>;

    /// Owner-scoped read: a wrong `owner_hash` is indistinguishable from an
    /// unknown id.
    async fn get(&self, id: &str, owner_hash: &str) -> Result<Deployment, StoreError>;

    /// Unscoped read for internal paths (engine task, worker callback).
    async fn fetch(&self, id: &str) -> Result<Deployment, StoreError>;

    /// Compare-and-set update. `expected` lists the statuses the document
    /// may currently be in; an empty slice means unconditional. Returns the
    /// updated document.
    async fn update(
        &self,
        id: &str,
        patch: DeploymentPatch,
        expected: &[DeploymentStatus],
    ) -> Result<Deployment, StoreError>;

    /// Atomic append to the deployment's log.
    async fn append_log(&self, id: &str, level: LogLevel, message: &str) -> Result<(), StoreError>;

    /// Most recent `limit` log entries, in append order.
    async fn logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>, StoreError>;

    /// Optional reuse optimization: an existing non-failed deployment with
    /// the same (owner, model, requested tier) fingerprint.
    async fn find_reusable(
        &self,
        owner_hash: &str,
        model_id: &str,
        requested_tier: Option<&str>,
    ) -> Result<Option<Deployment>, StoreError>;

    /// Liveness check for the readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Fingerprint key shared by both implementations for reuse lookups.
pub(crate) fn fingerprint(owner_hash: &str, model_id: &str, requested_tier: Option<&str>) -> String {
    format!(
        "{owner_hash}:{model_id}:{}",
        requested_tier.unwrap_or("auto")
    )
}
