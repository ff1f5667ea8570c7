//! In-memory store for local development and tests.
//!
//! Semantics mirror the Redis store exactly. One process-wide mutex covers
//! every compare-and-set; it is never held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{fingerprint, DeploymentPatch, DeploymentStore, StoreError};
use crate::entities::{Deployment, DeploymentStatus, LogEntry, LogLevel};

#[derive(Default)]
struct Inner {
    deployments: HashMap<String, Deployment>,
    logs: HashMap<String, Vec<LogEntry>>,
    fingerprints: HashMap<String, String>,
}

/// Non-persistent [`DeploymentStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deployments.contains_key(&deployment.id) {
            return Err(StoreError::AlreadyExists(deployment.id.clone()));
        }
        let key = fingerprint(
            &deployment.owner_hash,
            &deployment.model_id,
            deployment.requested_tier.as_deref(),
        );
        inner.fingerprints.insert(key, deployment.id.clone());
        inner
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get(&self, id: &str, owner_hash: &str) -> Result<Deployment, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .deployments
            .get(id)
            .filter(|dep| dep.owner_hash == owner_hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn fetch(&self, id: &str) -> Result<Deployment, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .deployments
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(
        &self,
        id: &str,
        patch: DeploymentPatch,
        expected: &[DeploymentStatus],
    ) -> Result<Deployment, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let dep = inner
            .deployments
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !expected.is_empty() && !expected.contains(&dep.status) {
            return Err(StoreError::Conflict { actual: dep.status });
        }

        patch.apply(dep, Utc::now());
        Ok(dep.clone())
    }

    async fn append_log(&self, id: &str, level: LogLevel, message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.deployments.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner.logs.entry(id.to_string()).or_default().push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let entries = inner.logs.get(id).cloned().unwrap_or_default();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    async fn find_reusable(
        &self,
        owner_hash: &str,
        model_id: &str,
        requested_tier: Option<&str>,
    ) -> Result<Option<Deployment>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let key = fingerprint(owner_hash, model_id, requested_tier);
        let candidate = inner
            .fingerprints
            .get(&key)
            .and_then(|id| inner.deployments.get(id));
        Ok(candidate
            .filter(|dep| {
                !matches!(
                    dep.status,
                    DeploymentStatus::Failed
                        | DeploymentStatus::Deleted
                        | DeploymentStatus::Timeout
                )
            })
            .cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
