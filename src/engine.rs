//! Deployment lifecycle engine.
//!
//! One spawned task per deployment drives it from `validating` to a terminal
//! state: validate on the Hub, size the model, pick GPU candidates in cost
//! order, create the endpoint with capacity fallback, then hand off to the
//! readiness monitor (see [`crate::monitor`]). Every transition is a
//! compare-and-set through the store, so duplicate triggers and racing
//! deletes resolve to no-ops instead of corrupted state.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::entities::{
    Attempt, CacheScope, Deployment, DeploymentError, DeploymentStatus, LogLevel,
    S3CacheCredentials,
};
use crate::error::VisgateError;
use crate::estimator;
use crate::hf::HfValidator;
use crate::mask;
use crate::provider::{CreateEndpointRequest, GpuProvider};
use crate::registry;
use crate::selector::select_candidates;
use crate::store::{DeploymentPatch, DeploymentStore, StoreError};
use crate::webhook::WebhookDispatcher;

/// Request-scoped credentials. These live only in the engine task's memory;
/// the store sees nothing but the owner hash.
#[derive(Clone)]
pub struct DeploymentSecrets {
    pub provider_key: String,
    pub hf_token: Option<String>,
    pub private_s3: Option<S3CacheCredentials>,
}

/// Shared orchestration state: store, provider, validator, dispatcher.
pub struct Engine {
    pub(crate) store: Arc<dyn DeploymentStore>,
    pub(crate) provider: Arc<dyn GpuProvider>,
    pub(crate) validator: HfValidator,
    pub(crate) webhooks: WebhookDispatcher,
    pub(crate) settings: Settings,
}

impl Engine {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        provider: Arc<dyn GpuProvider>,
        settings: Settings,
    ) -> Self {
        let validator = HfValidator::new(settings.hf_api_base_url.clone(), settings.hf_timeout);
        let webhooks = WebhookDispatcher::new(
            settings.webhook_connect_timeout,
            settings.webhook_timeout,
            settings.webhook_max_retries,
        );
        Self {
            store,
            provider,
            validator,
            webhooks,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Dispatch the background task that owns this deployment's lifecycle.
    /// The request handler returns 202 immediately after calling this.
    pub fn spawn(self: &Arc<Self>, deployment_id: String, secrets: DeploymentSecrets) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(deployment_id, secrets).await;
        });
    }

    async fn run(&self, deployment_id: String, secrets: DeploymentSecrets) {
        if let Err(e) = self.orchestrate(&deployment_id, &secrets).await {
            self.fail(&deployment_id, &e).await;
        }
    }

    /// Drive the deployment through validation, selection and creation, then
    /// wait for readiness. Returns `Err` only for failures that should land
    /// the deployment in `failed`; benign exits (delete raced us, someone
    /// else finished the transition) return `Ok`.
    async fn orchestrate(
        &self,
        id: &str,
        secrets: &DeploymentSecrets,
    ) -> Result<(), VisgateError> {
        let dep = match self.store.fetch(id).await {
            Ok(dep) => dep,
            Err(e) => {
                error!(deployment_id = %id, error = %e, "Deployment doc not found at start");
                return Ok(());
            }
        };

        // Phase 1: validate the model on the Hub.
        self.log(id, LogLevel::Info, "Validating Hugging Face model")
            .await;
        let metadata = self
            .validator
            .validate(&dep.model_id, secrets.hf_token.as_deref())
            .await?;

        let min_vram_gb = match registry::model_spec(&dep.model_id) {
            Some(spec) => spec.min_vram_gb,
            None => estimator::estimate_min_vram_gb(&dep.model_id, metadata.parameters.as_ref())?,
        };
        self.log(
            id,
            LogLevel::Info,
            &format!("HF model validated; min VRAM {min_vram_gb} GB"),
        )
        .await;

        // Phase 2: pick GPU candidates, cheapest first.
        let mut patch = DeploymentPatch::status(DeploymentStatus::SelectingGpu);
        patch.min_vram_gb = Some(min_vram_gb);
        if !self
            .transition(id, patch, &[DeploymentStatus::Validating])
            .await?
        {
            return Ok(());
        }

        let candidates = select_candidates(min_vram_gb, dep.requested_tier.as_deref())?;
        self.log(
            id,
            LogLevel::Info,
            &format!(
                "Selected GPU candidates: {}",
                candidates
                    .iter()
                    .map(|c| c.tier_id)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
        .await;

        // Phase 3: create the endpoint, falling back across tiers on
        // capacity errors only. The timeout budget runs from here.
        let mut patch = DeploymentPatch::status(DeploymentStatus::CreatingEndpoint);
        patch.resolved_tier = Some(candidates[0].tier_id.to_string());
        if !self
            .transition(id, patch, &[DeploymentStatus::SelectingGpu])
            .await?
        {
            return Ok(());
        }
        let phase_entered = tokio::time::Instant::now();

        let env = self.worker_env(&dep, secrets);
        // Logged copies of the environment always go through the masker.
        debug!(deployment_id = %id, env = ?mask::masked_env(&env), "Worker environment prepared");
        let mut attempted: Vec<String> = Vec::new();

        for candidate in &candidates {
            let mut patch = DeploymentPatch::default();
            patch.resolved_tier = Some(candidate.tier_id.to_string());
            patch.gpu_allocated = Some(candidate.display_name.to_string());
            if !self
                .transition(id, patch, &[DeploymentStatus::CreatingEndpoint])
                .await?
            {
                // Deleted while we were looping; nothing created yet.
                return Ok(());
            }

            let request = CreateEndpointRequest {
                name: format!("visgate-{id}"),
                image: self.settings.docker_image.clone(),
                template_id: self.settings.runpod_template_id.clone(),
                gpu_tier_id: candidate.tier_id.to_string(),
                env: env.clone(),
                workers_min: self.settings.workers_min,
                workers_max: self.settings.workers_max,
                idle_timeout_seconds: self.settings.idle_timeout_seconds,
                scaler_type: self.settings.scaler_type.clone(),
                scaler_value: self.settings.scaler_value,
            };

            info!(deployment_id = %id, tier = %candidate.tier_id, "Creating endpoint");
            match self
                .provider
                .create_endpoint(&secrets.provider_key, &request)
                .await
            {
                Ok(handle) => {
                    let mut patch = DeploymentPatch::status(DeploymentStatus::DownloadingModel);
                    patch.endpoint_id = Some(handle.endpoint_id.clone());
                    patch.endpoint_url = Some(handle.url.clone());
                    if !self
                        .transition(id, patch, &[DeploymentStatus::CreatingEndpoint])
                        .await?
                    {
                        // Delete won the race after the endpoint came up;
                        // tear it down rather than leak the caller's billing.
                        warn!(deployment_id = %id, endpoint_id = %handle.endpoint_id,
                              "Deleted during create; removing fresh endpoint");
                        if let Err(e) = self
                            .provider
                            .delete_endpoint(&secrets.provider_key, &handle.endpoint_id)
                            .await
                        {
                            self.log(
                                id,
                                LogLevel::Warn,
                                &format!("Endpoint cleanup failed: {e}"),
                            )
                            .await;
                        }
                        return Ok(());
                    }
                    self.log(
                        id,
                        LogLevel::Info,
                        &format!(
                            "Endpoint created on {} ({})",
                            candidate.display_name, handle.endpoint_id
                        ),
                    )
                    .await;

                    // Phase 4: converge on readiness (or timeout).
                    self.await_readiness(
                        id,
                        &handle.endpoint_id,
                        &secrets.provider_key,
                        phase_entered,
                    )
                    .await;
                    return Ok(());
                }
                Err(e) if e.is_capacity() => {
                    counter!("visgate_capacity_fallbacks_total").increment(1);
                    attempted.push(candidate.tier_id.to_string());
                    let mut patch = DeploymentPatch::default();
                    patch.push_attempt = Some(Attempt {
                        tier_id: candidate.tier_id.to_string(),
                        failure_reason: e.to_string(),
                    });
                    if !self
                        .transition(id, patch, &[DeploymentStatus::CreatingEndpoint])
                        .await?
                    {
                        return Ok(());
                    }
                    self.log(
                        id,
                        LogLevel::Warn,
                        &format!("No capacity on {}; trying next tier", candidate.tier_id),
                    )
                    .await;
                }
                Err(e) => {
                    return Err(VisgateError::Provider {
                        message: e.to_string(),
                    });
                }
            }
        }

        self.log(
            id,
            LogLevel::Error,
            &format!("All GPU tiers exhausted: {}", attempted.join(", ")),
        )
        .await;
        Err(VisgateError::InsufficientGpu {
            required_vram_gb: min_vram_gb,
        })
    }

    /// CAS a patch. `Ok(true)` applied, `Ok(false)` benign conflict (another
    /// actor, usually delete, moved the status), `Err` store failure.
    async fn transition(
        &self,
        id: &str,
        patch: DeploymentPatch,
        expected: &[DeploymentStatus],
    ) -> Result<bool, VisgateError> {
        match self.store.update(id, patch, expected).await {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict { actual }) => {
                info!(deployment_id = %id, actual = %actual, "Transition skipped (CAS mismatch)");
                Ok(false)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(VisgateError::Store(e.to_string())),
        }
    }

    /// Mark the deployment failed unless it already reached a terminal state.
    async fn fail(&self, id: &str, err: &VisgateError) {
        counter!("visgate_deployments_failed_total", "kind" => err.kind()).increment(1);
        error!(deployment_id = %id, kind = err.kind(), error = %err, "Deployment failed");

        let mut patch = DeploymentPatch::status(DeploymentStatus::Failed);
        patch.error = Some(DeploymentError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        let non_terminal: Vec<DeploymentStatus> = DeploymentStatus::ALL
            .into_iter()
            .filter(|s| !s.is_terminal())
            .collect();
        match self.store.update(id, patch, &non_terminal).await {
            Ok(_) => {
                self.log(id, LogLevel::Error, &err.to_string()).await;
            }
            Err(StoreError::Conflict { actual }) => {
                info!(deployment_id = %id, actual = %actual, "Failure after terminal state; ignored");
            }
            Err(e) => {
                error!(deployment_id = %id, error = %e, "Could not record failure");
            }
        }
    }

    /// Delete a deployment: transition to `deleted` exactly once, then make
    /// a best-effort provider teardown. Idempotent: repeated deletes are
    /// no-ops and never trigger a second provider call.
    pub async fn delete(
        &self,
        id: &str,
        owner_hash: &str,
        provider_key: &str,
    ) -> Result<(), VisgateError> {
        let dep = match self.store.get(id, owner_hash).await {
            Ok(dep) => dep,
            Err(StoreError::NotFound(_)) => {
                return Err(VisgateError::DeploymentNotFound(id.to_string()))
            }
            Err(e) => return Err(VisgateError::Store(e.to_string())),
        };

        if dep.status == DeploymentStatus::Deleted {
            return Ok(());
        }

        let not_deleted: Vec<DeploymentStatus> = DeploymentStatus::ALL
            .into_iter()
            .filter(|s| *s != DeploymentStatus::Deleted)
            .collect();
        let won = match self
            .store
            .update(
                id,
                DeploymentPatch::status(DeploymentStatus::Deleted),
                &not_deleted,
            )
            .await
        {
            Ok(_) => true,
            Err(StoreError::Conflict { .. }) => false,
            Err(e) => return Err(VisgateError::Store(e.to_string())),
        };

        if won {
            if let Some(endpoint_id) = dep.endpoint_id.as_deref() {
                if let Err(e) = self.provider.delete_endpoint(provider_key, endpoint_id).await {
                    warn!(deployment_id = %id, endpoint_id, error = %e,
                          "Provider delete failed; endpoint may need manual cleanup");
                    self.log(
                        id,
                        LogLevel::Warn,
                        &format!("Provider endpoint delete failed: {e}"),
                    )
                    .await;
                } else {
                    self.log(id, LogLevel::Info, "Provider endpoint deleted").await;
                }
            }
            self.log(id, LogLevel::Info, "Deployment deleted").await;
        }

        Ok(())
    }

    /// Environment the worker container boots with.
    fn worker_env(
        &self,
        dep: &Deployment,
        secrets: &DeploymentSecrets,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("HF_MODEL_ID".to_string(), dep.model_id.clone());
        if let Some(token) = &secrets.hf_token {
            env.insert("HF_TOKEN".to_string(), token.clone());
        }
        if let Some(url) = self.settings.internal_callback_url(&dep.id) {
            env.insert("VISGATE_WEBHOOK".to_string(), url);
            if !self.settings.internal_webhook_secret.is_empty() {
                env.insert(
                    "VISGATE_WEBHOOK_SECRET".to_string(),
                    self.settings.internal_webhook_secret.clone(),
                );
            }
        }

        match dep.cache_scope {
            CacheScope::Off => {}
            CacheScope::Shared => {
                if !self.settings.s3_model_url.is_empty() {
                    env.insert("S3_MODEL_URL".to_string(), self.settings.s3_model_url.clone());
                    env.insert(
                        "AWS_ACCESS_KEY_ID".to_string(),
                        self.settings.aws_access_key_id.clone(),
                    );
                    env.insert(
                        "AWS_SECRET_ACCESS_KEY".to_string(),
                        self.settings.aws_secret_access_key.clone(),
                    );
                    if !self.settings.aws_endpoint_url.is_empty() {
                        env.insert(
                            "AWS_ENDPOINT_URL".to_string(),
                            self.settings.aws_endpoint_url.clone(),
                        );
                    }
                }
            }
            CacheScope::Private => {
                if let Some(s3) = &secrets.private_s3 {
                    env.insert("S3_MODEL_URL".to_string(), s3.model_url.clone());
                    env.insert("AWS_ACCESS_KEY_ID".to_string(), s3.access_key_id.clone());
                    env.insert(
                        "AWS_SECRET_ACCESS_KEY".to_string(),
                        s3.secret_access_key.clone(),
                    );
                    if let Some(endpoint) = &s3.endpoint_url {
                        env.insert("AWS_ENDPOINT_URL".to_string(), endpoint.clone());
                    }
                }
            }
        }
        env
    }

    /// Best-effort log append mirrored to tracing.
    pub(crate) async fn log(&self, id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!(deployment_id = %id, "{message}"),
            LogLevel::Warn => warn!(deployment_id = %id, "{message}"),
            LogLevel::Error => error!(deployment_id = %id, "{message}"),
        }
        if let Err(e) = self.store.append_log(id, level, message).await {
            warn!(deployment_id = %id, error = %e, "Log append failed");
        }
    }
}
