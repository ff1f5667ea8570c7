//! Readiness monitor: the two converging paths that move a deployment from
//! a waiting phase to `ready`.
//!
//! The inbound path is the worker's callback (routes/internal.rs calls
//! [`Engine::mark_ready`] / [`Engine::record_worker_phase`]); the outbound
//! path is the per-deployment poller in [`Engine::await_readiness`].
//! Whichever fires first wins the single ready CAS; the loser observes the
//! mismatch and becomes a no-op. Time-based ordering plays no part.

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::entities::{DeploymentError, DeploymentStatus, LogLevel};
use crate::error::VisgateError;
use crate::store::{DeploymentPatch, StoreError};
use crate::webhook::WebhookDispatcher;

impl Engine {
    /// Poll the provider until the endpoint reports ready workers, the
    /// worker callback beats us to it, the deployment is deleted, or the
    /// phase budget runs out.
    ///
    /// The budget clock starts when the deployment entered
    /// `creating_endpoint`; on expiry the deployment transitions to
    /// `timeout` and the provider endpoint is left alive; it bills to the
    /// caller's account and is theirs to delete.
    pub(crate) async fn await_readiness(
        &self,
        id: &str,
        endpoint_id: &str,
        provider_key: &str,
        phase_entered: Instant,
    ) {
        let deadline = phase_entered + self.settings.deployment_timeout;
        let mut stable_observations = 0u32;

        loop {
            tokio::time::sleep(self.settings.readiness_poll_interval).await;

            // Status check doubles as the cancellation point: delete (or the
            // inbound callback) is observed within one poll interval.
            let dep = match self.store.fetch(id).await {
                Ok(dep) => dep,
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "Poll could not read deployment");
                    continue;
                }
            };
            if dep.status.is_terminal() {
                info!(deployment_id = %id, status = %dep.status, "Poller stopping");
                return;
            }

            if Instant::now() >= deadline {
                let mut patch = DeploymentPatch::status(DeploymentStatus::Timeout);
                patch.error = Some(DeploymentError {
                    kind: "TimeoutError".to_string(),
                    message: format!(
                        "Endpoint not ready within {} s; endpoint {} left running",
                        self.settings.deployment_timeout.as_secs(),
                        endpoint_id
                    ),
                });
                match self
                    .store
                    .update(id, patch, &DeploymentStatus::WAITING)
                    .await
                {
                    Ok(_) => {
                        counter!("visgate_deployments_timed_out_total").increment(1);
                        self.log(
                            id,
                            LogLevel::Error,
                            "Deployment timed out waiting for worker readiness",
                        )
                        .await;
                    }
                    Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => warn!(deployment_id = %id, error = %e, "Timeout CAS failed"),
                }
                return;
            }

            match self
                .provider
                .get_endpoint_status(provider_key, endpoint_id)
                .await
            {
                Ok(status) if status.workers_ready >= 1 => {
                    stable_observations += 1;
                    if stable_observations >= self.settings.readiness_stable_window {
                        info!(deployment_id = %id, workers = status.workers_ready,
                              "Poller observed stable readiness");
                        let _ = self.mark_ready(id, None).await;
                        return;
                    }
                }
                Ok(status) => {
                    stable_observations = 0;
                    if let Some(last_error) = status.last_error {
                        warn!(deployment_id = %id, %last_error, "Endpoint reported errors");
                    }
                }
                Err(e) => {
                    // Transient poll failures reset the stability window but
                    // never fail the deployment on their own.
                    stable_observations = 0;
                    warn!(deployment_id = %id, error = %e, "Endpoint status poll failed");
                }
            }
        }
    }

    /// The single ready transition both readiness paths converge on.
    ///
    /// The CAS winner owns webhook delivery. Returns `Ok(true)` when this
    /// call won the CAS and the webhook was delivered; `Ok(false)` for a
    /// lost race (duplicate callback, late poller, deleted deployment) or a
    /// delivery failure. Readiness itself is durable either way.
    pub async fn mark_ready(
        &self,
        id: &str,
        endpoint_url_override: Option<String>,
    ) -> Result<bool, VisgateError> {
        let now = chrono::Utc::now();
        let mut patch = DeploymentPatch::status(DeploymentStatus::Ready);
        patch.ready_at = Some(now);
        if let Some(url) = endpoint_url_override {
            patch.endpoint_url = Some(url);
        }

        let dep = match self
            .store
            .update(id, patch, &DeploymentStatus::WAITING)
            .await
        {
            Ok(dep) => dep,
            Err(StoreError::Conflict { actual }) => {
                info!(deployment_id = %id, %actual, "Ready signal ignored (CAS mismatch)");
                return Ok(false);
            }
            Err(StoreError::NotFound(_)) => {
                return Err(VisgateError::DeploymentNotFound(id.to_string()))
            }
            Err(e) => return Err(VisgateError::Store(e.to_string())),
        };

        let ready_at = dep.ready_at.unwrap_or(now);
        let duration = (ready_at - dep.created_at).num_seconds().max(0);
        counter!("visgate_deployments_ready_total").increment(1);
        histogram!("visgate_deployment_ready_duration_seconds").record(duration as f64);
        self.log(id, LogLevel::Info, "Model loaded, deployment ready")
            .await;

        // Webhook delivery. Failure flips to webhook_failed but never undoes
        // readiness: ready_at and endpoint_url are already durable.
        let mut delivered = true;
        let payload = WebhookDispatcher::ready_payload(&dep, ready_at);
        if let Err(e) = self.webhooks.deliver(&dep.webhook_url, &payload).await {
            delivered = false;
            let mut patch = DeploymentPatch::status(DeploymentStatus::WebhookFailed);
            patch.error = Some(DeploymentError {
                kind: "WebhookDeliveryError".to_string(),
                message: e.to_string(),
            });
            match self
                .store
                .update(id, patch, &[DeploymentStatus::Ready])
                .await
            {
                Ok(_) => {
                    self.log(
                        id,
                        LogLevel::Error,
                        "Webhook delivery failed after retries",
                    )
                    .await;
                }
                Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound(_)) => {}
                Err(err) => {
                    warn!(deployment_id = %id, error = %err, "webhook_failed CAS failed");
                }
            }
        }

        Ok(delivered)
    }

    /// Apply a phase hint reported by the worker (`downloading_model`,
    /// `loading_model`). Backward or duplicate hints lose the CAS and are
    /// dropped silently.
    pub async fn record_worker_phase(&self, id: &str, status: DeploymentStatus, message: Option<&str>) {
        let expected: &[DeploymentStatus] = match status {
            DeploymentStatus::DownloadingModel => &[DeploymentStatus::CreatingEndpoint],
            DeploymentStatus::LoadingModel => &[
                DeploymentStatus::CreatingEndpoint,
                DeploymentStatus::DownloadingModel,
            ],
            _ => return,
        };

        match self
            .store
            .update(id, DeploymentPatch::status(status), expected)
            .await
        {
            Ok(_) => {
                let message = message.unwrap_or(match status {
                    DeploymentStatus::DownloadingModel => "Worker downloading model weights",
                    _ => "Worker loading model into VRAM",
                });
                self.log(id, LogLevel::Info, message).await;
            }
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!(deployment_id = %id, error = %e, "Phase update failed"),
        }
    }

    /// Worker reported a fatal load error through the callback.
    pub async fn fail_from_worker(&self, id: &str, message: &str) {
        let mut patch = DeploymentPatch::status(DeploymentStatus::Failed);
        patch.error = Some(DeploymentError {
            kind: "ProviderError".to_string(),
            message: message.to_string(),
        });
        match self
            .store
            .update(id, patch, &DeploymentStatus::WAITING)
            .await
        {
            Ok(_) => {
                counter!("visgate_deployments_failed_total", "kind" => "ProviderError")
                    .increment(1);
                self.log(id, LogLevel::Error, message).await;
            }
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!(deployment_id = %id, error = %e, "Worker failure CAS failed"),
        }
    }
}
