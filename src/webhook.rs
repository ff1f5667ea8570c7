//! User-facing webhook delivery.
//!
//! One notification per deployment, delivered with bounded retries. Retry
//! only on transport errors, 5xx, 408 and 429; other 4xx are the caller's
//! endpoint telling us to stop. Logged URLs go through the masking helper.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::entities::Deployment;
use crate::error::VisgateError;
use crate::mask::mask_url;

/// Delay before the next attempt, indexed by completed attempt count.
const BACKOFF_SECONDS: [u64; 3] = [1, 5, 25];

/// Delivers deployment-ready notifications.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    max_retries: u32,
}

impl WebhookDispatcher {
    pub fn new(connect_timeout: Duration, total_timeout: Duration, max_retries: u32) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(total_timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            max_retries,
        }
    }

    /// Build the `deployment_ready` body. Contains no secrets: the auth
    /// header in the usage example is a placeholder the caller fills in.
    pub fn ready_payload(deployment: &Deployment, ready_at: DateTime<Utc>) -> Value {
        let endpoint_url = deployment.endpoint_url.clone().unwrap_or_default();
        let duration_seconds = (ready_at - deployment.created_at).num_seconds().max(0);
        json!({
            "event": "deployment_ready",
            "deployment_id": deployment.id,
            "status": "ready",
            "endpoint_url": endpoint_url,
            "endpoint_id": deployment.endpoint_id,
            "model_id": deployment.model_id,
            "gpu_allocated": deployment.gpu_allocated,
            "created_at": deployment.created_at,
            "ready_at": ready_at,
            "duration_seconds": duration_seconds,
            "usage_example": {
                "method": "POST",
                "url": endpoint_url,
                "headers": { "Authorization": "Bearer <YOUR_PROVIDER_API_KEY>" },
                "body": {
                    "input": {
                        "prompt": "An astronaut riding a horse in photorealistic style",
                        "num_inference_steps": 28,
                        "guidance_scale": 3.5
                    }
                }
            }
        })
    }

    /// POST the payload with retries. `Ok` on any 2xx; `WebhookDelivery`
    /// once the schedule is exhausted.
    pub async fn deliver(&self, url: &str, payload: &Value) -> Result<(), VisgateError> {
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let idx = (attempt as usize - 1).min(BACKOFF_SECONDS.len() - 1);
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECONDS[idx])).await;
            }

            match self.client.post(url).json(payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        info!(url = %mask_url(url), attempt, "Webhook delivered");
                        return Ok(());
                    }
                    last_error = format!("HTTP {status}");
                    let retryable =
                        status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429;
                    if !retryable {
                        warn!(url = %mask_url(url), %status, "Webhook rejected; not retrying");
                        break;
                    }
                    warn!(url = %mask_url(url), %status, attempt, "Webhook attempt failed");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(url = %mask_url(url), attempt, error = %e, "Webhook attempt failed");
                }
            }
        }

        counter!("visgate_webhook_failures_total").increment(1);
        warn!(url = %mask_url(url), error = %last_error, "Webhook delivery exhausted retries");
        Err(VisgateError::WebhookDelivery {
            url: mask_url(url),
        })
    }
}
