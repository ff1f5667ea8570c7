//! Hugging Face Hub validation and metadata extraction.
//!
//! Confirms the model exists and is readable with the supplied token, and
//! pulls the `safetensors.parameters` dtype map the estimator needs. A
//! registry hit short-circuits the network entirely.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::VisgateError;
use crate::mask::mask_secret;
use crate::registry;

/// Result of a successful validation.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub model_id: String,
    pub pipeline_tag: Option<String>,
    pub gated: bool,
    /// dtype -> parameter count, when the Hub reports safetensors metadata.
    pub parameters: Option<HashMap<String, u64>>,
}

/// Raw Hub response; only the fields we consume.
#[derive(Debug, Deserialize)]
struct HubModelInfo {
    #[serde(default)]
    pipeline_tag: Option<String>,
    #[serde(default)]
    gated: serde_json::Value,
    #[serde(default)]
    safetensors: Option<HubSafetensors>,
}

#[derive(Debug, Deserialize)]
struct HubSafetensors {
    #[serde(default)]
    parameters: Option<HashMap<String, u64>>,
}

/// Validates models against the Hub API.
pub struct HfValidator {
    client: reqwest::Client,
    base_url: String,
}

impl HfValidator {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { client, base_url }
    }

    /// Check that the model exists and is accessible, returning its metadata.
    ///
    /// Registered models skip the round-trip (and the Hub rate limit): the
    /// registry already knows their VRAM floor, which is all the engine needs.
    pub async fn validate(
        &self,
        model_id: &str,
        token: Option<&str>,
    ) -> Result<ModelMetadata, VisgateError> {
        if let Some(spec) = registry::model_spec(model_id) {
            debug!(model_id, "Registry hit; skipping Hub validation");
            return Ok(ModelMetadata {
                model_id: model_id.to_string(),
                pipeline_tag: Some(spec.pipeline_tag.to_string()),
                gated: false,
                parameters: None,
            });
        }

        let url = format!("{}/api/models/{}", self.base_url.trim_end_matches('/'), model_id);
        if let Some(token) = token {
            debug!(model_id, token = %mask_secret(token), "Validating gated access with Hub token");
        }

        let mut last_err = String::new();
        for attempt in 0..3u32 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            let mut req = self.client.get(&url);
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(model_id, attempt, error = %e, "Hub request failed");
                    last_err = e.to_string();
                    continue;
                }
            };

            match resp.status().as_u16() {
                200 => {
                    let info: HubModelInfo = resp.json().await.map_err(|e| {
                        VisgateError::ModelRegistryUnreachable(format!(
                            "unreadable Hub response: {e}"
                        ))
                    })?;
                    let gated = match &info.gated {
                        serde_json::Value::Bool(b) => *b,
                        // The Hub encodes gating mode as "auto"/"manual".
                        serde_json::Value::String(_) => true,
                        _ => false,
                    };
                    return Ok(ModelMetadata {
                        model_id: model_id.to_string(),
                        pipeline_tag: info.pipeline_tag,
                        gated,
                        parameters: info.safetensors.and_then(|s| s.parameters),
                    });
                }
                404 => {
                    return Err(VisgateError::ModelNotFound {
                        model_id: model_id.to_string(),
                    })
                }
                401 | 403 => {
                    return Err(if token.is_some() {
                        VisgateError::ModelAccessDenied {
                            model_id: model_id.to_string(),
                        }
                    } else {
                        VisgateError::ModelGated {
                            model_id: model_id.to_string(),
                        }
                    })
                }
                429 => {
                    warn!(model_id, attempt, "Hub rate limited");
                    last_err = "HTTP 429".to_string();
                    continue;
                }
                status if status >= 500 => {
                    warn!(model_id, attempt, status, "Hub server error");
                    last_err = format!("HTTP {status}");
                    continue;
                }
                status => {
                    return Err(VisgateError::ModelRegistryUnreachable(format!(
                        "unexpected Hub status {status}"
                    )))
                }
            }
        }

        Err(VisgateError::ModelRegistryUnreachable(last_err))
    }
}
