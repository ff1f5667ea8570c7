//! RunPod serverless adapter.
//!
//! Endpoint CRUD goes through the GraphQL API (`saveEndpoint`,
//! `deleteEndpoint`, `myself { endpoints }`); worker readiness is read from
//! the serverless health endpoint (`/v2/{id}/health`). Base URLs are
//! configurable so tests can point at a local mock.

use std::collections::BTreeMap;
use std::time::Duration;

use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    classify_message, CreateEndpointRequest, EndpointHandle, EndpointStatus, EndpointSummary,
    GpuProvider, ProviderError,
};

const MUTATION_SAVE_ENDPOINT: &str = r"
mutation SaveEndpoint($input: EndpointInput!) {
  saveEndpoint(input: $input) {
    id
    name
    gpuIds
    workersMin
    workersMax
  }
}";

const MUTATION_DELETE_ENDPOINT: &str = r"
mutation DeleteEndpoint($id: String!) {
  deleteEndpoint(id: $id)
}";

const QUERY_MYSELF_ENDPOINTS: &str = r"
query Endpoints {
  myself {
    endpoints {
      id
      name
      gpuIds
    }
  }
}";

/// RunPod GraphQL + health API client.
pub struct RunpodProvider {
    client: reqwest::Client,
    graphql_url: String,
    /// Base for run/health URLs, default `https://api.runpod.ai`.
    api_base: String,
    create_timeout: Duration,
    poll_timeout: Duration,
}

impl RunpodProvider {
    pub fn new(graphql_url: String, create_timeout: Duration, poll_timeout: Duration) -> Self {
        let api_base = graphql_url
            .split("/graphql")
            .next()
            .map(|base| base.replace("api.runpod.io", "api.runpod.ai"))
            .unwrap_or_else(|| "https://api.runpod.ai".to_string());
        Self {
            client: reqwest::Client::new(),
            graphql_url,
            api_base,
            create_timeout,
            poll_timeout,
        }
    }

    /// Run URL for a serverless endpoint.
    pub fn endpoint_run_url(&self, endpoint_id: &str) -> String {
        format!("{}/v2/{}/run", self.api_base, endpoint_id)
    }

    async fn graphql(
        &self,
        api_key: &str,
        query: &str,
        variables: Value,
        timeout: Duration,
    ) -> Result<Value, String> {
        let resp = self
            .client
            .post(&self.graphql_url)
            .timeout(timeout)
            .query(&[("api_key", api_key)])
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| format!("HTTP {status}: unreadable body: {e}"))?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("GraphQL error");
                return Err(message.to_string());
            }
        }
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait::async_trait]
impl GpuProvider for RunpodProvider {
    async fn create_endpoint(
        &self,
        api_key: &str,
        request: &CreateEndpointRequest,
    ) -> Result<EndpointHandle, ProviderError> {
        let env: BTreeMap<&str, &str> = request
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let input = json!({
            "name": request.name,
            "templateId": request.template_id,
            "gpuIds": request.gpu_tier_id,
            "idleTimeout": request.idle_timeout_seconds,
            "locations": "US",
            "scalerType": request.scaler_type,
            "scalerValue": request.scaler_value,
            "workersMin": request.workers_min,
            "workersMax": request.workers_max,
            "networkVolumeId": "",
            "env": env,
        });

        // Transient HTTP failures retry with doubling backoff; GraphQL-level
        // errors (including capacity) are classified and returned at once.
        let mut last_err = String::new();
        for attempt in 0..3u32 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }
            match self
                .graphql(
                    api_key,
                    MUTATION_SAVE_ENDPOINT,
                    json!({ "input": &input }),
                    self.create_timeout,
                )
                .await
            {
                Ok(data) => {
                    let endpoint_id = data
                        .pointer("/saveEndpoint/id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            counter!("visgate_provider_api_errors_total").increment(1);
                            ProviderError::Api {
                                message: "saveEndpoint returned no data".to_string(),
                            }
                        })?
                        .to_string();
                    debug!(%endpoint_id, name = %request.name, "RunPod endpoint created");
                    let url = self.endpoint_run_url(&endpoint_id);
                    return Ok(EndpointHandle { endpoint_id, url });
                }
                Err(message) if message.starts_with("request failed") => {
                    warn!(attempt, error = %message, "RunPod create request failed");
                    last_err = message;
                }
                Err(message) => {
                    counter!("visgate_provider_api_errors_total").increment(1);
                    return Err(classify_message(&request.gpu_tier_id, &message));
                }
            }
        }

        counter!("visgate_provider_api_errors_total").increment(1);
        Err(ProviderError::Api {
            message: format!("create failed after retries: {last_err}"),
        })
    }

    async fn delete_endpoint(&self, api_key: &str, endpoint_id: &str) -> Result<(), ProviderError> {
        self.graphql(
            api_key,
            MUTATION_DELETE_ENDPOINT,
            json!({ "id": endpoint_id }),
            self.create_timeout,
        )
        .await
        .map_err(|message| {
            counter!("visgate_provider_api_errors_total").increment(1);
            ProviderError::Api { message }
        })?;
        debug!(%endpoint_id, "RunPod endpoint deleted");
        Ok(())
    }

    async fn list_endpoints(&self, api_key: &str) -> Result<Vec<EndpointSummary>, ProviderError> {
        let data = self
            .graphql(
                api_key,
                QUERY_MYSELF_ENDPOINTS,
                json!({}),
                self.poll_timeout,
            )
            .await
            .map_err(|message| ProviderError::Api { message })?;

        let endpoints = data
            .pointer("/myself/endpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(endpoints
            .iter()
            .filter_map(|ep| {
                Some(EndpointSummary {
                    endpoint_id: ep.get("id")?.as_str()?.to_string(),
                    name: ep
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    gpu_tier_id: ep
                        .get("gpuIds")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect())
    }

    async fn get_endpoint_status(
        &self,
        api_key: &str,
        endpoint_id: &str,
    ) -> Result<EndpointStatus, ProviderError> {
        let url = format!("{}/v2/{}/health", self.api_base, endpoint_id);
        let resp = self
            .client
            .get(&url)
            .timeout(self.poll_timeout)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Api {
                message: format!("health request failed: {e}"),
            })?;

        if resp.status().as_u16() == 404 {
            return Ok(EndpointStatus {
                created: false,
                workers_ready: 0,
                last_error: Some("endpoint not found".to_string()),
            });
        }
        if !resp.status().is_success() {
            return Err(ProviderError::Api {
                message: format!("health HTTP {}", resp.status()),
            });
        }

        let body: Value = resp.json().await.map_err(|e| ProviderError::Api {
            message: format!("unreadable health body: {e}"),
        })?;

        let workers_ready = body
            .pointer("/workers/ready")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let last_error = body
            .pointer("/jobs/failed")
            .and_then(Value::as_u64)
            .filter(|&failed| failed > 0)
            .map(|failed| format!("{failed} failed jobs"));

        Ok(EndpointStatus {
            created: true,
            workers_ready,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(base: &str) -> RunpodProvider {
        RunpodProvider::new(
            format!("{base}/graphql"),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn create_request(tier: &str) -> CreateEndpointRequest {
        CreateEndpointRequest {
            name: "visgate-dep_2026_abcd1234".to_string(),
            image: "visgate/inference:latest".to_string(),
            template_id: "tmpl_1".to_string(),
            gpu_tier_id: tier.to_string(),
            env: BTreeMap::from([("HF_MODEL_ID".to_string(), "stabilityai/sd-turbo".to_string())]),
            workers_min: 0,
            workers_max: 3,
            idle_timeout_seconds: 120,
            scaler_type: "QUEUE_DELAY".to_string(),
            scaler_value: 1,
        }
    }

    #[tokio::test]
    async fn create_returns_handle_with_run_url() {
        let app = Router::new().route(
            "/graphql",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(
                    body.pointer("/variables/input/gpuIds").unwrap(),
                    "AMPERE_24"
                );
                assert_eq!(
                    body.pointer("/variables/input/env/HF_MODEL_ID").unwrap(),
                    "stabilityai/sd-turbo"
                );
                Json(json!({ "data": { "saveEndpoint": { "id": "ep_1" } } }))
            }),
        );
        let base = serve(app).await;

        let handle = provider(&base)
            .create_endpoint("rpa_key", &create_request("AMPERE_24"))
            .await
            .unwrap();
        assert_eq!(handle.endpoint_id, "ep_1");
        assert_eq!(handle.url, format!("{base}/v2/ep_1/run"));
    }

    #[tokio::test]
    async fn capacity_error_is_classified() {
        let app = Router::new().route(
            "/graphql",
            post(|| async {
                Json(json!({
                    "errors": [{ "message": "There are no longer any instances available" }]
                }))
            }),
        );
        let base = serve(app).await;

        let err = provider(&base)
            .create_endpoint("rpa_key", &create_request("AMPERE_48"))
            .await
            .unwrap_err();
        assert!(err.is_capacity());
    }

    #[tokio::test]
    async fn generic_graphql_error_is_api_error() {
        let app = Router::new().route(
            "/graphql",
            post(|| async { Json(json!({ "errors": [{ "message": "invalid api key" }] })) }),
        );
        let base = serve(app).await;

        let err = provider(&base)
            .create_endpoint("rpa_key", &create_request("AMPERE_24"))
            .await
            .unwrap_err();
        assert!(!err.is_capacity());
    }

    #[tokio::test]
    async fn health_reports_ready_workers() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let app = Router::new().route(
            "/v2/{id}/health",
            get(move || {
                let n = calls_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    Json(json!({
                        "workers": { "ready": if n == 0 { 0 } else { 2 }, "idle": 0 },
                        "jobs": { "failed": 0 }
                    }))
                }
            }),
        );
        let base = serve(app).await;
        let p = provider(&base);

        let first = p.get_endpoint_status("rpa_key", "ep_1").await.unwrap();
        assert_eq!(first.workers_ready, 0);
        let second = p.get_endpoint_status("rpa_key", "ep_1").await.unwrap();
        assert_eq!(second.workers_ready, 2);
        assert!(second.created);
    }

    #[tokio::test]
    async fn list_endpoints_parses_summaries() {
        let app = Router::new().route(
            "/graphql",
            post(|| async {
                Json(json!({
                    "data": { "myself": { "endpoints": [
                        { "id": "ep_1", "name": "visgate-dep_a", "gpuIds": "AMPERE_24" },
                        { "id": "ep_2", "name": "other", "gpuIds": "ADA_80_PRO" }
                    ]}}
                }))
            }),
        );
        let base = serve(app).await;

        let endpoints = provider(&base).list_endpoints("rpa_key").await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].endpoint_id, "ep_1");
        assert_eq!(endpoints[1].gpu_tier_id, "ADA_80_PRO");
    }
}
