//! End-to-end tests for visgate.
//!
//! Builds the full router over the in-memory store and a mock GPU provider,
//! spins up mock axum servers for the caller webhook (and the Hub API where
//! needed), and drives deployments through the whole lifecycle: accept ->
//! validate -> select -> create -> ready -> webhook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;
use visgate::provider::{
    CreateEndpointRequest, EndpointHandle, EndpointStatus, EndpointSummary, GpuProvider,
    ProviderError,
};
use visgate::{build_app_with, DeploymentStore, MemoryStore, Settings};

// ── Mock provider ───────────────────────────────────────────────────────────

/// In-process GPU provider. Capacity failures are scripted per tier; worker
/// readiness is flipped by the test.
#[derive(Default)]
struct MockProvider {
    capacity_failures: Mutex<HashMap<String, u32>>,
    workers_ready: AtomicU32,
    created: Mutex<Vec<CreateEndpointRequest>>,
    deletes: AtomicU32,
    next_id: AtomicU32,
}

impl MockProvider {
    fn with_capacity_failures(failures: &[(&str, u32)]) -> Self {
        let provider = Self::default();
        {
            let mut map = provider.capacity_failures.lock().unwrap();
            for (tier, count) in failures {
                map.insert(tier.to_string(), *count);
            }
        }
        provider
    }

    fn set_workers_ready(&self, n: u32) {
        self.workers_ready.store(n, Ordering::SeqCst);
    }

    fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    fn delete_count(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GpuProvider for MockProvider {
    async fn create_endpoint(
        &self,
        _api_key: &str,
        request: &CreateEndpointRequest,
    ) -> Result<EndpointHandle, ProviderError> {
        {
            let mut failures = self.capacity_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&request.gpu_tier_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::Capacity {
                        tier_id: request.gpu_tier_id.clone(),
                        message: "no instances available".to_string(),
                    });
                }
            }
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(request.clone());
        Ok(EndpointHandle {
            endpoint_id: format!("ep_{n}"),
            url: format!("https://api.provider/v2/ep_{n}/run"),
        })
    }

    async fn delete_endpoint(
        &self,
        _api_key: &str,
        _endpoint_id: &str,
    ) -> Result<(), ProviderError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_endpoints(&self, _api_key: &str) -> Result<Vec<EndpointSummary>, ProviderError> {
        let created = self.created.lock().unwrap();
        Ok(created
            .iter()
            .enumerate()
            .map(|(i, req)| EndpointSummary {
                endpoint_id: format!("ep_{}", i + 1),
                name: req.name.clone(),
                gpu_tier_id: req.gpu_tier_id.clone(),
            })
            .collect())
    }

    async fn get_endpoint_status(
        &self,
        _api_key: &str,
        _endpoint_id: &str,
    ) -> Result<EndpointStatus, ProviderError> {
        Ok(EndpointStatus {
            created: true,
            workers_ready: self.workers_ready.load(Ordering::SeqCst),
            last_error: None,
        })
    }
}

// ── Mock webhook receiver ───────────────────────────────────────────────────

struct WebhookReceiver {
    url: String,
    payloads: Arc<Mutex<Vec<Value>>>,
    hits: Arc<AtomicU32>,
}

/// Spawn a webhook target. `fail_with` makes every delivery attempt return
/// the given status instead of 200.
async fn spawn_webhook_receiver(fail_with: Option<StatusCode>) -> WebhookReceiver {
    let payloads: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let hits = Arc::new(AtomicU32::new(0));
    let payloads_clone = payloads.clone();
    let hits_clone = hits.clone();

    let app = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            let payloads = payloads_clone.clone();
            async move {
                match fail_with {
                    Some(status) => status,
                    None => {
                        payloads.lock().unwrap().push(body);
                        StatusCode::OK
                    }
                }
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    WebhookReceiver {
        url: format!("http://{addr}/hook"),
        payloads,
        hits,
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

const PROVIDER_KEY: &str = "rpa_test_key_0123456789";

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.readiness_poll_interval = Duration::from_millis(25);
    settings.readiness_stable_window = 1;
    settings.webhook_connect_timeout = Duration::from_secs(1);
    settings.webhook_timeout = Duration::from_secs(2);
    settings.runpod_template_id = "tmpl_test".to_string();
    settings
}

struct Gateway {
    app: Router,
    provider: Arc<MockProvider>,
    store: Arc<dyn DeploymentStore>,
}

fn gateway(settings: Settings, provider: MockProvider) -> Gateway {
    let store: Arc<dyn DeploymentStore> = Arc::new(MemoryStore::new());
    let provider = Arc::new(provider);
    let (app, _engine) = build_app_with(settings, store.clone(), provider.clone());
    Gateway {
        app,
        provider,
        store,
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("Authorization", format!("Bearer {key}"));
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create_deployment(gw: &Gateway, body: Value) -> String {
    let (status, reply) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        Some(PROVIDER_KEY),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "unexpected reply: {reply}");
    assert_eq!(reply["status"], "validating");
    reply["deployment_id"].as_str().unwrap().to_string()
}

/// Poll the GET endpoint until the deployment reaches `expected`.
async fn wait_for_status(gw: &Gateway, id: &str, expected: &str, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (status, body) = send(
            &gw.app,
            "GET",
            &format!("/v1/deployments/{id}"),
            Some(PROVIDER_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == expected {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected}; last snapshot: {body}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_known_model_with_inbound_callback() {
    let receiver = spawn_webhook_receiver(None).await;
    let gw = gateway(test_settings(), MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "gpu_tier": "A10",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;

    // Engine reaches the waiting phase, then the worker callback fires.
    wait_for_status(&gw, &id, "downloading_model", Duration::from_secs(2)).await;
    let (status, reply) = send(
        &gw.app,
        "POST",
        &format!("/internal/deployment-ready/{id}"),
        None,
        Some(json!({ "status": "ready" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["webhook_delivered"], true);

    let snapshot = wait_for_status(&gw, &id, "ready", Duration::from_secs(2)).await;
    assert_eq!(snapshot["resolved_tier"], "AMPERE_24");
    assert_eq!(snapshot["gpu_allocated"], "NVIDIA A10 / A30");
    assert_eq!(snapshot["min_vram_gb"], 8);
    assert!(snapshot["endpoint_url"]
        .as_str()
        .unwrap()
        .starts_with("https://api.provider/v2/"));
    assert!(snapshot["ready_at"].is_string());

    // Audit log covers each phase.
    let logs = snapshot["logs"].as_array().unwrap();
    let joined = logs
        .iter()
        .map(|e| e["message"].as_str().unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(joined.contains("Validating Hugging Face model"));
    assert!(joined.contains("Selected GPU candidates"));
    assert!(joined.contains("Endpoint created"));
    assert!(joined.contains("deployment ready"));

    // Exactly one webhook, with the documented shape and no raw key.
    let payloads = receiver.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload["event"], "deployment_ready");
    assert_eq!(payload["deployment_id"], id.as_str());
    assert_eq!(payload["model_id"], "stabilityai/sd-turbo");
    assert_eq!(payload["gpu_allocated"], "NVIDIA A10 / A30");
    assert_eq!(payload["usage_example"]["method"], "POST");
    assert!(!payload.to_string().contains(PROVIDER_KEY));

    // The worker env carried the model id.
    let created = gw.provider.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].env["HF_MODEL_ID"], "stabilityai/sd-turbo");
    assert_eq!(created[0].name, format!("visgate-{id}"));
}

#[tokio::test]
async fn capacity_fallback_takes_next_cheapest_tier() {
    let receiver = spawn_webhook_receiver(None).await;
    let provider = MockProvider::with_capacity_failures(&[("AMPERE_48", 1)]);
    provider.set_workers_ready(1);
    let gw = gateway(test_settings(), provider);

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "black-forest-labs/FLUX.1-dev",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;

    // Readiness converges through the polling path.
    let snapshot = wait_for_status(&gw, &id, "ready", Duration::from_secs(5)).await;
    assert_eq!(snapshot["resolved_tier"], "ADA_48_PRO");
    assert_eq!(snapshot["min_vram_gb"], 28);

    let attempts = snapshot["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0]["tier_id"], "AMPERE_48");
    assert!(attempts[0]["failure_reason"]
        .as_str()
        .unwrap()
        .contains("no instances"));

    assert_eq!(gw.provider.created_count(), 1);
    assert_eq!(receiver.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_model_sized_by_estimator() {
    // Mock Hub: an unregistered model with a BF16-heavy parameter map.
    let hub = Router::new().route(
        "/api/models/{owner}/{name}",
        get(|| async {
            Json(json!({
                "id": "org/custom",
                "pipeline_tag": "text-to-image",
                "gated": false,
                "safetensors": {
                    "parameters": { "BF16": 2_000_000_000u64, "F32": 50_000_000u64 }
                }
            }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, hub).await.unwrap();
    });

    let receiver = spawn_webhook_receiver(None).await;
    let mut settings = test_settings();
    settings.hf_api_base_url = format!("http://{hub_addr}");
    let provider = MockProvider::default();
    provider.set_workers_ready(1);
    let gw = gateway(settings, provider);

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "org/custom",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;

    let snapshot = wait_for_status(&gw, &id, "ready", Duration::from_secs(5)).await;
    // 4.2e9 weight bytes x 1.35 lands in the 6 GB tier; cheapest fit is A16.
    assert_eq!(snapshot["min_vram_gb"], 6);
    assert_eq!(snapshot["resolved_tier"], "AMPERE_16");
}

#[tokio::test]
async fn requested_tier_too_small_fails_without_creating() {
    let receiver = spawn_webhook_receiver(None).await;
    let gw = gateway(test_settings(), MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "black-forest-labs/FLUX.1-dev",
            "gpu_tier": "A10",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;

    let snapshot = wait_for_status(&gw, &id, "failed", Duration::from_secs(2)).await;
    assert_eq!(snapshot["error"]["kind"], "UnsupportedGPUError");
    assert!(snapshot["endpoint_id"].is_null());
    assert_eq!(gw.provider.created_count(), 0);
    assert_eq!(receiver.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn delete_while_loading_tears_down_endpoint() {
    let receiver = spawn_webhook_receiver(None).await;
    // Workers never become ready: the deployment parks in the waiting phase.
    let gw = gateway(test_settings(), MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;
    wait_for_status(&gw, &id, "downloading_model", Duration::from_secs(2)).await;

    let (status, _) = send(
        &gw.app,
        "DELETE",
        &format!("/v1/deployments/{id}"),
        Some(PROVIDER_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let snapshot = wait_for_status(&gw, &id, "deleted", Duration::from_secs(2)).await;
    assert!(snapshot["error"].is_null());
    assert_eq!(gw.provider.delete_count(), 1);

    // Idempotent: repeat DELETE is 204 and no second provider call.
    let (status, _) = send(
        &gw.app,
        "DELETE",
        &format!("/v1/deployments/{id}"),
        Some(PROVIDER_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(gw.provider.delete_count(), 1);

    // No webhook for a deleted deployment.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(receiver.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn webhook_failure_preserves_readiness() {
    let receiver = spawn_webhook_receiver(Some(StatusCode::INTERNAL_SERVER_ERROR)).await;
    let mut settings = test_settings();
    settings.webhook_max_retries = 2;
    let provider = MockProvider::default();
    provider.set_workers_ready(1);
    let gw = gateway(settings, provider);

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;

    let snapshot = wait_for_status(&gw, &id, "webhook_failed", Duration::from_secs(10)).await;
    assert_eq!(receiver.hits.load(Ordering::SeqCst), 2);
    // Readiness is not reverted: url and ready_at survive.
    assert!(snapshot["endpoint_url"].as_str().is_some());
    assert!(snapshot["ready_at"].is_string());
    assert_eq!(snapshot["error"]["kind"], "WebhookDeliveryError");
}

#[tokio::test]
async fn duplicate_ready_callbacks_are_idempotent() {
    let receiver = spawn_webhook_receiver(None).await;
    let gw = gateway(test_settings(), MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;
    wait_for_status(&gw, &id, "downloading_model", Duration::from_secs(2)).await;

    let (_, first) = send(
        &gw.app,
        "POST",
        &format!("/internal/deployment-ready/{id}"),
        None,
        Some(json!({ "status": "ready" })),
    )
    .await;
    assert_eq!(first["webhook_delivered"], true);
    let snapshot = wait_for_status(&gw, &id, "ready", Duration::from_secs(2)).await;
    let ready_at = snapshot["ready_at"].as_str().unwrap().to_string();

    // Second callback: still 200, but a no-op.
    let (status, second) = send(
        &gw.app,
        "POST",
        &format!("/internal/deployment-ready/{id}"),
        None,
        Some(json!({ "status": "ready" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["webhook_delivered"], false);

    let (_, after) = send(
        &gw.app,
        "GET",
        &format!("/v1/deployments/{id}"),
        Some(PROVIDER_KEY),
        None,
    )
    .await;
    assert_eq!(after["ready_at"].as_str().unwrap(), ready_at);
    assert_eq!(receiver.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_phase_hints_advance_the_status() {
    let receiver = spawn_webhook_receiver(None).await;
    let gw = gateway(test_settings(), MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;
    wait_for_status(&gw, &id, "downloading_model", Duration::from_secs(2)).await;

    let (status, _) = send(
        &gw.app,
        "POST",
        &format!("/internal/deployment-ready/{id}"),
        None,
        Some(json!({ "status": "loading_model" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_status(&gw, &id, "loading_model", Duration::from_secs(2)).await;

    // A stale downloading hint after loading loses the CAS and changes nothing.
    send(
        &gw.app,
        "POST",
        &format!("/internal/deployment-ready/{id}"),
        None,
        Some(json!({ "status": "downloading_model" })),
    )
    .await;
    let (_, snapshot) = send(
        &gw.app,
        "GET",
        &format!("/v1/deployments/{id}"),
        Some(PROVIDER_KEY),
        None,
    )
    .await;
    assert_eq!(snapshot["status"], "loading_model");
}

#[tokio::test]
async fn deployment_times_out_and_leaves_endpoint_alive() {
    let receiver = spawn_webhook_receiver(None).await;
    let mut settings = test_settings();
    settings.deployment_timeout = Duration::from_millis(200);
    let gw = gateway(settings, MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;

    let snapshot = wait_for_status(&gw, &id, "timeout", Duration::from_secs(3)).await;
    assert_eq!(snapshot["error"]["kind"], "TimeoutError");
    // The endpoint stays up; deleting it is the owner's call.
    assert_eq!(gw.provider.delete_count(), 0);
    assert!(snapshot["endpoint_id"].as_str().is_some());
}

#[tokio::test]
async fn auth_and_ownership_checks() {
    let receiver = spawn_webhook_receiver(None).await;
    let gw = gateway(test_settings(), MockProvider::default());

    // No key -> 401.
    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        None,
        Some(json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UnauthorizedError");

    // Wrong owner -> indistinguishable from missing.
    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;
    let (status, body) = send(
        &gw.app,
        "GET",
        &format!("/v1/deployments/{id}"),
        Some("rpa_somebody_else_entirely"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "DeploymentNotFoundError");
}

#[tokio::test]
async fn request_validation_rejections() {
    let receiver = spawn_webhook_receiver(None).await;
    let gw = gateway(test_settings(), MockProvider::default());

    // Both model fields.
    let (status, body) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        Some(PROVIDER_KEY),
        Some(json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "model_name": "sd-turbo",
            "user_webhook_url": receiver.url,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");

    // Neither model field.
    let (status, _) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        Some(PROVIDER_KEY),
        Some(json!({ "user_webhook_url": receiver.url })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // S3 fields without private scope.
    let (status, _) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        Some(PROVIDER_KEY),
        Some(json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
            "user_s3_url": "s3://bucket/models",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Private scope without the credentials.
    let (status, _) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        Some(PROVIDER_KEY),
        Some(json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
            "cache_scope": "private",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Bad webhook URL.
    let (status, _) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        Some(PROVIDER_KEY),
        Some(json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": "not-a-url",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Model-name resolution path still works.
    let id = create_deployment(
        &gw,
        json!({
            "model_name": "flux-schnell",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;
    let (_, snapshot) = send(
        &gw.app,
        "GET",
        &format!("/v1/deployments/{id}"),
        Some(PROVIDER_KEY),
        None,
    )
    .await;
    assert_eq!(snapshot["model_id"], "black-forest-labs/FLUX.1-schnell");
}

#[tokio::test]
async fn rate_limit_returns_429_with_retry_after() {
    let receiver = spawn_webhook_receiver(None).await;
    let mut settings = test_settings();
    settings.rate_limit_per_minute = 2;
    let gw = gateway(settings, MockProvider::default());

    let body = json!({
        "hf_model_id": "stabilityai/sd-turbo",
        "user_webhook_url": receiver.url,
    });
    create_deployment(&gw, body.clone()).await;
    create_deployment(&gw, body.clone()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/deployments")
        .header("Authorization", format!("Bearer {PROVIDER_KEY}"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = gw.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
}

#[tokio::test]
async fn stream_emits_status_events_until_terminal() {
    let receiver = spawn_webhook_receiver(None).await;
    let gw = gateway(test_settings(), MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "black-forest-labs/FLUX.1-dev",
            "gpu_tier": "A10",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;
    // Terminal quickly: requested tier is too small.
    wait_for_status(&gw, &id, "failed", Duration::from_secs(2)).await;

    let request = Request::builder()
        .method("GET")
        .uri(format!("/v1/deployments/{id}/stream"))
        .header("Authorization", format!("Bearer {PROVIDER_KEY}"))
        .body(Body::empty())
        .unwrap();
    let response = gw.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .starts_with("text/event-stream"));

    // Terminal status means the stream ends after one event.
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("event: status"));
    assert!(text.contains("\"failed\""));
}

#[tokio::test]
async fn endpoint_reuse_returns_existing_deployment() {
    let receiver = spawn_webhook_receiver(None).await;
    let mut settings = test_settings();
    settings.enable_endpoint_reuse = true;
    let provider = MockProvider::default();
    provider.set_workers_ready(1);
    let gw = gateway(settings, provider);

    let body = json!({
        "hf_model_id": "stabilityai/sd-turbo",
        "user_webhook_url": receiver.url,
    });
    let id = create_deployment(&gw, body.clone()).await;
    wait_for_status(&gw, &id, "ready", Duration::from_secs(5)).await;

    // Identical fingerprint: no second endpoint is rented.
    let (status, reply) = send(
        &gw.app,
        "POST",
        "/v1/deployments",
        Some(PROVIDER_KEY),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(reply["deployment_id"], id.as_str());
    assert_eq!(reply["status"], "ready");
    assert_eq!(gw.provider.created_count(), 1);
}

#[tokio::test]
async fn internal_secret_guards_the_callback() {
    let receiver = spawn_webhook_receiver(None).await;
    let mut settings = test_settings();
    settings.internal_webhook_secret = "wk_secret".to_string();
    let gw = gateway(settings, MockProvider::default());

    let id = create_deployment(
        &gw,
        json!({
            "hf_model_id": "stabilityai/sd-turbo",
            "user_webhook_url": receiver.url,
        }),
    )
    .await;
    wait_for_status(&gw, &id, "downloading_model", Duration::from_secs(2)).await;

    // Missing secret -> rejected, status unchanged.
    let (status, _) = send(
        &gw.app,
        "POST",
        &format!("/internal/deployment-ready/{id}"),
        None,
        Some(json!({ "status": "ready" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Correct secret -> accepted.
    let request = Request::builder()
        .method("POST")
        .uri(format!("/internal/deployment-ready/{id}"))
        .header("Content-Type", "application/json")
        .header("X-Internal-Secret", "wk_secret")
        .body(Body::from(json!({ "status": "ready" }).to_string()))
        .unwrap();
    let response = gw.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    wait_for_status(&gw, &id, "ready", Duration::from_secs(2)).await;
}

#[tokio::test]
async fn health_and_readiness_probes() {
    let gw = gateway(test_settings(), MockProvider::default());

    let (status, body) = send(&gw.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = send(&gw.app, "GET", "/readiness", None, None).await;
    assert_eq!(status, StatusCode::OK);

    // Store trait object is shared with the router.
    gw.store.ping().await.unwrap();
}
