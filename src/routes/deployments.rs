//! Deployment CRUD and the status event stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{provider_key, AppState};
use crate::engine::DeploymentSecrets;
use crate::entities::{
    generate_deployment_id, owner_hash, Attempt, CacheScope, Deployment, DeploymentError,
    DeploymentStatus, LogEntry, S3CacheCredentials,
};
use crate::error::VisgateError;
use crate::resolver::resolve_model_name;
use crate::store::StoreError;

const LOG_SNAPSHOT_LIMIT: usize = 100;
const ESTIMATED_READY_SECONDS: u32 = 180;

/// `POST /v1/deployments` body.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    #[serde(default)]
    pub hf_model_id: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    pub user_webhook_url: String,
    #[serde(default)]
    pub gpu_tier: Option<String>,
    #[serde(default)]
    pub hf_token: Option<String>,
    #[serde(default)]
    pub cache_scope: Option<CacheScope>,
    #[serde(default)]
    pub user_s3_url: Option<String>,
    #[serde(default)]
    pub user_aws_access_key_id: Option<String>,
    #[serde(default)]
    pub user_aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub user_aws_endpoint_url: Option<String>,
}

/// 202 Accepted body.
#[derive(Debug, Serialize)]
pub struct DeploymentAccepted {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub model_id: String,
    pub estimated_ready_seconds: u32,
    pub webhook_url: String,
    pub created_at: DateTime<Utc>,
}

/// `GET /v1/deployments/{id}` body.
#[derive(Debug, Serialize)]
pub struct DeploymentSnapshot {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_allocated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_vram_gb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    pub logs: Vec<LogEntry>,
    pub error: Option<DeploymentError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
}

fn snapshot(dep: Deployment, logs: Vec<LogEntry>) -> DeploymentSnapshot {
    DeploymentSnapshot {
        deployment_id: dep.id,
        status: dep.status,
        model_id: dep.model_id,
        requested_tier: dep.requested_tier,
        resolved_tier: dep.resolved_tier,
        gpu_allocated: dep.gpu_allocated,
        min_vram_gb: dep.min_vram_gb,
        endpoint_id: dep.endpoint_id,
        endpoint_url: dep.endpoint_url,
        logs,
        error: dep.error,
        created_at: dep.created_at,
        updated_at: dep.updated_at,
        ready_at: dep.ready_at,
        attempts: dep.attempts,
    }
}

/// Resolve the model id: exactly one of `hf_model_id` / `model_name`.
fn resolve_model(body: &CreateDeploymentRequest) -> Result<String, VisgateError> {
    match (&body.hf_model_id, &body.model_name) {
        (Some(_), Some(_)) => Err(VisgateError::Validation(
            "Provide either hf_model_id or model_name (+ optional provider), not both".into(),
        )),
        (Some(id), None) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        (None, Some(name)) => resolve_model_name(name, body.provider.as_deref()),
        _ => Err(VisgateError::Validation(
            "Provide either hf_model_id or model_name (+ optional provider)".into(),
        )),
    }
}

/// Validate cache scope and S3 field pairing, returning the effective scope
/// and the caller's private credentials when applicable.
fn resolve_cache(
    body: &CreateDeploymentRequest,
    model_id: &str,
    settings: &crate::config::Settings,
) -> Result<(CacheScope, Option<S3CacheCredentials>), VisgateError> {
    let scope = body.cache_scope.unwrap_or_default();
    let has_s3_fields = body.user_s3_url.is_some()
        || body.user_aws_access_key_id.is_some()
        || body.user_aws_secret_access_key.is_some()
        || body.user_aws_endpoint_url.is_some();

    match scope {
        CacheScope::Private => {
            let (Some(url), Some(access), Some(secret)) = (
                body.user_s3_url.as_deref(),
                body.user_aws_access_key_id.as_deref(),
                body.user_aws_secret_access_key.as_deref(),
            ) else {
                return Err(VisgateError::Validation(
                    "cache_scope=private requires user_s3_url, user_aws_access_key_id and user_aws_secret_access_key".into(),
                ));
            };
            Ok((
                CacheScope::Private,
                Some(S3CacheCredentials {
                    access_key_id: access.to_string(),
                    secret_access_key: secret.to_string(),
                    endpoint_url: body.user_aws_endpoint_url.clone(),
                    model_url: url.to_string(),
                }),
            ))
        }
        _ if has_s3_fields => Err(VisgateError::Validation(
            "S3 cache fields are only valid with cache_scope=private".into(),
        )),
        CacheScope::Shared => {
            let allowed = settings.shared_cache_allowlist();
            if allowed.iter().any(|m| m == model_id) {
                Ok((CacheScope::Shared, None))
            } else if settings.shared_cache_reject_unlisted {
                Err(VisgateError::Validation(format!(
                    "Model {model_id} is not enabled for the shared cache"
                )))
            } else {
                debug!(model_id, "Model not in shared cache allowlist; cache disabled");
                Ok((CacheScope::Off, None))
            }
        }
        CacheScope::Off => Ok((CacheScope::Off, None)),
    }
}

fn validate_webhook_url(url: &str) -> Result<(), VisgateError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| VisgateError::Validation("user_webhook_url is not a valid URL".into()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(VisgateError::Validation(
            "user_webhook_url must be http or https".into(),
        ));
    }
    Ok(())
}

/// `POST /v1/deployments`: accept, persist, spawn the engine task, 202.
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentAccepted>), VisgateError> {
    let key = provider_key(&headers)?;
    let owner = owner_hash(&key);

    if let Err(retry_after_seconds) = state.limiter.check(&owner) {
        counter!("visgate_rate_limited_total").increment(1);
        return Err(VisgateError::RateLimited {
            retry_after_seconds,
        });
    }

    let model_id = resolve_model(&body)?;
    validate_webhook_url(&body.user_webhook_url)?;
    let settings = state.engine.settings();
    let (cache_scope, private_s3) = resolve_cache(&body, &model_id, settings)?;

    if let Some(tier) = body.gpu_tier.as_deref() {
        // A typo'd hint is tolerated later (cost-order fallback), but an
        // empty one is a malformed request.
        if tier.trim().is_empty() {
            return Err(VisgateError::Validation("gpu_tier must not be empty".into()));
        }
    }

    // Optional reuse: hand back an existing live deployment with the same
    // fingerprint instead of renting another GPU.
    if settings.enable_endpoint_reuse {
        if let Ok(Some(existing)) = state
            .engine
            .store()
            .find_reusable(&owner, &model_id, body.gpu_tier.as_deref())
            .await
        {
            info!(deployment_id = %existing.id, "Reusing existing deployment");
            return Ok((
                StatusCode::ACCEPTED,
                Json(DeploymentAccepted {
                    deployment_id: existing.id,
                    status: existing.status,
                    model_id: existing.model_id,
                    estimated_ready_seconds: 0,
                    webhook_url: existing.webhook_url,
                    created_at: existing.created_at,
                }),
            ));
        }
    }

    let now = Utc::now();
    let id = generate_deployment_id(now);
    let mut dep = Deployment::new(
        id.clone(),
        owner,
        model_id.clone(),
        body.user_webhook_url.clone(),
        now,
    );
    dep.provider_hint = body.provider.clone();
    dep.model_name_alias = body.model_name.clone();
    dep.requested_tier = body.gpu_tier.clone();
    dep.cache_scope = cache_scope;

    state
        .engine
        .store()
        .create(&dep)
        .await
        .map_err(|e| VisgateError::Store(e.to_string()))?;

    state.engine.spawn(
        id.clone(),
        DeploymentSecrets {
            provider_key: key,
            hf_token: body.hf_token.clone(),
            private_s3,
        },
    );

    counter!("visgate_deployments_created_total").increment(1);
    info!(deployment_id = %id, %model_id, "Deployment accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(DeploymentAccepted {
            deployment_id: id,
            status: DeploymentStatus::Validating,
            model_id,
            estimated_ready_seconds: ESTIMATED_READY_SECONDS,
            webhook_url: body.user_webhook_url,
            created_at: now,
        }),
    ))
}

/// `GET /v1/deployments/{id}`: snapshot with the last 100 log entries.
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeploymentSnapshot>, VisgateError> {
    let key = provider_key(&headers)?;
    let store = state.engine.store();

    let dep = match store.get(&id, &owner_hash(&key)).await {
        Ok(dep) => dep,
        Err(StoreError::NotFound(_)) => return Err(VisgateError::DeploymentNotFound(id)),
        Err(e) => return Err(VisgateError::Store(e.to_string())),
    };
    let logs = store
        .logs(&id, LOG_SNAPSHOT_LIMIT)
        .await
        .map_err(|e| VisgateError::Store(e.to_string()))?;

    Ok(Json(snapshot(dep, logs)))
}

/// `DELETE /v1/deployments/{id}`: idempotent delete, 204.
pub async fn delete_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, VisgateError> {
    let key = provider_key(&headers)?;
    state.engine.delete(&id, &owner_hash(&key), &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/deployments/{id}/stream`: SSE of status transitions until a
/// terminal status is emitted.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, VisgateError> {
    let key = provider_key(&headers)?;
    let owner = owner_hash(&key);
    let store = state.engine.store().clone();

    // Ownership check up front; afterwards the stream polls by id.
    match store.get(&id, &owner).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => return Err(VisgateError::DeploymentNotFound(id)),
        Err(e) => return Err(VisgateError::Store(e.to_string())),
    }

    struct StreamState {
        store: std::sync::Arc<dyn crate::store::DeploymentStore>,
        id: String,
        last: Option<DeploymentStatus>,
        done: bool,
    }

    let initial = StreamState {
        store,
        id,
        last: None,
        done: false,
    };

    let stream = futures_util::stream::unfold(initial, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            if st.last.is_some() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let dep = match st.store.fetch(&st.id).await {
                Ok(dep) => dep,
                Err(_) => {
                    st.done = true;
                    return None;
                }
            };
            if st.last == Some(dep.status) {
                continue;
            }
            st.last = Some(dep.status);
            if dep.status.is_terminal() {
                st.done = true;
            }
            let data = json!({
                "deployment_id": dep.id,
                "status": dep.status,
                "updated_at": dep.updated_at,
            })
            .to_string();
            let event = Event::default().event("status").data(data);
            return Some((Ok(event), st));
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
