//! HTTP surface: a thin adapter over the engine.
//!
//! Handlers validate and authenticate, hand work to the engine, and read
//! state back out of the store. No lifecycle logic lives here.

mod deployments;
mod health;
mod internal;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::engine::Engine;
use crate::error::VisgateError;
use crate::limiter::RateLimiter;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub limiter: Arc<RateLimiter>,
}

/// Build the complete router.
pub fn router(engine: Arc<Engine>) -> Router {
    let limiter = Arc::new(RateLimiter::new(
        engine.settings().rate_limit_per_minute,
    ));
    let state = AppState { engine, limiter };

    Router::new()
        .route("/v1/deployments", post(deployments::create))
        .route("/v1/deployments/{id}", get(deployments::get_one))
        .route("/v1/deployments/{id}", delete(deployments::delete_one))
        .route("/v1/deployments/{id}/stream", get(deployments::stream))
        .route(
            "/internal/deployment-ready/{id}",
            post(internal::deployment_ready),
        )
        .route("/health", get(health::health))
        .route("/readiness", get(health::readiness))
        .with_state(state)
}

/// Extract the caller's provider key from `Authorization: Bearer` or
/// `X-Provider-Api-Key`.
pub(crate) fn provider_key(headers: &HeaderMap) -> Result<String, VisgateError> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ").map(str::trim) {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
    }
    if let Some(value) = headers
        .get("x-provider-api-key")
        .and_then(|v| v.to_str().ok())
    {
        let key = value.trim();
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    Err(VisgateError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer rpa_abc123"),
        );
        assert_eq!(provider_key(&headers).unwrap(), "rpa_abc123");
    }

    #[test]
    fn fallback_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-provider-api-key", HeaderValue::from_static("rpa_xyz"));
        assert_eq!(provider_key(&headers).unwrap(), "rpa_xyz");
    }

    #[test]
    fn missing_key_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(matches!(
            provider_key(&headers),
            Err(VisgateError::Unauthorized)
        ));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert!(matches!(
            provider_key(&headers),
            Err(VisgateError::Unauthorized)
        ));
    }
}
