//! # visgate
//!
//! Stateless orchestration gateway: one request turns a Hugging Face
//! diffusion-model id plus a caller-supplied GPU-provider key into a running
//! serverless inference endpoint. The request returns 202 immediately; a
//! background engine task drives the deployment through its lifecycle and
//! the caller is notified by webhook (and can poll or stream status).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         visgate                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Routes (axum)                                      │  │
//! │  │ - auth header -> owner hash, rate limit            │  │
//! │  │ - POST create -> store doc -> spawn engine -> 202  │  │
//! │  │ - GET / DELETE / SSE stream / worker callback      │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Engine (one task per deployment)                   │  │
//! │  │ validate -> size -> select GPU -> create endpoint  │  │
//! │  │ (capacity fallback) -> readiness -> webhook        │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │        │                │                   │            │
//! │   HF Validator    Provider Adapter     Store (CAS)       │
//! │   (Hub API)       (RunPod GraphQL)     redis / memory    │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod entities;
pub mod error;
pub mod estimator;
pub mod gpu;
pub mod hf;
pub mod limiter;
pub mod mask;
pub mod monitor;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod routes;
pub mod selector;
pub mod store;
pub mod telemetry;
pub mod webhook;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tracing::info;

pub use config::Settings;
pub use engine::{DeploymentSecrets, Engine};
pub use entities::{CacheScope, Deployment, DeploymentStatus, LogEntry, LogLevel};
pub use error::VisgateError;
pub use provider::{GpuProvider, RunpodProvider};
pub use store::{DeploymentStore, MemoryStore, RedisStore};

/// Build the engine and router for the given settings, selecting the store
/// implementation at runtime.
pub async fn build_app(settings: Settings) -> Result<(Router, Arc<Engine>)> {
    let store: Arc<dyn DeploymentStore> = if settings.use_redis_store() {
        info!("Using Redis deployment store");
        Arc::new(RedisStore::connect(&settings.redis_url, &settings.store_prefix).await?)
    } else {
        info!("Using in-memory deployment store");
        Arc::new(MemoryStore::new())
    };

    let provider: Arc<dyn GpuProvider> = Arc::new(RunpodProvider::new(
        settings.runpod_graphql_url.clone(),
        settings.provider_create_timeout,
        settings.provider_poll_timeout,
    ));

    Ok(build_app_with(settings, store, provider))
}

/// Build with explicit store and provider (the seam tests use).
pub fn build_app_with(
    settings: Settings,
    store: Arc<dyn DeploymentStore>,
    provider: Arc<dyn GpuProvider>,
) -> (Router, Arc<Engine>) {
    let engine = Arc::new(Engine::new(store, provider, settings));
    let app = routes::router(Arc::clone(&engine));
    (app, engine)
}
