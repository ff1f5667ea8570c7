//! Runtime settings loaded from the environment.

use std::time::Duration;

/// All recognized configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Redis connection URL. Empty means the in-memory store is used.
    pub redis_url: String,
    /// Force the in-memory store even when `redis_url` is set.
    pub use_memory_repo: bool,
    /// Key prefix for namespace isolation of store collections.
    pub store_prefix: String,

    /// RunPod GraphQL API endpoint.
    pub runpod_graphql_url: String,
    /// Serverless template carrying the inference image.
    pub runpod_template_id: String,
    /// Worker image tag (informational; the template pins the image).
    pub docker_image: String,
    pub workers_min: u32,
    pub workers_max: u32,
    pub idle_timeout_seconds: u32,
    pub scaler_type: String,
    pub scaler_value: u32,

    /// Base URL of this service, used to build the worker callback URL.
    pub internal_webhook_base_url: String,
    /// Shared secret the worker must echo in `X-Internal-Secret`.
    pub internal_webhook_secret: String,

    /// Hugging Face Hub API base URL (overridable for tests).
    pub hf_api_base_url: String,

    // Platform-managed shared weight cache (optional).
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_endpoint_url: String,
    pub s3_model_url: String,
    /// Comma-separated model ids allowed to use the shared cache.
    pub shared_cache_allowed_models: String,
    /// Reject (rather than silently downgrade) unlisted shared-cache requests.
    pub shared_cache_reject_unlisted: bool,

    /// Reuse a ready endpoint for an identical (owner, model, tier) request.
    pub enable_endpoint_reuse: bool,

    pub rate_limit_per_minute: u32,
    /// Total budget for {creating, downloading, loading} before `timeout`.
    pub deployment_timeout: Duration,
    pub readiness_poll_interval: Duration,
    /// Consecutive ready observations required on the polling path.
    pub readiness_stable_window: u32,
    pub hf_timeout: Duration,
    pub provider_create_timeout: Duration,
    pub provider_poll_timeout: Duration,
    pub webhook_timeout: Duration,
    pub webhook_connect_timeout: Duration,
    pub webhook_max_retries: u32,

    pub port: u16,
    /// Prometheus exporter port (0 to disable).
    pub metrics_port: u16,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            use_memory_repo: false,
            store_prefix: String::new(),
            runpod_graphql_url: "https://api.runpod.io/graphql".to_string(),
            runpod_template_id: String::new(),
            docker_image: "visgate/inference:latest".to_string(),
            workers_min: 0,
            workers_max: 3,
            idle_timeout_seconds: 120,
            scaler_type: "QUEUE_DELAY".to_string(),
            scaler_value: 1,
            internal_webhook_base_url: String::new(),
            internal_webhook_secret: String::new(),
            hf_api_base_url: "https://huggingface.co".to_string(),
            aws_access_key_id: String::new(),
            aws_secret_access_key: String::new(),
            aws_endpoint_url: String::new(),
            s3_model_url: String::new(),
            shared_cache_allowed_models: String::new(),
            shared_cache_reject_unlisted: false,
            enable_endpoint_reuse: false,
            rate_limit_per_minute: 100,
            deployment_timeout: Duration::from_secs(20 * 60),
            readiness_poll_interval: Duration::from_secs(5),
            readiness_stable_window: 2,
            hf_timeout: Duration::from_secs(10),
            provider_create_timeout: Duration::from_secs(30),
            provider_poll_timeout: Duration::from_secs(15),
            webhook_timeout: Duration::from_secs(30),
            webhook_connect_timeout: Duration::from_secs(10),
            webhook_max_retries: 3,
            port: 8000,
            metrics_port: 0,
            log_level: "INFO".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            redis_url: env_string("REDIS_URL", &defaults.redis_url),
            use_memory_repo: env_bool("USE_MEMORY_REPO", defaults.use_memory_repo),
            store_prefix: env_string("STORE_PREFIX", &defaults.store_prefix),
            runpod_graphql_url: env_string("RUNPOD_GRAPHQL_URL", &defaults.runpod_graphql_url),
            runpod_template_id: env_string("RUNPOD_TEMPLATE_ID", &defaults.runpod_template_id),
            docker_image: env_string("DOCKER_IMAGE", &defaults.docker_image),
            workers_min: env_parse("RUNPOD_WORKERS_MIN", defaults.workers_min),
            workers_max: env_parse("RUNPOD_WORKERS_MAX", defaults.workers_max),
            idle_timeout_seconds: env_parse(
                "RUNPOD_IDLE_TIMEOUT_SECONDS",
                defaults.idle_timeout_seconds,
            ),
            scaler_type: env_string("RUNPOD_SCALER_TYPE", &defaults.scaler_type),
            scaler_value: env_parse("RUNPOD_SCALER_VALUE", defaults.scaler_value),
            internal_webhook_base_url: env_string(
                "INTERNAL_WEBHOOK_BASE_URL",
                &defaults.internal_webhook_base_url,
            ),
            internal_webhook_secret: env_string(
                "INTERNAL_WEBHOOK_SECRET",
                &defaults.internal_webhook_secret,
            ),
            hf_api_base_url: env_string("HF_API_BASE_URL", &defaults.hf_api_base_url),
            aws_access_key_id: env_string("AWS_ACCESS_KEY_ID", &defaults.aws_access_key_id),
            aws_secret_access_key: env_string(
                "AWS_SECRET_ACCESS_KEY",
                &defaults.aws_secret_access_key,
            ),
            aws_endpoint_url: env_string("AWS_ENDPOINT_URL", &defaults.aws_endpoint_url),
            s3_model_url: env_string("S3_MODEL_URL", &defaults.s3_model_url),
            shared_cache_allowed_models: env_string(
                "SHARED_CACHE_ALLOWED_MODELS",
                &defaults.shared_cache_allowed_models,
            ),
            shared_cache_reject_unlisted: env_bool(
                "SHARED_CACHE_REJECT_UNLISTED",
                defaults.shared_cache_reject_unlisted,
            ),
            enable_endpoint_reuse: env_bool(
                "ENABLE_ENDPOINT_REUSE",
                defaults.enable_endpoint_reuse,
            ),
            rate_limit_per_minute: env_parse(
                "RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            ),
            deployment_timeout: Duration::from_secs(env_parse(
                "DEPLOYMENT_TIMEOUT_SECONDS",
                defaults.deployment_timeout.as_secs(),
            )),
            readiness_poll_interval: Duration::from_secs(env_parse(
                "READINESS_POLL_SECONDS",
                defaults.readiness_poll_interval.as_secs(),
            )),
            readiness_stable_window: env_parse(
                "READINESS_STABLE_WINDOW",
                defaults.readiness_stable_window,
            ),
            hf_timeout: Duration::from_secs(env_parse(
                "HF_TIMEOUT_SECONDS",
                defaults.hf_timeout.as_secs(),
            )),
            provider_create_timeout: defaults.provider_create_timeout,
            provider_poll_timeout: defaults.provider_poll_timeout,
            webhook_timeout: Duration::from_secs(env_parse(
                "WEBHOOK_TIMEOUT_SECONDS",
                defaults.webhook_timeout.as_secs(),
            )),
            webhook_connect_timeout: defaults.webhook_connect_timeout,
            webhook_max_retries: env_parse("WEBHOOK_MAX_RETRIES", defaults.webhook_max_retries),
            port: env_parse("PORT", defaults.port),
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port),
            log_level: env_string("LOG_LEVEL", &defaults.log_level),
        }
    }

    /// Whether the durable store should be used.
    pub fn use_redis_store(&self) -> bool {
        !self.redis_url.is_empty() && !self.use_memory_repo
    }

    /// Models allowed to use the platform shared cache.
    pub fn shared_cache_allowlist(&self) -> Vec<String> {
        self.shared_cache_allowed_models
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Worker callback URL for a deployment, or `None` when the base URL is
    /// unset (polling remains the only readiness path).
    pub fn internal_callback_url(&self, deployment_id: &str) -> Option<String> {
        if self.internal_webhook_base_url.is_empty() {
            return None;
        }
        let base = self.internal_webhook_base_url.trim_end_matches('/');
        Some(format!("{base}/internal/deployment-ready/{deployment_id}"))
    }
}

fn env_string(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
