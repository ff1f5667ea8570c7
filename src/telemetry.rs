//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase with the `metrics` crate's
//! macros; this module installs the exporter and registers human-readable
//! descriptions.

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// several app builds share a process); recording still works through
/// whichever recorder won.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!(
        "visgate_deployments_created_total",
        "Deployment requests accepted"
    );
    describe_counter!(
        "visgate_deployments_ready_total",
        "Deployments that reached ready"
    );
    describe_counter!(
        "visgate_deployments_failed_total",
        "Deployments that ended in failed, by error kind"
    );
    describe_counter!(
        "visgate_deployments_timed_out_total",
        "Deployments that exhausted the readiness budget"
    );
    describe_histogram!(
        "visgate_deployment_ready_duration_seconds",
        "Wall-clock time from acceptance to ready"
    );
    describe_counter!(
        "visgate_capacity_fallbacks_total",
        "Endpoint creations retried on the next GPU tier"
    );
    describe_counter!(
        "visgate_provider_api_errors_total",
        "Provider API calls that returned an error"
    );
    describe_counter!(
        "visgate_webhook_failures_total",
        "User webhook deliveries that exhausted retries"
    );
    describe_counter!(
        "visgate_rate_limited_total",
        "Requests rejected by the per-owner rate limit"
    );
}
