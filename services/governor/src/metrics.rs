//! Prometheus metrics exposition
//!
//! The libraries emit through the `metrics` facade; this module installs the
//! Prometheus recorder and describes what they emit:
//!
//! - `credential_pool_acquire_total` (counter): labels `platform`, `tier`, `outcome`
//! - `credential_pool_cooldowns_total` (counter): labels `platform`, `category`
//! - `rate_limiter_decisions_total` (counter): label `outcome`
//! - `cache_fail_open_total` (counter): label `component`
//! - `admin_requests_total` (counter): labels `route`, `status`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition format
/// suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    describe();
    handle
}

/// Register help text with the current recorder.
pub fn describe() {
    metrics::describe_counter!(
        "credential_pool_acquire_total",
        "Credential acquisitions by outcome (durable, environment, exhausted, store_error)"
    );
    metrics::describe_counter!(
        "credential_pool_cooldowns_total",
        "Cooldowns written after rate-limit or authentication failures"
    );
    metrics::describe_counter!(
        "rate_limiter_decisions_total",
        "Rate limit decisions by outcome (allowed, limited, fail_open, timeout)"
    );
    metrics::describe_counter!(
        "cache_fail_open_total",
        "Operations that proceeded without the shared cache because it was unreachable"
    );
    metrics::describe_counter!(
        "admin_requests_total",
        "Admin API requests by route and status"
    );
}

/// Record a completed admin request.
pub fn record_admin_request(route: &'static str, status: u16) {
    metrics::counter!("admin_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
}
