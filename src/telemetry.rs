//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus recorder, registers
//! human-readable descriptions and builds the router that serves them.

use axum::{Router, extract::State, routing::get};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works:
/// the `metrics` macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Router serving `GET /metrics` in the Prometheus text format.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .with_state(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn describe() {
    describe_counter!(
        "gpumode_switch_total",
        "Mode switches attempted, labelled by target mode and outcome"
    );
    describe_histogram!(
        "gpumode_switch_duration_seconds",
        "Wall-clock duration of mode switches (pre-flight + stop + settle + start)"
    );
    describe_counter!("gpumode_rollback_total", "Rollbacks to the pre-switch mode");
    describe_counter!(
        "gpumode_container_command_retries_total",
        "Container start/stop/restart commands retried after a failure"
    );
    describe_counter!(
        "gpumode_side_effect_failures_total",
        "Side-effect scripts that could not be spawned or exited non-zero"
    );
}
