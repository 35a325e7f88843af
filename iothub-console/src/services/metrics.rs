//! Metrics collection and Prometheus export.
//!
//! Installs the Prometheus recorder and records confirmation-poll outcomes.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics recorder.
///
/// Call once at startup before any metrics are recorded. Later calls are
/// no-ops, so several test applications can share one process.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "Global recorder already installed, metrics stay local");
            PrometheusBuilder::new().build_recorder().handle()
        }
    });
}

/// Get the current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// Record one finished confirmation poll.
pub fn record_reconcile(operation: &'static str, outcome: &str, attempts: u32, elapsed: Duration) {
    let outcome = outcome.to_string();
    counter!(
        "reconcile_outcomes_total",
        "operation" => operation,
        "outcome" => outcome.clone()
    )
    .increment(1);
    counter!("reconcile_attempts_total", "operation" => operation).increment(u64::from(attempts));
    histogram!(
        "reconcile_duration_seconds",
        "operation" => operation,
        "outcome" => outcome
    )
    .record(elapsed.as_secs_f64());
}
