//! Prometheus metrics for engine observability.

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a job state transition.
pub fn job_status_changed(status: &str) {
    counter!("conveyor_jobs_total", "status" => status.to_string()).increment(1);
}

/// Record total job duration.
pub fn job_duration(seconds: f64) {
    histogram!("conveyor_job_duration_seconds").record(seconds);
}

/// Record step duration.
pub fn step_duration(source: &str, seconds: f64) {
    histogram!("conveyor_step_duration_seconds", "source" => source.to_string()).record(seconds);
}
