// Telemetry module for structured logging and metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// RUST_LOG overrides `log_level`. The human-readable formatter suits an
/// operator console; `json` switches to one JSON object per event.
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .compact()
            .with_filter(env_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::debug!(log_level = log_level, json = json, "Structured logging initialized");
    describe_metrics();
    Ok(())
}

/// Register metric descriptions with whatever recorder is installed
fn describe_metrics() {
    describe_counter!("workflow_success_total", "Workflows that completed");
    describe_counter!("workflow_failed_total", "Workflows aborted by a fatal step");
    describe_histogram!("workflow_duration_seconds", "Duration of workflow runs in seconds");
    describe_counter!(
        "workflow_step_suppressed_total",
        "Best-effort steps whose failure was logged and ignored"
    );
    describe_counter!("transfer_bytes_total", "Bytes uploaded to remote hosts");
}

#[inline]
pub fn record_workflow_success(workflow: &str) {
    counter!("workflow_success_total", "workflow" => workflow.to_string()).increment(1);
}

#[inline]
pub fn record_workflow_failure(workflow: &str, reason: &str) {
    counter!(
        "workflow_failed_total",
        "workflow" => workflow.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_workflow_duration(workflow: &str, duration_seconds: f64) {
    histogram!("workflow_duration_seconds", "workflow" => workflow.to_string())
        .record(duration_seconds);
}

#[inline]
pub fn record_step_suppressed(workflow: &str) {
    counter!("workflow_step_suppressed_total", "workflow" => workflow.to_string()).increment(1);
}

#[inline]
pub fn record_transfer_bytes(host: &str, bytes: u64) {
    counter!("transfer_bytes_total", "host" => host.to_string()).increment(bytes);
}
