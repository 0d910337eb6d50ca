//! Prometheus metrics for the agent loop
//!
//! All metrics live in the default registry; [`gather_text`] renders them in
//! the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Encoder, Histogram,
    HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished requests by how the loop ended.
    ///
    /// Labels:
    /// - outcome: completed | round_limit | timeout | sandbox_unavailable | disconnected | failed
    pub static ref REQUESTS: IntCounterVec = register_int_counter_vec!(
        "pyagent_requests_total",
        "Agent requests by loop outcome",
        &["outcome"]
    ).expect("failed to register REQUESTS metric");

    /// Rounds started per request.
    pub static ref ROUNDS: Histogram = register_histogram!(
        "pyagent_rounds",
        "Rounds executed per agent request",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0]
    ).expect("failed to register ROUNDS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sandbox invocations.
    ///
    /// Labels:
    /// - status: success | error | timeout | unavailable
    pub static ref CODE_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "pyagent_code_executions_total",
        "Sandbox executions by status",
        &["status"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    pub static ref CODE_EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "pyagent_code_execution_duration_seconds",
        "Wall-clock duration of sandbox executions",
        &["status"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Upstream model and artifacts
    // ─────────────────────────────────────────────────────────────────────────────

    /// Time spent consuming one streamed reply (until end or early stop).
    pub static ref MODEL_STREAM_DURATION: HistogramVec = register_histogram_vec!(
        "pyagent_model_stream_duration_seconds",
        "Duration of streamed model replies",
        &["model"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register MODEL_STREAM_DURATION metric");

    /// Image uploads.
    ///
    /// Labels:
    /// - status: success | error
    pub static ref ARTIFACT_UPLOADS: IntCounterVec = register_int_counter_vec!(
        "pyagent_artifact_uploads_total",
        "Image uploads by status",
        &["status"]
    ).expect("failed to register ARTIFACT_UPLOADS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text_includes_touched_metrics() {
        REQUESTS.with_label_values(&["completed"]).inc();
        CODE_EXECUTIONS.with_label_values(&["success"]).inc();
        ROUNDS.observe(1.0);

        let text = gather_text();
        assert!(text.contains("pyagent_requests_total{outcome=\"completed\"}"));
        assert!(text.contains("pyagent_code_executions_total{status=\"success\"}"));
        assert!(text.contains("pyagent_rounds_bucket"));
    }
}
