//! Client-side metrics
//!
//! Only the `metrics` facade is used; installing a recorder/exporter is left
//! to the embedding application.

use std::time::Duration;

/// Record a finished inference call
pub fn record_inference(model: &str, outcome: &'static str, latency: Duration) {
    metrics::counter!("infer_client_requests_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("infer_client_request_duration_seconds",
        "model" => model.to_string()
    )
    .record(latency.as_secs_f64());
}

/// Record the end of a readiness wait
pub fn record_readiness(model: &str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!("infer_client_readiness_waits_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("infer_client_readiness_wait_seconds",
        "model" => model.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Update the in-flight request gauge of a futures client
pub fn update_in_flight(model: &str, count: usize) {
    metrics::gauge!("infer_client_in_flight_requests",
        "model" => model.to_string()
    )
    .set(count as f64);
}

/// Short outcome label for an inference or readiness result
pub fn outcome<T>(result: &crate::error::ClientResult<T>) -> &'static str {
    use crate::error::ClientError;
    match result {
        Ok(_) => "success",
        Err(ClientError::Timeout { .. }) => "timeout",
        Err(ClientError::ModelUnavailable { .. }) => "unavailable",
        Err(ClientError::Closed(_)) | Err(ClientError::Cancelled) => "cancelled",
        Err(_) => "error",
    }
}
