//! Service middleware for request metrics.
//!
//! ## Metrics Exposed
//!
//! - `request` - path pattern, method, status and latency of every request
//! - `submission` - outcome of every answer submission
//! - `session_transition` - abandon / resume / close / completion events

use std::sync::OnceLock;
use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use regex_lite::Regex;
use tracing::info;

/// Metrics middleware that records request counts and latency.
///
/// Uses tracing events on target `flow_kernel::metrics`; aggregation happens
/// downstream from the logs.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    info!(
        target: "flow_kernel::metrics",
        metric_type = "request",
        path = %path,
        method = %method,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request_metric"
    );

    response
}

/// Normalize path for metrics to avoid high cardinality.
///
/// Replaces UUIDs (form, session ids) with `:id`.
fn normalize_path(path: &str) -> String {
    static UUID: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = UUID.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").ok()
    });
    match pattern {
        Some(re) => re.replace_all(path, ":id").into_owned(),
        None => path.to_string(),
    }
}

/// Record the outcome of one answer submission.
pub fn record_submission(corrected: bool, invalid: bool, invalidated: usize, completed: bool) {
    let result = if invalid {
        "invalid"
    } else if corrected {
        "corrected"
    } else {
        "accepted"
    };
    info!(
        target: "flow_kernel::metrics",
        metric_type = "submission",
        result = result,
        invalidated = invalidated,
        completed = completed,
        "submission_metric"
    );
}

/// Record a session status change.
pub fn record_session_transition(transition: &str) {
    info!(
        target: "flow_kernel::metrics",
        metric_type = "session_transition",
        transition = transition,
        "session_transition_metric"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_replaces_uuid() {
        let path = "/api/sessions/550e8400-e29b-41d4-a716-446655440000/answers";
        assert_eq!(normalize_path(path), "/api/sessions/:id/answers");
    }

    #[test]
    fn test_normalize_path_preserves_regular_path() {
        assert_eq!(normalize_path("/health/live"), "/health/live");
    }
}
