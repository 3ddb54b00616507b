//! Node observability metrics
//!
//! Prometheus-compatible metrics for the node lifecycle:
//! - Namespace lookups served by the orchestrator
//! - Connection verification outcomes and pool reopens
//! - Transaction retries absorbed by the retry strategy
//! - Restarts requested after rebinding
//! - Supervised worker failures

use crate::app::is_valid_namespace;
use std::time::Duration;

/// Label for a caller-supplied namespace. Rejected names share one label
/// so they cannot grow the label set.
pub fn namespace_label(namespace: &str) -> &str {
    if is_valid_namespace(namespace) {
        namespace
    } else {
        "invalid"
    }
}

/// Record the outcome of a `get_db` call
pub fn record_get_db(namespace: &str, status: &str) {
    metrics::counter!(
        "dbnode_get_db_requests_total",
        "namespace" => namespace_label(namespace).to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Record one verification cycle of a tracked database
pub fn record_verify(namespace: &str, success: bool, duration: Duration) {
    let result = if success { "ok" } else { "failed" };
    metrics::counter!(
        "dbnode_db_verify_total",
        "namespace" => namespace.to_string(),
        "result" => result,
    )
    .increment(1);

    metrics::histogram!(
        "dbnode_db_verify_duration_seconds",
        "namespace" => namespace.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a connection pool being reopened mid-verification
pub fn record_reopen(namespace: &str) {
    metrics::counter!(
        "dbnode_db_reopen_total",
        "namespace" => namespace.to_string(),
    )
    .increment(1);
}

/// Record a retried transient failure
pub fn record_txn_retry(error_type: &str) {
    metrics::counter!(
        "dbnode_txn_retries_total",
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record a restart of the node orchestrator
pub fn record_restart(reason: &str) {
    metrics::counter!(
        "dbnode_restarts_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}

/// Update the number of running tracked databases
pub fn set_tracked_dbs(count: usize) {
    metrics::gauge!("dbnode_tracked_dbs").set(count as f64);
}

/// Record a supervised worker exiting with an error
pub fn record_worker_failure(name: &str, fatal: bool) {
    metrics::counter!(
        "dbnode_worker_failures_total",
        "worker" => name.to_string(),
        "fatal" => if fatal { "true" } else { "false" },
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_label() {
        assert_eq!(namespace_label("controller"), "controller");
        assert_eq!(namespace_label("model-0b7d"), "model-0b7d");
        assert_eq!(namespace_label("../escape"), "invalid");
        assert_eq!(namespace_label(""), "invalid");
        assert_eq!(namespace_label(&"x".repeat(500)), "invalid");
    }
}
