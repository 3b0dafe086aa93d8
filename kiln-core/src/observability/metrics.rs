//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration
//! - `_bytes` suffix for sizes
//!
//! Without an installed recorder these calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Build metrics
    describe_histogram!("kiln_build_duration_seconds", "Build duration (by outcome)");
    describe_counter!("kiln_build_failures_total", "Total number of failed builds (by error kind)");
    describe_histogram!(
        "kiln_platform_build_duration_seconds",
        "Per-platform build duration (by platform)"
    );

    // Operation metrics
    describe_counter!("kiln_operations_total", "Operations dispatched (by type, outcome)");
    describe_histogram!("kiln_operation_duration_seconds", "Operation duration (by type)");

    // Cache metrics
    describe_counter!("kiln_cache_lookups_total", "Cache lookups (by result: hit, miss)");
    describe_counter!("kiln_cache_pruned_entries_total", "Cache entries removed by pruning");
    describe_counter!("kiln_cache_pruned_bytes_total", "Bytes freed by cache pruning");

    // Resource metrics
    describe_gauge!("kiln_op_capacity", "Current operation permit capacity");
    describe_gauge!("kiln_active_operations", "Operations currently holding a permit");
}

pub fn record_build(duration_secs: f64, success: bool, error_kind: Option<&str>) {
    let outcome = if success { "success" } else { "failure" };
    histogram!("kiln_build_duration_seconds", "outcome" => outcome).record(duration_secs);
    if let Some(kind) = error_kind {
        counter!("kiln_build_failures_total", "kind" => kind.to_string()).increment(1);
    }
}

pub fn record_platform_build(platform: &str, duration_secs: f64) {
    histogram!("kiln_platform_build_duration_seconds", "platform" => platform.to_string())
        .record(duration_secs);
}

pub fn record_operation(op_type: &str, outcome: &str, duration_secs: f64) {
    counter!("kiln_operations_total", "type" => op_type.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!("kiln_operation_duration_seconds", "type" => op_type.to_string()).record(duration_secs);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("kiln_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_prune(entries: usize, bytes: u64) {
    counter!("kiln_cache_pruned_entries_total").increment(entries as u64);
    counter!("kiln_cache_pruned_bytes_total").increment(bytes);
}

pub fn set_resource_usage(op_capacity: usize, active_ops: usize) {
    gauge!("kiln_op_capacity").set(op_capacity as f64);
    gauge!("kiln_active_operations").set(active_ops as f64);
}
