//! Operation metrics for store calls.

use std::time::Instant;

/// Records a counter and a latency histogram for one store operation.
///
/// Emits `kvlock_operations_total` and `kvlock_operation_duration_ms`, both
/// labelled by backend, operation and status. Without an installed recorder
/// these are no-ops.
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "kvlock_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "kvlock_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}
