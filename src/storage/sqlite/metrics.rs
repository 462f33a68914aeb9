//! Operation metrics shared by the `SQLite` backends.

use std::time::Instant;

/// Records `storage_operations_total` and `storage_operation_duration_ms`
/// for one backend call.
pub fn record_operation_metrics<T>(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    result: &crate::Result<T>,
) {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}
