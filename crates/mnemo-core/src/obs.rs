//! Structured observability hooks for memory store events.
//!
//! - `maintenance_span` scoping logs to one maintenance run
//! - `emit_*` functions for record, query, maintenance and index events
//!
//! Events are emitted at `info!` (failures at `warn!`) with an `event` field.

use tracing::{info, warn};

/// Span for one maintenance run. Attach it to the run's future with
/// `tracing::Instrument` so it survives suspension points.
///
/// ```ignore
/// run_decay().instrument(maintenance_span("decay")).await;
/// // every event inside carries operation = "decay"
/// ```
pub fn maintenance_span(operation: &str) -> tracing::Span {
    tracing::info_span!("mnemo.maintenance", operation = %operation)
}

pub fn emit_memory_recorded(id: &str, memory_type: &str, forced: bool) {
    info!(event = "memory.recorded", id = %id, memory_type = %memory_type, forced = forced);
}

pub fn emit_memory_updated(id: &str, version: u64) {
    info!(event = "memory.updated", id = %id, version = version);
}

pub fn emit_memory_deleted(id: &str, existed: bool) {
    info!(event = "memory.deleted", id = %id, existed = existed);
}

pub fn emit_duplicate_rejected(existing_id: &str) {
    info!(event = "memory.duplicate_rejected", existing_id = %existing_id);
}

pub fn emit_query_served(candidates: usize, returned: usize) {
    info!(event = "query.served", candidates = candidates, returned = returned);
}

pub fn emit_maintenance_finished(operation: &str, processed: usize, changed: usize, failed: usize) {
    info!(
        event = "maintenance.finished",
        operation = %operation,
        processed = processed,
        changed = changed,
        failed = failed,
    );
}

pub fn emit_consolidated(merged: usize, removed: usize, remaining: usize) {
    info!(
        event = "memory.consolidated",
        merged = merged,
        removed = removed,
        remaining = remaining,
    );
}

pub fn emit_import_absorbed_skipped(id: &str, survivor: &str) {
    info!(event = "import.absorbed_skipped", id = %id, survivor = %survivor);
}

pub fn emit_index_rebuilt(records: usize, reason: &str) {
    info!(event = "index.rebuilt", records = records, reason = %reason);
}

/// Index write failed after a successful record write (warning level).
pub fn emit_index_persist_failed(error: &dyn std::fmt::Display) {
    warn!(event = "index.persist_failed", error = %error);
}

pub fn emit_record_failed(id: &str, operation: &str, error: &dyn std::fmt::Display) {
    warn!(event = "memory.write_failed", id = %id, operation = %operation, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maintenance_span_create() {
        let span = maintenance_span("decay");
        let _entered = span.enter();
        emit_maintenance_finished("decay", 3, 1, 0);
    }
}
