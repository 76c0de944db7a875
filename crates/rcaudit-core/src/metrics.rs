//! Prometheus metrics helpers for the audit recorder.
//!
//! # Usage
//!
//! ```rust,ignore
//! use rcaudit_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle).await?;
//!
//! metrics::counter!("audit_records_written_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`oplog_`, `classifier_`, `audit_`, `archive_`, `checkpoint_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: only low-cardinality ones (never room or file ids)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if a global recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_audit_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_audit_metrics();
    Some(handle)
}

/// Serve `/metrics` on the given port from a background task.
///
/// The listener is bound before returning so port conflicts surface here.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_audit_metrics() {
    describe_gauge!("recorder_running", "1 while the recorder is tailing, 0 after shutdown");

    // =========================================================================
    // Oplog Source
    // =========================================================================

    describe_counter!("oplog_entries_total", "Oplog entries read from the source");
    describe_counter!(
        "oplog_entries_skipped_total",
        "Oplog entries that are not change entries (no-ops, commands, unparseable)"
    );
    describe_counter!(
        "oplog_reconnects_total",
        "Source reconnect attempts after transient failures"
    );
    describe_gauge!(
        "oplog_lag_seconds",
        "Wall-clock age of the most recently processed oplog entry"
    );

    // =========================================================================
    // Classifier
    // =========================================================================

    describe_counter!(
        "classifier_events_total",
        "Message events produced (label: type)"
    );
    describe_counter!(
        "classifier_malformed_total",
        "Message entries skipped because of missing or mistyped fields"
    );
    describe_counter!(
        "classifier_snapshot_lookups_total",
        "Snapshot cache misses resolved through the chat database"
    );

    // =========================================================================
    // Room Audit Writer
    // =========================================================================

    describe_counter!(
        "audit_records_written_total",
        "Audit records durably appended"
    );
    describe_counter!(
        "audit_records_duplicate_total",
        "Replayed events skipped because the room log already holds them"
    );
    describe_counter!("audit_bytes_written_total", "Bytes appended to room logs");
    describe_counter!(
        "audit_torn_tails_repaired_total",
        "Incomplete trailing records discarded during log recovery"
    );
    describe_histogram!(
        "audit_append_duration_seconds",
        "Time spent appending and syncing one record"
    );

    // =========================================================================
    // File Archiver
    // =========================================================================

    describe_counter!("archive_files_archived_total", "Attachment versions archived");
    describe_counter!(
        "archive_files_unchanged_total",
        "Archive requests satisfied by an existing identical copy"
    );
    describe_counter!(
        "archive_files_degraded_total",
        "Attachments that could not be archived"
    );
    describe_counter!(
        "archive_checksum_conflicts_total",
        "Attachments whose content changed after a previous archive"
    );
    describe_counter!("archive_bytes_total", "Attachment bytes copied");
    describe_gauge!("archive_queue_depth", "Archive jobs waiting or in flight");

    // =========================================================================
    // Checkpoint
    // =========================================================================

    describe_counter!("checkpoint_writes_total", "Checkpoint persists");
    describe_gauge!(
        "checkpoint_last_confirmed_seconds",
        "Oplog time of the last persisted checkpoint"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_is_repeatable() {
        ensure_metrics_init();
        register_audit_metrics();
        register_audit_metrics();
    }
}
