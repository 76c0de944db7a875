//! Core pipeline components for audit recording.
//!
//! - [`RoomAuditWriter`] - Appends audit records to per-room logs
//! - [`FileArchiver`] - Copies attachments into the content-addressed archive
//! - [`ArchivePool`] - Bounded worker pool draining the durable archive queue
//! - [`Coordinator`] - Drives source → classifier → writer and the checkpoint
//!
//! # Architecture
//!
//! ```text
//! [OplogSource] → [Classifier] → [RoomAuditWriter] → checkpoint (RocksDB)
//!                                      ↓
//!                             archive queue (RocksDB)
//!                                      ↓
//!                          [ArchivePool] → [FileArchiver]
//! ```
//!
//! The pipeline is log-first: a change entry is confirmed once its audit
//! records are synced. Archival runs behind the durable queue and never gates
//! the checkpoint.

mod archiver;
mod coordinator;
mod filestore;
mod writer;

pub use archiver::{
    ArchiveHandle, ArchiveJob, ArchiveOutcome, ArchivePool, ArchivePoolStats, ArchiveQueue,
    ArchiverConfig, FileArchiver,
};
pub use coordinator::{Coordinator, CoordinatorConfig, Phase, RunSummary};
pub use filestore::{ContentReader, DEFAULT_GRIDFS_BUCKET, FileStore, FileStoreLocation};
pub use writer::{AppendOutcome, RoomAuditWriter, WriterConfig, WriterStats, log_path};

use crate::error::{Error, Result};
use rcaudit_core::{Damage, IntegrityTag, ScanOutcome, scan};
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::Path;
use tracing::warn;

/// Flush a directory entry (new or renamed files) to disk.
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Run blocking file or RocksDB work off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Render an id as a single path component.
///
/// Bytes outside `[A-Za-z0-9_-]` are percent-encoded, so distinct ids never
/// map to the same name and no name can be `.`, `..` or hidden.
pub(crate) fn encode_file_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            name.push(b as char);
        } else {
            name.push_str(&format!("%{b:02X}"));
        }
    }
    name
}

/// Open an integrity-framed file for appending, recovering it first.
///
/// Every verified record is passed to `on_record`. A damaged final record is
/// truncated away; damage before it fails with [`Error::CorruptLog`].
pub(crate) fn open_framed<T, F>(path: &Path, on_record: F) -> Result<(File, ScanOutcome)>
where
    T: DeserializeOwned,
    F: FnMut(T, IntegrityTag),
{
    let created = !path.exists();
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    if created {
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
    }

    let outcome = scan(BufReader::new(&mut file), on_record)?;

    match &outcome.damage {
        Some(Damage::Corrupt { offset, reason }) => {
            return Err(Error::CorruptLog {
                path: path.to_path_buf(),
                offset: *offset,
                reason: reason.clone(),
            });
        }
        Some(Damage::TornTail { offset, bytes }) => {
            warn!(
                path = %path.display(),
                offset,
                bytes,
                "Discarding incomplete trailing record"
            );
            file.set_len(outcome.valid_len)?;
            file.sync_all()?;
            metrics::counter!("audit_torn_tails_repaired_total").increment(1);
        }
        None => {}
    }

    Ok((file, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_file_name_keeps_ids_distinct() {
        assert_eq!(encode_file_name("GENERAL"), "GENERAL");
        assert_eq!(encode_file_name("a_b-1"), "a_b-1");
        assert_eq!(encode_file_name("a.b"), "a%2Eb");
        assert_ne!(encode_file_name("a.b"), encode_file_name("a_b"));
        assert_eq!(encode_file_name(".."), "%2E%2E");
        assert_eq!(encode_file_name("x/y"), "x%2Fy");
    }

    #[tokio::test]
    async fn test_blocking_maps_panics_to_task_errors() {
        assert_eq!(blocking(|| Ok(7)).await.unwrap(), 7);

        let err = blocking::<(), _>(|| panic!("boom")).await.unwrap_err();
        assert!(matches!(err, Error::Task(_)));
    }
}
