//! Persistent pipeline state backed by RocksDB.
//!
//! One database holds everything that must survive a restart besides the
//! room logs themselves: the tailing checkpoint, the last known snapshot of
//! each live message, the archive index and the archive work queue.
//!
//! # Key Layout
//!
//! ```text
//! checkpoint                                 → Checkpoint (JSON)
//! message/<message_id>                       → message snapshot (BSON)
//! archive/entry/<file_id> 0x00 <checksum>    → ArchiveEntry (JSON)
//! archive/entry/<file_id> 0x00 -             → degraded ArchiveEntry (JSON)
//! archive/job/<file_id> 0x00 <message_id>    → ArchiveJob (JSON)
//! ```
//!
//! Every write that other components rely on after a crash is issued with
//! `sync = true`. Message snapshots are written without sync: the next
//! synced checkpoint flushes the write-ahead log they sit in, and entries
//! after the checkpoint are replayed anyway.

use crate::error::Result;
use crate::pipeline::ArchiveJob;
use bson::Document;
use rcaudit_core::{ArchiveEntry, ArchiveStatus, Checkpoint};
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions};
use std::path::Path;
use tracing::{debug, info};

const CHECKPOINT_KEY: &[u8] = b"checkpoint";
const MESSAGE_PREFIX: &[u8] = b"message/";
const ENTRY_PREFIX: &[u8] = b"archive/entry/";
const JOB_PREFIX: &[u8] = b"archive/job/";
const DEGRADED_SUFFIX: &[u8] = b"-";

/// RocksDB-backed state store.
///
/// Thread-safe: can be shared across tasks via `Arc<StateDb>`.
pub struct StateDb {
    db: DBWithThreadMode<MultiThreaded>,
}

impl StateDb {
    /// Open or create the state database at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening state database at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;
        Ok(Self { db })
    }

    fn synced() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    // =========================================================================
    // Checkpoint
    // =========================================================================

    /// Load the persisted checkpoint, if any.
    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        match self.db.get(CHECKPOINT_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Durably replace the checkpoint.
    pub fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        self.db.put_opt(CHECKPOINT_KEY, bytes, &Self::synced())?;
        debug!("Checkpoint persisted at {}", checkpoint.last_confirmed);
        Ok(())
    }

    // =========================================================================
    // Message snapshots
    // =========================================================================

    fn message_key(message_id: &str) -> Vec<u8> {
        [MESSAGE_PREFIX, message_id.as_bytes()].concat()
    }

    /// Remember the latest full document of a message.
    pub fn put_message(&self, message_id: &str, doc: &Document) -> Result<()> {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes)?;
        self.db.put(Self::message_key(message_id), bytes)?;
        Ok(())
    }

    /// Latest remembered document of a message.
    pub fn message(&self, message_id: &str) -> Result<Option<Document>> {
        match self.db.get(Self::message_key(message_id))? {
            Some(bytes) => Ok(Some(Document::from_reader(&mut bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    /// Forget a message once its deletion is on record.
    pub fn remove_message(&self, message_id: &str) -> Result<()> {
        self.db.delete(Self::message_key(message_id))?;
        Ok(())
    }

    // =========================================================================
    // Archive queue
    // =========================================================================

    /// Jobs are keyed by file and referencing message. Re-enqueueing the same
    /// pair replaces the job; another message referencing the same file gets
    /// a job of its own.
    fn job_key(job: &ArchiveJob) -> Vec<u8> {
        [
            JOB_PREFIX,
            job.file_id.as_bytes(),
            &b"\0"[..],
            job.message_id.as_bytes(),
        ]
        .concat()
    }

    /// Durably enqueue an archive job.
    pub fn put_job(&self, job: &ArchiveJob) -> Result<()> {
        let bytes = serde_json::to_vec(job)?;
        self.db.put_opt(Self::job_key(job), bytes, &Self::synced())?;
        Ok(())
    }

    /// Retire a job without recording a new archive entry.
    pub fn remove_job(&self, job: &ArchiveJob) -> Result<()> {
        self.db.delete_opt(Self::job_key(job), &Self::synced())?;
        Ok(())
    }

    /// All jobs that have not completed yet, ordered by file id.
    pub fn pending_jobs(&self) -> Result<Vec<ArchiveJob>> {
        self.scan_prefix(JOB_PREFIX)
    }

    // =========================================================================
    // Archive index
    // =========================================================================

    fn entry_prefix(file_id: &str) -> Vec<u8> {
        [ENTRY_PREFIX, file_id.as_bytes(), &b"\0"[..]].concat()
    }

    fn entry_key(entry: &ArchiveEntry) -> Vec<u8> {
        let suffix = match (&entry.status, &entry.checksum) {
            (ArchiveStatus::Archived, Some(checksum)) => checksum.as_bytes(),
            _ => DEGRADED_SUFFIX,
        };
        [Self::entry_prefix(&entry.file_id).as_slice(), suffix].concat()
    }

    /// Every archive entry recorded for a file (all content versions plus a
    /// degraded marker, if any).
    pub fn archive_entries(&self, file_id: &str) -> Result<Vec<ArchiveEntry>> {
        self.scan_prefix(&Self::entry_prefix(file_id))
    }

    /// The archived version of a file with the given checksum.
    pub fn archive_entry(&self, file_id: &str, checksum: &str) -> Result<Option<ArchiveEntry>> {
        let key = [Self::entry_prefix(file_id).as_slice(), checksum.as_bytes()].concat();
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record an archive outcome and retire the job that produced it
    /// atomically.
    ///
    /// A successful archive also clears an earlier degraded marker.
    pub fn record_archive(&self, entry: &ArchiveEntry, job: &ArchiveJob) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(Self::entry_key(entry), serde_json::to_vec(entry)?);
        if entry.status == ArchiveStatus::Archived {
            batch.delete([Self::entry_prefix(&entry.file_id).as_slice(), DEGRADED_SUFFIX].concat());
        }
        batch.delete(Self::job_key(job));
        self.db.write_opt(batch, &Self::synced())?;
        Ok(())
    }

    fn scan_prefix<T: serde::de::DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }

        Ok(values)
    }
}
