//! Per-room append-only audit logs.
//!
//! This module provides the [`RoomAuditWriter`] which appends audit records
//! to one log file per room using the integrity-framed record format.
//!
//! # Recovery
//!
//! A room log is scanned when it is first opened. A damaged final record
//! (a torn write from a crash) is truncated away and appending resumes after
//! the last verified record. Damage before the final record is reported as
//! [`Error::CorruptLog`](crate::Error::CorruptLog) and the log is left untouched.
//!
//! # Ordering and duplicates
//!
//! Appends to one room are serialized by a per-room lock; different rooms
//! proceed independently. Each log remembers the source key of its last
//! record, and events whose key is not newer are reported as
//! [`AppendOutcome::Duplicate`] without being written. Replaying the oplog
//! from an older checkpoint therefore never duplicates records.

use super::{encode_file_name, open_framed};
use crate::error::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rcaudit_core::{
    AUDIT_LOG_EXTENSION, ArchiveNote, AuditRecord, MessageEvent, SequenceKey, encode_line,
};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the room audit writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Directory holding one log per room.
    pub output_dir: PathBuf,

    /// Idle room logs are closed beyond this many open files.
    /// Default: 256
    pub max_open_logs: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./audit"),
            max_open_logs: 256,
        }
    }
}

/// Result of an append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The record was written and synced.
    Written(AuditRecord),
    /// The room log already holds this event (or a later one).
    Duplicate { room_sequence: u64 },
}

/// An open room log.
struct RoomLog {
    path: PathBuf,
    file: File,
    next_sequence: u64,
    last_key: Option<SequenceKey>,
}

impl RoomLog {
    fn open(path: PathBuf) -> Result<Self> {
        let mut last: Option<(u64, SequenceKey)> = None;
        let (file, outcome) = open_framed(&path, |record: AuditRecord, _| {
            last = Some((record.room_sequence, record.event.source_key));
        })?;

        debug!(
            path = %path.display(),
            records = outcome.records,
            "Opened room log"
        );

        Ok(Self {
            path,
            file,
            next_sequence: last.map_or(1, |(seq, _)| seq + 1),
            last_key: last.map(|(_, key)| key),
        })
    }
}

/// Writer statistics.
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub records_written: u64,
    pub duplicates: u64,
    pub bytes_written: u64,
    pub open_logs: usize,
}

/// Appends audit records to per-room logs.
///
/// Thread-safe: can be shared across tasks via `Arc<RoomAuditWriter>`.
pub struct RoomAuditWriter {
    config: WriterConfig,
    rooms: Mutex<HashMap<String, Arc<Mutex<RoomLog>>>>,
    records_written: AtomicU64,
    duplicates: AtomicU64,
    bytes_written: AtomicU64,
}

impl RoomAuditWriter {
    pub fn new(config: WriterConfig) -> Result<Self> {
        fs::create_dir_all(&config.output_dir)?;
        info!("Writing room audit logs to {}", config.output_dir.display());

        Ok(Self {
            config,
            rooms: Mutex::new(HashMap::new()),
            records_written: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Path of a room's log.
    pub fn log_path(&self, room_id: &str) -> PathBuf {
        log_path(&self.config.output_dir, room_id)
    }

    fn room(&self, room_id: &str) -> Result<Arc<Mutex<RoomLog>>> {
        if let Some(log) = self.rooms.lock().get(room_id) {
            return Ok(Arc::clone(log));
        }

        // Open outside the map lock so recovery of one log does not stall
        // appends to other rooms.
        let opened = Arc::new(Mutex::new(RoomLog::open(self.log_path(room_id))?));

        let mut rooms = self.rooms.lock();
        if rooms.len() >= self.config.max_open_logs {
            rooms.retain(|_, log| Arc::strong_count(log) > 1);
        }
        Ok(Arc::clone(
            rooms.entry(room_id.to_string()).or_insert(opened),
        ))
    }

    /// Append an event to its room's log and sync it to disk.
    ///
    /// On success the record is durable. On failure nothing is assumed about
    /// the file; the log is closed and recovered on the next append.
    pub fn append(&self, event: &MessageEvent, archive: ArchiveNote) -> Result<AppendOutcome> {
        let start = Instant::now();
        let room = self.room(&event.room_id)?;
        let mut log = room.lock();

        if log.last_key.is_some_and(|last| event.source_key <= last) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("audit_records_duplicate_total").increment(1);
            debug!(
                room_id = %event.room_id,
                key = %event.source_key,
                "Skipping already-recorded event"
            );
            return Ok(AppendOutcome::Duplicate {
                room_sequence: log.next_sequence - 1,
            });
        }

        let mut record = AuditRecord {
            room_sequence: log.next_sequence,
            room_id: event.room_id.clone(),
            event: event.clone(),
            written_at: Utc::now(),
            archive,
            integrity: None,
        };
        let (line, tag) = encode_line(&record)?;

        let written = log
            .file
            .write_all(&line)
            .and_then(|()| log.file.sync_data());
        if let Err(e) = written {
            warn!(
                path = %log.path.display(),
                error = %e,
                "Room log append failed; log will be recovered on next use"
            );
            self.rooms.lock().remove(&event.room_id);
            return Err(e.into());
        }

        log.next_sequence += 1;
        log.last_key = Some(event.source_key);
        record.integrity = Some(tag);

        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(line.len() as u64, Ordering::Relaxed);
        metrics::counter!("audit_records_written_total").increment(1);
        metrics::counter!("audit_bytes_written_total").increment(line.len() as u64);
        metrics::histogram!("audit_append_duration_seconds").record(start.elapsed().as_secs_f64());

        Ok(AppendOutcome::Written(record))
    }

    /// Source key of the last record in a room's log.
    pub fn last_key(&self, room_id: &str) -> Result<Option<SequenceKey>> {
        Ok(self.room(room_id)?.lock().last_key)
    }

    /// Close every open log.
    pub fn close_all(&self) {
        self.rooms.lock().clear();
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            records_written: self.records_written.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            open_logs: self.rooms.lock().len(),
        }
    }
}

/// Path of a room's log under `output_dir`.
///
/// Room ids are used as file names; bytes outside `[A-Za-z0-9_-]` are
/// percent-encoded so distinct ids never share a file.
pub fn log_path(output_dir: &Path, room_id: &str) -> PathBuf {
    output_dir.join(format!("{}.{AUDIT_LOG_EXTENSION}", encode_file_name(room_id)))
}
