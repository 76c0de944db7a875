//! Core types and shared utilities for the Rocket.Chat audit recorder.
//!
//! This crate provides:
//! - The audit data model (sequence keys, message events, audit records,
//!   archive entries, checkpoints)
//! - The integrity-framed record format used by room logs and the archive journal
//! - Time window parsing for the inspector
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
pub mod model;
pub mod record;
pub mod window;

/// File extension of per-room audit logs.
pub const AUDIT_LOG_EXTENSION: &str = "log";

/// File name of the archive journal inside the archive directory.
pub const ARCHIVE_JOURNAL: &str = "archive-journal.log";

pub use error::{Error, Result};
pub use model::{
    ArchiveEntry, ArchiveNote, ArchiveStatus, AttachmentRef, AuditRecord, Checkpoint, EventType,
    MessageEvent, Sender, SequenceKey, TailingMode, UNRESOLVED_ROOM,
};
pub use record::{Damage, IntegrityTag, ScanOutcome, decode_line, encode_line, read_all, read_audit_log, scan};
pub use window::TimeWindow;
