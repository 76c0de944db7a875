//! Data model shared by the recorder and the inspector.
//!
//! Everything here is serialized into the audit logs, the archive journal or
//! the state store, so field names are part of the on-disk format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::record::IntegrityTag;

/// Room id used for tombstones whose room could not be determined.
pub const UNRESOLVED_ROOM: &str = "_unresolved";

/// Position of an entry in the oplog.
///
/// Mirrors a BSON timestamp: seconds since the epoch plus an ordinal that
/// orders operations committed within the same second. The derived ordering
/// compares `time` first, then `ordinal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    pub time: u32,
    pub ordinal: u32,
}

impl SequenceKey {
    pub const fn new(time: u32, ordinal: u32) -> Self {
        Self { time, ordinal }
    }

    /// The smallest key strictly greater than this one.
    pub fn successor(self) -> Self {
        match self.ordinal.checked_add(1) {
            Some(ordinal) => Self::new(self.time, ordinal),
            None => Self::new(self.time.saturating_add(1), 0),
        }
    }

    /// Wall-clock time of the commit (second precision).
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.time), 0).unwrap_or_default()
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.time, self.ordinal)
    }
}

/// How the oplog is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailingMode {
    /// Tailable await cursor on `local.oplog.rs`.
    ReplicaSet,
    /// Interval polling of the legacy `local.oplog.$main`.
    MasterSlave,
    /// In-process capped oplog (tests and simulations).
    Memory,
}

impl fmt::Display for TailingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReplicaSet => "replica-set",
            Self::MasterSlave => "master-slave",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Persisted tailing progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub mode: TailingMode,
    pub last_confirmed: SequenceKey,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(mode: TailingMode, last_confirmed: SequenceKey) -> Self {
        Self {
            mode,
            last_confirmed,
            updated_at: Utc::now(),
        }
    }
}

/// Lifecycle stage of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Edited,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Edited => "edited",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A chat user as recorded on a message (`u` or `editedBy`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// A file upload referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A message lifecycle event carrying the full message state at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub event_type: EventType,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_by: Option<Sender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Rocket.Chat message type marker (`t`), set for system messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    pub occurred_at: DateTime<Utc>,
    pub source_key: SequenceKey,
    /// Set on deletes for which no prior snapshot was known.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstone: bool,
}

impl MessageEvent {
    /// Username (or id) of whoever is responsible for this event.
    pub fn actor(&self) -> Option<&str> {
        let who = match self.event_type {
            EventType::Edited => self.edited_by.as_ref().or(self.sender.as_ref()),
            _ => self.sender.as_ref(),
        }?;
        Some(who.username.as_deref().unwrap_or(&who.id))
    }
}

/// What happened to a record's attachments at write time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveNote {
    /// The event references no attachments.
    #[default]
    None,
    /// Attachments were handed to the archiver's durable queue.
    Queued,
    /// No archiver is configured; attachments are not archived.
    Disabled,
}

impl ArchiveNote {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// One entry of a room's audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position within the room's log, starting at 1.
    pub room_sequence: u64,
    pub room_id: String,
    pub event: MessageEvent,
    pub written_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "ArchiveNote::is_none")]
    pub archive: ArchiveNote,
    /// Framing tag, filled in when the record is written or read back.
    #[serde(skip)]
    pub integrity: Option<IntegrityTag>,
}

/// Outcome of archiving an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Archived,
    Degraded,
}

/// Archive index entry for one version of an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub file_id: String,
    /// Where the content was read from (`fs:<path>` or `gridfs:<bucket>/<id>`).
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    /// Hex SHA-256 of the archived content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    pub copied_at: DateTime<Utc>,
    pub status: ArchiveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_key_ordering() {
        let a = SequenceKey::new(100, 1);
        let b = SequenceKey::new(100, 2);
        let c = SequenceKey::new(101, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.successor(), b);
    }

    #[test]
    fn test_sequence_key_successor_wraps_ordinal() {
        let key = SequenceKey::new(7, u32::MAX);
        assert_eq!(key.successor(), SequenceKey::new(8, 0));
    }

    #[test]
    fn test_event_actor_prefers_editor_on_edit() {
        let mut event = MessageEvent {
            event_type: EventType::Edited,
            room_id: "GENERAL".to_string(),
            room_name: None,
            message_id: "m1".to_string(),
            sender: Some(Sender {
                id: "u1".to_string(),
                username: Some("alice".to_string()),
            }),
            edited_by: Some(Sender {
                id: "u2".to_string(),
                username: None,
            }),
            text: Some("hi".to_string()),
            message_kind: None,
            attachments: Vec::new(),
            occurred_at: Utc::now(),
            source_key: SequenceKey::new(1, 1),
            tombstone: false,
        };
        assert_eq!(event.actor(), Some("u2"));

        event.event_type = EventType::Created;
        assert_eq!(event.actor(), Some("alice"));
    }

    #[test]
    fn test_archive_note_skipped_when_none() {
        let record = AuditRecord {
            room_sequence: 1,
            room_id: "r".to_string(),
            event: MessageEvent {
                event_type: EventType::Deleted,
                room_id: "r".to_string(),
                room_name: None,
                message_id: "m".to_string(),
                sender: None,
                edited_by: None,
                text: None,
                message_kind: None,
                attachments: Vec::new(),
                occurred_at: Utc::now(),
                source_key: SequenceKey::new(1, 1),
                tombstone: true,
            },
            written_at: Utc::now(),
            archive: ArchiveNote::None,
            integrity: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("\"archive\""));
        assert!(json.contains("\"tombstone\":true"));
    }
}
