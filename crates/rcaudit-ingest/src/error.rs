//! Error types for the audit pipeline.

use rcaudit_core::SequenceKey;
use std::path::PathBuf;
use thiserror::Error;

use crate::retry::RetryableError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tailing, recording or archiving.
#[derive(Error, Debug)]
pub enum Error {
    /// Oplog entries were evicted before they were read.
    #[error(
        "compliance gap: oplog no longer holds entries after checkpoint {checkpoint} (oldest retained entry is {oldest})"
    )]
    Gap {
        checkpoint: SequenceKey,
        oldest: String,
    },

    /// The source could not be (re)opened within the retry budget.
    #[error("oplog source unavailable after {attempts} attempts: {last_error}")]
    SourceUnavailable { attempts: u32, last_error: String },

    /// A room log is damaged somewhere other than its final record.
    #[error("audit log {} is corrupt at byte {offset}: {reason}", path.display())]
    CorruptLog {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Source file of an attachment does not exist.
    #[error("attachment source not found: {0}")]
    NotFound(String),

    /// Copied attachment does not match the source.
    #[error("attachment content mismatch for {file_id}: {reason}")]
    ContentMismatch { file_id: String, reason: String },

    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// MongoDB error.
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// Audit data model or framing error.
    #[error(transparent)]
    Core(#[from] rcaudit_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored message snapshot could not be encoded.
    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    /// Stored message snapshot could not be decoded.
    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    /// Checkpoint does not belong to this tailing mode.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background task failed to complete.
    #[error("Task error: {0}")]
    Task(String),
}

impl Error {
    /// Conditions that require operator intervention and must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Gap { .. } | Self::SourceUnavailable { .. } | Self::CorruptLog { .. } | Self::Config(_)
        )
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Gap { .. } => 2,
            Self::SourceUnavailable { .. } => 3,
            _ => 1,
        }
    }
}

impl RetryableError for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Mongo(_) | Self::RocksDb(_) | Self::Task(_) | Self::ContentMismatch { .. } => true,
            Self::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            Self::Core(rcaudit_core::Error::Io(_)) => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
