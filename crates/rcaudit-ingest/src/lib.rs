//! Rocket.Chat audit recorder pipeline components.
//!
//! This crate tails a MongoDB operation log, turns message changes into
//! lifecycle events, and records them in tamper-evident per-room logs while
//! attachments are archived in the background.
//!
//! # Modules
//!
//! - [`source`] - Oplog source adapters (replica set, master/slave, in-memory)
//! - [`classify`] - Change entry classification into message events
//! - [`pipeline`] - Room audit writer, file archiver and the coordinator
//! - [`state`] - RocksDB state store (checkpoint, archive index and queue)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   OplogSource   │  (tailable cursor, polling, in-memory)
//! └────────┬────────┘
//!          │ ChangeEntry
//!          ▼
//! ┌─────────────────┐
//! │   Classifier    │  snapshot cache + chat database fallback
//! └────────┬────────┘
//!          │ MessageEvent
//!          ▼
//! ┌─────────────────┐      ┌──────────────┐
//! │ RoomAuditWriter │ ───▶ │ ArchivePool  │  durable queue, bounded workers
//! └────────┬────────┘      └──────────────┘
//!          │ durable
//!          ▼
//! ┌─────────────────┐
//! │   Checkpoint    │  advanced by the Coordinator only
//! └─────────────────┘
//! ```
//!
//! The room logs are the source of truth. The checkpoint only moves past an
//! entry once every record it produced has been synced to disk.

pub mod classify;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod state;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use classify::{Classifier, ClassifierConfig, Directory, MemoryDirectory, MongoDirectory};

pub use pipeline::{
    AppendOutcome, ArchiveHandle, ArchiveJob, ArchiveOutcome, ArchivePool, ArchivePoolStats,
    ArchiveQueue, ArchiverConfig, Coordinator, CoordinatorConfig, FileArchiver, FileStore, FileStoreLocation,
    Phase, RoomAuditWriter, RunSummary, WriterConfig, WriterStats,
};

pub use retry::{RetryConfig, RetryableError};

pub use source::{
    ChangeEntry, MemoryOplog, OplogSource, PolledTail, ReplicaSetTail, SourceConfig, SourceItem,
};

pub use state::StateDb;
