//! Oplog source adapters.
//!
//! This module provides the adapters that read change entries out of a
//! MongoDB operation log and hand them to the pipeline in commit order.
//!
//! # Available Sources
//!
//! - [`ReplicaSetTail`] - Tailable await cursor on `local.oplog.rs`
//! - [`PolledTail`] - Interval polling of the legacy `local.oplog.$main`
//! - [`MemoryOplog`] - Capped in-process oplog for tests and simulations
//!
//! # Architecture
//!
//! All sources implement the [`OplogSource`] trait. A source is positioned
//! once with [`OplogSource::start`] and then pulled with
//! [`OplogSource::next`]. Before reading past a resume position every source
//! verifies that the oplog still holds the entry right after it (see
//! [`check_continuity`]); entries capped out before they were read surface
//! as [`Error::Gap`](crate::Error::Gap) instead of being skipped.

mod entry;
mod memory;
mod oplog;
mod polled;
mod replica_set;

pub use entry::{
    ChangeEntry, Decoded, OperationKind, Payload, UpdateDelta, decode_oplog, decode_update,
    id_string, key_from_timestamp, timestamp_from_key,
};
pub use memory::{MemoryOplog, MemoryOplogHandle};
pub use polled::PolledTail;
pub use replica_set::ReplicaSetTail;

use crate::{Error, Result};
use async_trait::async_trait;
use rcaudit_core::{SequenceKey, TailingMode};
use std::time::Duration;
use tracing::warn;

/// Result of pulling from a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    /// A document change, in commit order.
    Entry(ChangeEntry),
    /// An oplog entry that carries no document change (no-op, command).
    /// Its position may still be checkpointed.
    Skipped(SequenceKey),
    /// The wait window elapsed without new entries.
    Idle,
    /// The source is exhausted and will never yield again.
    EndOfStream,
}

/// A source of oplog change entries.
#[async_trait]
pub trait OplogSource: Send {
    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// Tailing mode recorded in checkpoints produced from this source.
    fn mode(&self) -> TailingMode;

    /// Position the source.
    ///
    /// With `resume` set, the source continues strictly after that key and
    /// fails with a gap error if the entries in between are gone. Without it,
    /// the source starts at its configured default position.
    async fn start(&mut self, resume: Option<SequenceKey>) -> Result<()>;

    /// Pull the next item. Errors other than gaps are transient: calling
    /// `next` again re-establishes the underlying cursor from the last
    /// position handed out.
    async fn next(&mut self) -> Result<SourceItem>;

    /// Release cursors and connections.
    async fn close(&mut self) {}
}

/// Settings shared by the oplog sources.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// How long a tailable cursor may wait for new entries before the source
    /// reports [`SourceItem::Idle`].
    pub idle_timeout: Duration,

    /// Interval between polls in master/slave mode.
    pub poll_interval: Duration,

    /// Maximum entries fetched per poll.
    pub batch_size: u32,

    /// How far (in oplog time) the oldest retained entry may lie past the
    /// resume position before it counts as a gap. Zero is strict.
    pub gap_tolerance: Duration,

    /// Without a checkpoint, start at the oldest retained entry instead of
    /// the newest.
    pub from_beginning: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            batch_size: 1000,
            gap_tolerance: Duration::ZERO,
            from_beginning: false,
        }
    }
}

/// Verify that reading can continue right after `resume`.
///
/// `oldest` is the oldest entry still retained by the oplog. Continuity
/// holds when it is no newer than the successor of `resume`; an oldest
/// entry newer than that is tolerated only within `tolerance`. An empty
/// oplog cannot prove continuity and is treated as a gap.
pub fn check_continuity(
    resume: SequenceKey,
    oldest: Option<SequenceKey>,
    tolerance: Duration,
) -> Result<()> {
    let Some(oldest) = oldest else {
        return Err(Error::Gap {
            checkpoint: resume,
            oldest: "none (oplog is empty)".to_string(),
        });
    };

    if oldest <= resume.successor() {
        return Ok(());
    }

    let stale_secs = u64::from(oldest.time.saturating_sub(resume.time));
    if !tolerance.is_zero() && stale_secs <= tolerance.as_secs() {
        warn!(
            checkpoint = %resume,
            oldest = %oldest,
            stale_secs,
            "Oplog entries after checkpoint were evicted; continuing within gap tolerance"
        );
        return Ok(());
    }

    Err(Error::Gap {
        checkpoint: resume,
        oldest: oldest.to_string(),
    })
}

/// Apply a decoded oplog document to the source's position.
pub(crate) fn accept(position: &mut Option<SequenceKey>, decoded: Decoded) -> SourceItem {
    match decoded {
        Decoded::Change(entry) => {
            *position = Some(entry.key);
            SourceItem::Entry(entry)
        }
        Decoded::Other(key) => {
            *position = Some(key);
            SourceItem::Skipped(key)
        }
    }
}
