//! In-process capped oplog.
//!
//! Behaves like a capped oplog collection: entries are appended in key
//! order and the oldest ones are evicted once `capacity` is exceeded. Used
//! by the pipeline tests and for simulations; gap handling is the same as
//! for the MongoDB-backed sources.

use super::{ChangeEntry, OplogSource, SourceItem, check_continuity};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rcaudit_core::{SequenceKey, TailingMode};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Pause before reporting an idle followed oplog.
const FOLLOW_IDLE_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<ChangeEntry>,
    capacity: Option<usize>,
}

impl Inner {
    fn push(&mut self, entry: ChangeEntry) {
        self.entries.push_back(entry);
        if let Some(capacity) = self.capacity {
            while self.entries.len() > capacity {
                self.entries.pop_front();
            }
        }
    }
}

/// Writer side of a [`MemoryOplog`], for appending while it is being read.
#[derive(Debug, Clone)]
pub struct MemoryOplogHandle(Arc<Mutex<Inner>>);

impl MemoryOplogHandle {
    pub fn push(&self, entry: ChangeEntry) {
        self.0.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.0.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A capped oplog held in memory.
#[derive(Debug)]
pub struct MemoryOplog {
    inner: Arc<Mutex<Inner>>,
    position: Option<SequenceKey>,
    gap_tolerance: Duration,
    follow: bool,
}

impl MemoryOplog {
    /// An uncapped oplog holding `entries` (which must be in key order).
    pub fn new(entries: impl IntoIterator<Item = ChangeEntry>) -> Self {
        Self::build(None, entries)
    }

    /// A capped oplog; only the newest `capacity` entries are retained.
    pub fn capped(capacity: usize, entries: impl IntoIterator<Item = ChangeEntry>) -> Self {
        Self::build(Some(capacity.max(1)), entries)
    }

    fn build(capacity: Option<usize>, entries: impl IntoIterator<Item = ChangeEntry>) -> Self {
        let mut inner = Inner {
            entries: VecDeque::new(),
            capacity,
        };
        for entry in entries {
            inner.push(entry);
        }
        Self {
            inner: Arc::new(Mutex::new(inner)),
            position: None,
            gap_tolerance: Duration::ZERO,
            follow: false,
        }
    }

    /// Report [`SourceItem::Idle`] instead of end-of-stream once drained, so
    /// entries pushed through a handle later are still read.
    pub fn follow(mut self) -> Self {
        self.follow = true;
        self
    }

    pub fn with_gap_tolerance(mut self, tolerance: Duration) -> Self {
        self.gap_tolerance = tolerance;
        self
    }

    pub fn handle(&self) -> MemoryOplogHandle {
        MemoryOplogHandle(Arc::clone(&self.inner))
    }

    /// Current read position.
    pub fn position(&self) -> Option<SequenceKey> {
        self.position
    }
}

#[async_trait]
impl OplogSource for MemoryOplog {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn mode(&self) -> TailingMode {
        TailingMode::Memory
    }

    async fn start(&mut self, resume: Option<SequenceKey>) -> Result<()> {
        if let Some(key) = resume {
            let oldest = self.inner.lock().entries.front().map(|e| e.key);
            check_continuity(key, oldest, self.gap_tolerance)?;
        }
        self.position = resume;
        Ok(())
    }

    async fn next(&mut self) -> Result<SourceItem> {
        let item = self.read_next()?;
        if item == SourceItem::Idle {
            tokio::time::sleep(FOLLOW_IDLE_WAIT).await;
        }
        Ok(item)
    }
}

impl MemoryOplog {
    fn read_next(&mut self) -> Result<SourceItem> {
        let inner = self.inner.lock();

        if let Some(position) = self.position {
            let oldest = inner.entries.front().map(|e| e.key);
            if oldest.is_some_and(|oldest| oldest > position.successor()) {
                check_continuity(position, oldest, self.gap_tolerance)?;
            }
        }

        let next = match self.position {
            Some(position) => {
                let idx = inner.entries.partition_point(|e| e.key <= position);
                inner.entries.get(idx)
            }
            None => inner.entries.front(),
        };

        match next {
            Some(entry) => {
                self.position = Some(entry.key);
                Ok(SourceItem::Entry(entry.clone()))
            }
            None if self.follow => Ok(SourceItem::Idle),
            None => Ok(SourceItem::EndOfStream),
        }
    }
}
