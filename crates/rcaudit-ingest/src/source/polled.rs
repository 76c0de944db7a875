//! Master/slave oplog polling.
//!
//! Legacy master/slave deployments keep their oplog in `local.oplog.$main`
//! and do not support tailable cursors, so the collection is polled on a
//! fixed interval in bounded batches. Each poll starts at the last position
//! handed out and must see it again: a lagging poller can be overtaken by
//! eviction between two polls.

use super::oplog::{OplogCollection, OplogStore, anchor_holds, entry_key};
use super::{OplogSource, SourceConfig, SourceItem, accept, check_continuity, decode_oplog};
use crate::Result;
use async_trait::async_trait;
use bson::Document;
use mongodb::Client;
use rcaudit_core::{SequenceKey, TailingMode};
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval poller over the master/slave oplog.
pub struct PolledTail {
    oplog: Box<dyn OplogStore>,
    config: SourceConfig,
    buffer: VecDeque<Document>,
    position: Option<SequenceKey>,
    last_poll: Option<Instant>,
}

impl PolledTail {
    pub fn new(client: &Client, config: SourceConfig) -> Self {
        Self::with_store(Box::new(OplogCollection::new(client, "oplog.$main")), config)
    }

    pub(crate) fn with_store(oplog: Box<dyn OplogStore>, config: SourceConfig) -> Self {
        Self {
            oplog,
            config,
            buffer: VecDeque::new(),
            position: None,
            last_poll: None,
        }
    }

    async fn poll(&mut self) -> Result<()> {
        // One extra slot for the anchor entry.
        let mut batch = self
            .oplog
            .batch(self.position, self.config.batch_size.saturating_add(1))
            .await?;

        if let Some(anchor) = self.position {
            match batch.first().map(entry_key).transpose()? {
                Some(first) => {
                    if anchor_holds(anchor, first, self.config.gap_tolerance)? {
                        batch.remove(0);
                    }
                }
                // Nothing at or after the anchor: only an emptied oplog.
                None => {
                    let oldest = self.oplog.oldest().await?;
                    check_continuity(anchor, oldest, self.config.gap_tolerance)?;
                }
            }
        }

        debug!(entries = batch.len(), "Polled master/slave oplog");
        self.buffer.extend(batch);
        Ok(())
    }
}

#[async_trait]
impl OplogSource for PolledTail {
    fn name(&self) -> &'static str {
        "master-slave"
    }

    fn mode(&self) -> TailingMode {
        TailingMode::MasterSlave
    }

    async fn start(&mut self, resume: Option<SequenceKey>) -> Result<()> {
        self.buffer.clear();
        self.last_poll = None;
        self.position = match resume {
            Some(key) => {
                let oldest = self.oplog.oldest().await?;
                check_continuity(key, oldest, self.config.gap_tolerance)?;
                Some(key)
            }
            None if self.config.from_beginning => None,
            None => self.oplog.newest().await?,
        };

        info!(
            collection = self.oplog.name(),
            position = ?self.position.map(|k| k.to_string()),
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting master/slave oplog poller"
        );
        Ok(())
    }

    async fn next(&mut self) -> Result<SourceItem> {
        loop {
            while let Some(doc) = self.buffer.pop_front() {
                match decode_oplog(&doc) {
                    Ok(decoded) => return Ok(accept(&mut self.position, decoded)),
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable oplog entry");
                        metrics::counter!("oplog_entries_skipped_total", "reason" => "malformed")
                            .increment(1);
                        // Step past it so the next poll does not fetch it again.
                        if let Ok(key) = entry_key(&doc) {
                            self.position = Some(key);
                            return Ok(SourceItem::Skipped(key));
                        }
                    }
                }
            }

            if let Some(last) = self.last_poll {
                tokio::time::sleep_until(last + self.config.poll_interval).await;
            }
            self.last_poll = Some(Instant::now());

            self.poll().await?;
            if self.buffer.is_empty() {
                return Ok(SourceItem::Idle);
            }
        }
    }

    async fn close(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::source::oplog::testing::{InMemoryCollection, insert, noop};
    use bson::doc;
    use std::time::Duration;

    fn config() -> SourceConfig {
        SourceConfig {
            poll_interval: Duration::from_millis(5),
            batch_size: 2,
            from_beginning: true,
            ..Default::default()
        }
    }

    fn tail(store: &InMemoryCollection, config: SourceConfig) -> PolledTail {
        PolledTail::with_store(Box::new(store.clone()), config)
    }

    async fn drain(source: &mut PolledTail) -> Vec<SourceItem> {
        let mut items = Vec::new();
        loop {
            match source.next().await.unwrap() {
                SourceItem::Idle => return items,
                item => items.push(item),
            }
        }
    }

    fn keys(items: &[SourceItem]) -> Vec<SequenceKey> {
        items
            .iter()
            .map(|item| match item {
                SourceItem::Entry(entry) => entry.key,
                SourceItem::Skipped(key) => *key,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_polls_in_batches_without_repeating_entries() {
        let store = InMemoryCollection::new(vec![
            insert(10, 1, "m1"),
            noop(10, 2),
            insert(11, 1, "m2"),
            insert(12, 1, "m3"),
        ]);
        let mut source = tail(&store, config());
        source.start(None).await.unwrap();

        let items = drain(&mut source).await;
        assert_eq!(
            keys(&items),
            vec![
                SequenceKey::new(10, 1),
                SequenceKey::new(10, 2),
                SequenceKey::new(11, 1),
                SequenceKey::new(12, 1),
            ]
        );
        assert!(matches!(items[1], SourceItem::Skipped(_)));

        store.push(insert(13, 1, "m4"));
        assert_eq!(keys(&drain(&mut source).await), vec![SequenceKey::new(13, 1)]);
    }

    #[tokio::test]
    async fn test_resume_continues_after_checkpoint() {
        let store = InMemoryCollection::new(vec![
            insert(10, 1, "m1"),
            insert(11, 1, "m2"),
            insert(12, 1, "m3"),
        ]);
        let mut source = tail(&store, config());
        source.start(Some(SequenceKey::new(11, 1))).await.unwrap();

        assert_eq!(keys(&drain(&mut source).await), vec![SequenceKey::new(12, 1)]);
    }

    #[tokio::test]
    async fn test_default_start_is_newest_entry() {
        let store = InMemoryCollection::new(vec![insert(10, 1, "m1"), insert(11, 1, "m2")]);
        let mut source = tail(
            &store,
            SourceConfig {
                from_beginning: false,
                ..config()
            },
        );
        source.start(None).await.unwrap();

        assert!(drain(&mut source).await.is_empty());
        store.push(insert(12, 1, "m3"));
        assert_eq!(keys(&drain(&mut source).await), vec![SequenceKey::new(12, 1)]);
    }

    #[tokio::test]
    async fn test_evicted_checkpoint_is_gap_at_start() {
        let store = InMemoryCollection::new(vec![insert(20, 1, "m5")]);
        let mut source = tail(&store, config());

        let err = source.start(Some(SequenceKey::new(10, 1))).await.unwrap_err();
        assert!(matches!(err, Error::Gap { .. }));
    }

    #[tokio::test]
    async fn test_poller_overtaken_by_eviction_reports_gap() {
        let store = InMemoryCollection::new(vec![insert(10, 1, "m1"), insert(11, 1, "m2")]);
        let mut source = tail(&store, config());
        source.start(None).await.unwrap();
        drain(&mut source).await;

        // Entries written and evicted between two polls.
        store.push(insert(12, 1, "m3"));
        store.push(insert(13, 1, "m4"));
        store.evict(3);

        let err = source.next().await.unwrap_err();
        assert!(matches!(err, Error::Gap { checkpoint, .. } if checkpoint == SequenceKey::new(11, 1)));
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_stepped_over() {
        let store = InMemoryCollection::new(vec![
            insert(10, 1, "m1"),
            doc! { "ts": bson::Timestamp { time: 10, increment: 2 }, "op": "u", "ns": "x.y" },
            insert(11, 1, "m2"),
        ]);
        let mut source = tail(&store, config());
        source.start(None).await.unwrap();

        let items = drain(&mut source).await;
        assert_eq!(
            keys(&items),
            vec![SequenceKey::new(10, 1), SequenceKey::new(10, 2), SequenceKey::new(11, 1)]
        );
        assert_eq!(items[1], SourceItem::Skipped(SequenceKey::new(10, 2)));
        assert!(drain(&mut source).await.is_empty());
    }

    #[tokio::test]
    async fn test_poll_failure_is_transient() {
        let store = InMemoryCollection::new(vec![insert(10, 1, "m1")]);
        let mut source = tail(&store, config());
        source.start(None).await.unwrap();

        store.fail_next(Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        )));
        let err = source.next().await.unwrap_err();
        assert!(!err.is_fatal());

        assert_eq!(keys(&drain(&mut source).await), vec![SequenceKey::new(10, 1)]);
    }
}
