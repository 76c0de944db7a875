//! Access to a MongoDB oplog collection shared by the live sources.
//!
//! The live sources only need a handful of queries, captured by
//! [`OplogStore`]. Every read starts *at* the last position handed out
//! rather than after it: the first entry returned must be that position
//! itself, which proves nothing in between was capped out while no cursor
//! was open (see [`anchor_holds`]).

use super::check_continuity;
use super::entry::{key_from_timestamp, timestamp_from_key};
use crate::{Error, Result};
use async_trait::async_trait;
use bson::{Document, doc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use mongodb::error::ErrorKind;
use mongodb::options::CursorType;
use mongodb::{Client, Collection};
use rcaudit_core::SequenceKey;
use std::time::Duration;

/// Server error code for a tailable cursor whose position was capped out.
const CAPPED_POSITION_LOST: i32 = 136;

/// Stream of raw oplog documents in commit order.
pub(crate) type OplogStream = BoxStream<'static, Result<Document>>;

/// Queries the live sources run against an oplog.
#[async_trait]
pub(crate) trait OplogStore: Send + Sync {
    /// Collection name, for logs.
    fn name(&self) -> &'static str;

    /// Key of the oldest retained entry.
    async fn oldest(&self) -> Result<Option<SequenceKey>>;

    /// Key of the newest entry.
    async fn newest(&self) -> Result<Option<SequenceKey>>;

    /// Up to `limit` entries at or after `from`, in commit order.
    async fn batch(&self, from: Option<SequenceKey>, limit: u32) -> Result<Vec<Document>>;

    /// Tailable cursor over entries at or after `from`.
    async fn tail(&self, from: Option<SequenceKey>, batch_size: u32, max_await: Duration)
    -> Result<OplogStream>;
}

/// Handle to an oplog collection in the `local` database.
pub(crate) struct OplogCollection {
    coll: Collection<Document>,
    name: &'static str,
}

impl OplogCollection {
    pub(crate) fn new(client: &Client, name: &'static str) -> Self {
        Self {
            coll: client.database("local").collection::<Document>(name),
            name,
        }
    }

    async fn edge(&self, direction: i32) -> Result<Option<SequenceKey>> {
        let doc = self
            .coll
            .find_one(doc! {})
            .sort(doc! { "$natural": direction })
            .projection(doc! { "ts": 1 })
            .await?;

        match doc {
            Some(doc) => Ok(Some(entry_key(&doc)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OplogStore for OplogCollection {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn oldest(&self) -> Result<Option<SequenceKey>> {
        self.edge(1).await
    }

    async fn newest(&self) -> Result<Option<SequenceKey>> {
        self.edge(-1).await
    }

    async fn batch(&self, from: Option<SequenceKey>, limit: u32) -> Result<Vec<Document>> {
        // Natural order of a capped oplog is commit order.
        let docs = self
            .coll
            .find(filter_from(from))
            .sort(doc! { "$natural": 1 })
            .limit(i64::from(limit))
            .await?
            .try_collect()
            .await?;
        Ok(docs)
    }

    async fn tail(
        &self,
        from: Option<SequenceKey>,
        batch_size: u32,
        max_await: Duration,
    ) -> Result<OplogStream> {
        let cursor = self
            .coll
            .find(filter_from(from))
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(max_await)
            .batch_size(batch_size)
            .await?;
        Ok(cursor.map_err(move |e| cursor_error(e, from)).boxed())
    }
}

/// Filter selecting entries at or after `from` (everything when unset).
pub(crate) fn filter_from(from: Option<SequenceKey>) -> Document {
    match from {
        Some(key) => doc! { "ts": { "$gte": timestamp_from_key(key) } },
        None => doc! {},
    }
}

/// Position of a raw oplog document.
pub(crate) fn entry_key(doc: &Document) -> Result<SequenceKey> {
    let ts = doc
        .get_timestamp("ts")
        .map_err(|e| rcaudit_core::Error::invalid("ts", e.to_string()))?;
    Ok(key_from_timestamp(ts))
}

/// Check the first entry read from `anchor` onwards.
///
/// Returns `true` when it is the anchor itself, which the caller has already
/// handed out and must drop. Otherwise the anchor was capped out and the
/// first entry is held to the usual continuity rule.
pub(crate) fn anchor_holds(anchor: SequenceKey, first: SequenceKey, tolerance: Duration) -> Result<bool> {
    if first == anchor {
        return Ok(true);
    }
    check_continuity(anchor, Some(first), tolerance)?;
    Ok(false)
}

fn is_capped_out(code: i32, code_name: &str) -> bool {
    code == CAPPED_POSITION_LOST || code_name == "CappedPositionLost"
}

fn capped_gap(position: Option<SequenceKey>) -> Error {
    Error::Gap {
        checkpoint: position.unwrap_or(SequenceKey::new(0, 0)),
        oldest: "unknown (cursor position capped out)".to_string(),
    }
}

/// Map a cursor error, turning a lost capped position into a gap.
pub(crate) fn cursor_error(err: mongodb::error::Error, position: Option<SequenceKey>) -> Error {
    let capped_out = match err.kind.as_ref() {
        ErrorKind::Command(cmd) => is_capped_out(cmd.code, &cmd.code_name),
        _ => false,
    };

    if capped_out {
        capped_gap(position)
    } else {
        Error::Mongo(err)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_position() {
        assert!(filter_from(None).is_empty());

        let filter = filter_from(Some(SequenceKey::new(10, 2)));
        let ts = filter
            .get_document("ts")
            .unwrap()
            .get_timestamp("$gte")
            .unwrap();
        assert_eq!((ts.time, ts.increment), (10, 2));
    }

    #[test]
    fn test_capped_position_lost_is_a_gap() {
        assert!(is_capped_out(136, ""));
        assert!(is_capped_out(0, "CappedPositionLost"));
        assert!(!is_capped_out(11600, "InterruptedAtShutdown"));

        let err = capped_gap(Some(SequenceKey::new(7, 1)));
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 2);
        assert!(matches!(err, Error::Gap { checkpoint, .. } if checkpoint == SequenceKey::new(7, 1)));
    }

    #[test]
    fn test_anchor_holds_only_when_first_entry_is_the_anchor() {
        let anchor = SequenceKey::new(100, 4);
        assert!(anchor_holds(anchor, anchor, Duration::ZERO).unwrap());

        // The anchor is gone but its successor is the first entry.
        assert!(!anchor_holds(anchor, SequenceKey::new(100, 5), Duration::ZERO).unwrap());

        let err = anchor_holds(anchor, SequenceKey::new(105, 1), Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Gap { .. }));
        assert!(!anchor_holds(anchor, SequenceKey::new(105, 1), Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn test_entry_key_requires_timestamp() {
        assert_eq!(
            entry_key(&testing::noop(5, 2)).unwrap(),
            SequenceKey::new(5, 2)
        );
        assert!(entry_key(&doc! { "op": "n" }).is_err());
    }
}
