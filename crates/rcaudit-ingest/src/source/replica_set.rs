//! Replica-set oplog tailing.
//!
//! Reads `local.oplog.rs` through a tailable await cursor. An exhausted
//! cursor is not the end of the stream: the server holds each `getMore` for
//! up to `idle_timeout` and the source reports [`SourceItem::Idle`] when
//! nothing arrives. After an idle period or an error the cursor is dropped
//! and reopened at the last position handed out. The reopened cursor must
//! yield that position first, otherwise entries were capped out while no
//! cursor was open.

use super::oplog::{OplogCollection, OplogStore, OplogStream, anchor_holds, entry_key};
use super::{OplogSource, SourceConfig, SourceItem, accept, check_continuity, decode_oplog};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::Client;
use rcaudit_core::{SequenceKey, TailingMode};
use tracing::{debug, info, warn};

/// Tailable cursor over the replica-set oplog.
pub struct ReplicaSetTail {
    oplog: Box<dyn OplogStore>,
    config: SourceConfig,
    stream: Option<OplogStream>,
    position: Option<SequenceKey>,
    /// Position the open cursor started at, until its first entry is seen.
    anchor: Option<SequenceKey>,
}

impl ReplicaSetTail {
    pub fn new(client: &Client, config: SourceConfig) -> Self {
        Self::with_store(Box::new(OplogCollection::new(client, "oplog.rs")), config)
    }

    pub(crate) fn with_store(oplog: Box<dyn OplogStore>, config: SourceConfig) -> Self {
        Self {
            oplog,
            config,
            stream: None,
            position: None,
            anchor: None,
        }
    }

    async fn open_cursor(&mut self) -> Result<()> {
        if let Some(position) = self.position {
            let oldest = self.oplog.oldest().await?;
            check_continuity(position, oldest, self.config.gap_tolerance)?;
        }

        let stream = self
            .oplog
            .tail(self.position, self.config.batch_size, self.config.idle_timeout)
            .await?;

        debug!(
            collection = self.oplog.name(),
            position = ?self.position.map(|k| k.to_string()),
            "Opened tailable oplog cursor"
        );
        self.stream = Some(stream);
        self.anchor = self.position;
        Ok(())
    }

    /// Gaps raised by the cursor name the last position handed out.
    fn cursor_failed(&mut self, err: Error) -> Error {
        self.stream = None;
        self.anchor = None;
        match (err, self.position) {
            (Error::Gap { oldest, .. }, Some(checkpoint)) => Error::Gap { checkpoint, oldest },
            (err, _) => err,
        }
    }
}

#[async_trait]
impl OplogSource for ReplicaSetTail {
    fn name(&self) -> &'static str {
        "replica-set"
    }

    fn mode(&self) -> TailingMode {
        TailingMode::ReplicaSet
    }

    async fn start(&mut self, resume: Option<SequenceKey>) -> Result<()> {
        self.stream = None;
        self.position = match resume {
            Some(key) => Some(key),
            None if self.config.from_beginning => None,
            None => self.oplog.newest().await?,
        };

        info!(
            position = ?self.position.map(|k| k.to_string()),
            from_checkpoint = resume.is_some(),
            "Starting replica-set oplog tail"
        );

        self.open_cursor().await
    }

    async fn next(&mut self) -> Result<SourceItem> {
        if self.stream.is_none() {
            self.open_cursor().await?;
        }

        // The driver keeps issuing getMores on an idle tailable cursor, so the
        // wait is bounded here as well.
        let wait = self.config.idle_timeout + self.config.idle_timeout / 2;
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(SourceItem::Idle);
            };

            let doc = match tokio::time::timeout(wait, stream.try_next()).await {
                Err(_) | Ok(Ok(None)) => {
                    self.stream = None;
                    self.anchor = None;
                    return Ok(SourceItem::Idle);
                }
                Ok(Err(e)) => return Err(self.cursor_failed(e)),
                Ok(Ok(Some(doc))) => doc,
            };

            if let Some(anchor) = self.anchor.take() {
                let held = entry_key(&doc)
                    .and_then(|first| anchor_holds(anchor, first, self.config.gap_tolerance));
                match held {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => return Err(self.cursor_failed(e)),
                }
            }

            match decode_oplog(&doc) {
                Ok(decoded) => return Ok(accept(&mut self.position, decoded)),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable oplog entry");
                    metrics::counter!("oplog_entries_skipped_total", "reason" => "malformed")
                        .increment(1);
                    // Step past it so a reopened cursor does not return it again.
                    if let Ok(key) = entry_key(&doc) {
                        self.position = Some(key);
                        return Ok(SourceItem::Skipped(key));
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
        self.anchor = None;
    }
}
