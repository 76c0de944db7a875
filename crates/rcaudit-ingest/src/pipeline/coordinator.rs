//! Pipeline coordinator.
//!
//! Pulls change entries from the source, classifies them, appends the
//! resulting records, hands attachments to the archive queue and advances
//! the checkpoint once every record of an entry is durable.
//!
//! # Phases
//!
//! ```text
//! Starting → Tailing ⇄ Backoff
//!               ↓
//!           Draining → Stopped
//!
//! Starting | Tailing | Backoff → Fatal
//! ```
//!
//! The checkpoint is persisted every `checkpoint_every` confirmed entries,
//! whenever the source is idle, and while draining. Archival never gates it.
//!
//! Only a gap, an unreachable source, a corrupt log or a configuration
//! mismatch stop the pipeline. Any other failure while handling an entry
//! stalls on that entry: it is retried with a capped backoff until it
//! succeeds, and neither the source nor the checkpoint moves meanwhile.

use super::archiver::{ArchiveHandle, ArchiveJob, ArchivePoolStats};
use super::blocking;
use super::writer::{AppendOutcome, RoomAuditWriter};
use crate::classify::Classifier;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, retry};
use crate::source::{ChangeEntry, OplogSource, SourceItem};
use crate::state::StateDb;
use chrono::Utc;
use rcaudit_core::{ArchiveNote, Checkpoint, EventType, SequenceKey};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Lower bound between attempts while stalled on an entry.
const MIN_STALL: Duration = Duration::from_millis(10);

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Persist the checkpoint after this many confirmed entries.
    /// Default: 100
    pub checkpoint_every: u64,

    /// Backoff for (re)opening and reading the source. Exhausting it is an
    /// unrecoverable source failure.
    pub source_retry: RetryConfig,

    /// Backoff for classification, append and queueing failures. Exhausting
    /// it does not stop the pipeline; the entry is retried at `max_delay`
    /// intervals until it goes through.
    pub write_retry: RetryConfig,

    /// How long in-flight archive jobs may run after shutdown begins.
    /// Default: 10 seconds
    pub archive_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: 100,
            source_retry: RetryConfig {
                max_attempts: 10,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(60),
                ..Default::default()
            },
            write_retry: RetryConfig::default(),
            archive_grace: Duration::from_secs(10),
        }
    }
}

/// Coordinator lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Tailing,
    Backoff,
    Draining,
    Stopped,
    Fatal,
}

/// Statistics from one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Change entries read from the source.
    pub entries: u64,

    /// Source positions without a document change.
    pub skipped: u64,

    pub records_written: u64,
    pub duplicates: u64,
    pub attachments_queued: u64,

    /// Times the pipeline stalled on an entry after a failure.
    pub stalls: u64,

    /// Last persisted checkpoint position.
    pub checkpoint: Option<SequenceKey>,

    /// The source reported end of stream.
    pub end_of_stream: bool,

    pub archive: Option<ArchivePoolStats>,
}

/// Drives the audit pipeline.
pub struct Coordinator {
    config: CoordinatorConfig,
    source: Box<dyn OplogSource>,
    classifier: Arc<Classifier>,
    writer: Arc<RoomAuditWriter>,
    state: Arc<StateDb>,
    archiver: Option<ArchiveHandle>,
    shutdown: Arc<AtomicBool>,
    phase: Phase,
    confirmed: Option<SequenceKey>,
    persisted: Option<SequenceKey>,
    since_checkpoint: u64,
    summary: RunSummary,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        source: Box<dyn OplogSource>,
        classifier: Arc<Classifier>,
        writer: Arc<RoomAuditWriter>,
        state: Arc<StateDb>,
    ) -> Self {
        Self {
            config,
            source,
            classifier,
            writer,
            state,
            archiver: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            phase: Phase::Starting,
            confirmed: None,
            persisted: None,
            since_checkpoint: 0,
            summary: RunSummary::default(),
        }
    }

    /// Queue attachments to this archive pool.
    pub fn with_archiver(mut self, archiver: ArchiveHandle) -> Self {
        self.archiver = Some(archiver);
        self
    }

    /// Stop gracefully once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "Coordinator phase change");
            self.phase = phase;
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run until shutdown, end of stream, or a fatal error.
    pub async fn run(mut self) -> Result<RunSummary> {
        match self.tail().await {
            Ok(()) => {
                self.enter(Phase::Draining);
                self.finish().await?;
                self.enter(Phase::Stopped);
                info!(
                    "Pipeline stopped: entries={}, records={}, duplicates={}, checkpoint={}",
                    self.summary.entries,
                    self.summary.records_written,
                    self.summary.duplicates,
                    self.summary
                        .checkpoint
                        .map_or_else(|| "none".to_string(), |k| k.to_string())
                );
                Ok(self.summary)
            }
            Err(e) => {
                self.enter(Phase::Fatal);
                error!(error = %e, "Pipeline halted");
                // Everything confirmed so far is still durable.
                if let Err(persist_err) = self.finish().await {
                    warn!(error = %persist_err, "Failed to flush state after fatal error");
                }
                Err(e)
            }
        }
    }

    async fn tail(&mut self) -> Result<()> {
        self.enter(Phase::Starting);
        let mode = self.source.mode();

        let checkpoint = self.state.load_checkpoint()?;
        if let Some(cp) = &checkpoint {
            if cp.mode != mode {
                return Err(Error::Config(format!(
                    "checkpoint was written in {} mode, refusing to resume in {} mode",
                    cp.mode, mode
                )));
            }
            info!("Resuming from checkpoint {}", cp.last_confirmed);
        } else {
            info!("No checkpoint found; starting {} source at its default position", self.source.name());
        }

        let resume = checkpoint.map(|cp| cp.last_confirmed);
        self.confirmed = resume;
        self.persisted = resume;
        self.summary.checkpoint = resume;

        let mut failures = 0u32;
        loop {
            if self.shutdown_requested() {
                return Ok(());
            }
            match self.source.start(resume).await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failures += 1;
                    self.backoff(failures, &e).await?;
                }
            }
        }

        self.enter(Phase::Tailing);
        let mut failures = 0u32;

        loop {
            let item = tokio::select! {
                item = self.source.next() => item,
                _ = wait_for(Arc::clone(&self.shutdown)) => return Ok(()),
            };

            match item {
                Ok(SourceItem::Entry(entry)) => {
                    failures = 0;
                    self.enter(Phase::Tailing);
                    self.summary.entries += 1;
                    metrics::counter!("oplog_entries_total").increment(1);
                    metrics::gauge!("oplog_lag_seconds")
                        .set((Utc::now() - entry.key.timestamp()).num_seconds() as f64);

                    if !self.process(&entry).await? {
                        return Ok(());
                    }
                    self.confirm(entry.key);
                }
                Ok(SourceItem::Skipped(key)) => {
                    failures = 0;
                    self.summary.skipped += 1;
                    metrics::counter!("oplog_entries_skipped_total", "reason" => "no_change")
                        .increment(1);
                    self.confirm(key);
                }
                Ok(SourceItem::Idle) => {
                    failures = 0;
                    self.enter(Phase::Tailing);
                    self.try_persist();
                }
                Ok(SourceItem::EndOfStream) => {
                    info!("Oplog source reached end of stream");
                    self.summary.end_of_stream = true;
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    failures += 1;
                    self.backoff(failures, &e).await?;
                }
            }

            if self.shutdown_requested() {
                return Ok(());
            }
        }
    }

    /// Wait before retrying the source, or give up once the budget is spent.
    async fn backoff(&mut self, failures: u32, cause: &Error) -> Result<()> {
        let max_attempts = self.config.source_retry.max_attempts;
        if failures >= max_attempts {
            return Err(Error::SourceUnavailable {
                attempts: failures,
                last_error: cause.to_string(),
            });
        }

        let delay = self.config.source_retry.delay(failures - 1);
        self.enter(Phase::Backoff);
        warn!(
            error = %cause,
            attempt = failures,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Oplog source error; backing off"
        );
        metrics::counter!("oplog_reconnects_total").increment(1);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for(Arc::clone(&self.shutdown)) => {}
        }
        Ok(())
    }

    /// Classify one entry and make its records durable.
    ///
    /// Returns `false` if shutdown interrupted a stall; the entry is then not
    /// confirmed and is read again on the next start.
    async fn process(&mut self, entry: &ChangeEntry) -> Result<bool> {
        let classifier = Arc::clone(&self.classifier);
        let Some(events) = self
            .until_done("classify entry", || classifier.classify(entry))
            .await?
        else {
            return Ok(false);
        };

        let queue = self.archiver.as_ref().map(ArchiveHandle::queue);
        for event in &events {
            let note = match (&queue, event.attachments.is_empty()) {
                (_, true) => ArchiveNote::None,
                (Some(_), false) => ArchiveNote::Queued,
                (None, false) => ArchiveNote::Disabled,
            };

            let writer = Arc::clone(&self.writer);
            let Some(outcome) = self
                .until_done("append audit record", || {
                    let writer = Arc::clone(&writer);
                    let event = event.clone();
                    blocking(move || writer.append(&event, note))
                })
                .await?
            else {
                return Ok(false);
            };

            match outcome {
                AppendOutcome::Written(record) => {
                    self.summary.records_written += 1;
                    debug!(
                        room_id = %record.room_id,
                        room_sequence = record.room_sequence,
                        event_type = %record.event.event_type,
                        "Audit record written"
                    );
                }
                AppendOutcome::Duplicate { .. } => self.summary.duplicates += 1,
            }

            if event.event_type == EventType::Deleted {
                let state = Arc::clone(&self.state);
                let Some(()) = self
                    .until_done("forget deleted message", || {
                        let state = Arc::clone(&state);
                        let message_id = event.message_id.clone();
                        blocking(move || state.remove_message(&message_id))
                    })
                    .await?
                else {
                    return Ok(false);
                };
            }

            // Queued for duplicates too: the job may not have been persisted
            // before a crash that followed the append.
            if let Some(queue) = &queue {
                for attachment in &event.attachments {
                    let job = ArchiveJob::new(&attachment.file_id, &event.room_id, &event.message_id);
                    let Some(()) = self
                        .until_done("queue attachment", || queue.enqueue(job.clone()))
                        .await?
                    else {
                        return Ok(false);
                    };
                    self.summary.attachments_queued += 1;
                }
            }
        }

        Ok(true)
    }

    /// Run `f` until it succeeds.
    ///
    /// Each round gets the `write_retry` budget. When a round is exhausted
    /// the pipeline stalls in [`Phase::Backoff`] and starts another one; only
    /// fatal errors end the loop. `Ok(None)` means shutdown was requested
    /// while stalled.
    async fn until_done<T, F, Fut>(&mut self, what: &str, mut f: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut stalls = 0u32;
        loop {
            let err = match retry(&self.config.write_retry, what, &mut f).await {
                Ok(value) => {
                    if stalls > 0 {
                        info!(stalls, "{what}: recovered");
                        self.enter(Phase::Tailing);
                    }
                    return Ok(Some(value));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => e,
            };

            if self.shutdown_requested() {
                warn!(error = %err, "{what}: giving up on shutdown; entry stays unconfirmed");
                return Ok(None);
            }

            let delay = self.config.write_retry.delay(stalls).max(MIN_STALL);
            stalls = stalls.saturating_add(1);
            self.summary.stalls += 1;
            self.enter(Phase::Backoff);
            error!(
                error = %err,
                stalls,
                delay_ms = delay.as_millis() as u64,
                "{what}: still failing; holding position"
            );
            metrics::counter!("pipeline_stalls_total").increment(1);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for(Arc::clone(&self.shutdown)) => {}
            }
        }
    }

    fn confirm(&mut self, key: SequenceKey) {
        self.confirmed = Some(key);
        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.config.checkpoint_every {
            self.try_persist();
        }
    }

    /// Persist while tailing. A failed write is retried at the next
    /// opportunity; records stay durable in the room logs either way.
    fn try_persist(&mut self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist checkpoint; will retry");
            metrics::counter!("checkpoint_write_errors_total").increment(1);
        }
    }

    fn persist(&mut self) -> Result<()> {
        let Some(key) = self.confirmed else {
            return Ok(());
        };
        if self.persisted == Some(key) {
            return Ok(());
        }

        self.state
            .store_checkpoint(&Checkpoint::new(self.source.mode(), key))?;
        self.persisted = Some(key);
        self.summary.checkpoint = Some(key);
        self.since_checkpoint = 0;

        metrics::counter!("checkpoint_writes_total").increment(1);
        metrics::gauge!("checkpoint_last_confirmed_seconds").set(f64::from(key.time));
        Ok(())
    }

    /// Flush the checkpoint, stop the archive pool and release the source.
    async fn finish(&mut self) -> Result<()> {
        let persisted = self.persist();

        if let Some(archiver) = self.archiver.take() {
            let stats = archiver.shutdown(self.config.archive_grace).await;
            self.summary.archive = Some(stats);
        }
        self.source.close().await;
        self.writer.close_all();

        persisted
    }
}

/// Resolves once `flag` is set.
async fn wait_for(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }
}
