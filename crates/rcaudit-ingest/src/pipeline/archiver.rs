//! Attachment archival.
//!
//! This module provides the [`FileArchiver`], which copies one upload into
//! the archive, and the [`ArchivePool`], which drains the durable archive
//! queue with a bounded number of concurrent workers.
//!
//! # Archive Layout
//!
//! ```text
//! <archive>/<file_id>/<sha256>       one immutable copy per content version
//! <archive>/.tmp/                    in-progress copies
//! <archive>/archive-journal.log      integrity-framed ArchiveEntry journal
//! ```
//!
//! Content is streamed into `.tmp` while it is hashed. If the index already
//! holds that (file id, checksum) pair the copy is discarded. A new checksum
//! for a file that was archived before is kept as an additional version and
//! flagged, never overwriting the earlier copy.
//!
//! File ids are percent-encoded into directory names. All file system and
//! state store work happens off the async workers.

use super::filestore::{ContentReader, FileStore};
use super::{blocking, encode_file_name, open_framed, sync_dir};
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, retry};
use crate::state::StateDb;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcaudit_core::{ARCHIVE_JOURNAL, ArchiveEntry, ArchiveStatus, encode_line};
use serde::{Deserialize, Serialize};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const TMP_DIR: &str = ".tmp";
const COPY_BUFFER: usize = 64 * 1024;

/// Configuration for the file archiver.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Root of the archive.
    pub archive_dir: PathBuf,

    /// Maximum concurrent archive jobs.
    /// Default: 4
    pub workers: usize,

    /// Backoff for transient copy failures, and between re-runs of a job
    /// whose outcome could not be recorded.
    pub retry: RetryConfig,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("./archive"),
            workers: 4,
            retry: RetryConfig::default(),
        }
    }
}

/// A queued request to archive one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveJob {
    pub file_id: String,
    pub room_id: String,
    pub message_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl ArchiveJob {
    pub fn new(file_id: &str, room_id: &str, message_id: &str) -> Self {
        Self {
            file_id: file_id.to_string(),
            room_id: room_id.to_string(),
            message_id: message_id.to_string(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Result of archiving one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// First copy of this file.
    Archived(ArchiveEntry),
    /// The same content was already archived; the existing entry is returned.
    Unchanged(ArchiveEntry),
    /// The file was archived before with different content; this version was
    /// added alongside the earlier one.
    Conflict(ArchiveEntry),
    /// The file could not be archived.
    Degraded(ArchiveEntry),
}

impl ArchiveOutcome {
    pub fn entry(&self) -> &ArchiveEntry {
        match self {
            Self::Archived(e) | Self::Unchanged(e) | Self::Conflict(e) | Self::Degraded(e) => e,
        }
    }
}

/// A verified copy waiting in the temp directory.
struct StagedCopy {
    path: PathBuf,
    checksum: String,
    size: u64,
}

/// Copies uploads into the content-addressed archive.
pub struct FileArchiver {
    config: ArchiverConfig,
    store: FileStore,
    state: Arc<StateDb>,
    tmp_dir: PathBuf,
    journal: Arc<Mutex<File>>,
}

impl FileArchiver {
    pub fn new(config: ArchiverConfig, store: FileStore, state: Arc<StateDb>) -> Result<Self> {
        let tmp_dir = config.archive_dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;

        // Leftovers from an interrupted copy are never referenced.
        for entry in fs::read_dir(&tmp_dir)? {
            let entry = entry?;
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "Failed to remove stale temp copy");
            }
        }

        let (journal, outcome) =
            open_framed(&config.archive_dir.join(ARCHIVE_JOURNAL), |_: ArchiveEntry, _| {})?;
        info!(
            "File archiver ready: archive={}, journal entries={}",
            config.archive_dir.display(),
            outcome.records
        );

        Ok(Self {
            config,
            store,
            state,
            tmp_dir,
            journal: Arc::new(Mutex::new(journal)),
        })
    }

    pub fn archive_dir(&self) -> &Path {
        &self.config.archive_dir
    }

    /// Directory holding every archived version of a file.
    pub fn file_dir(&self, file_id: &str) -> PathBuf {
        self.config.archive_dir.join(encode_file_name(file_id))
    }

    /// Archive one upload.
    ///
    /// Permanent failures (missing source, content that keeps changing size)
    /// produce a degraded entry. An `Err` means the outcome could not be
    /// recorded; the job stays queued.
    pub async fn archive(&self, job: &ArchiveJob) -> Result<ArchiveOutcome> {
        let staged = retry(&self.config.retry, "archive copy", || {
            self.stage(&job.file_id)
        })
        .await;

        match staged {
            Ok(staged) => {
                let staged_path = staged.path.clone();
                let committed = self.commit(job, staged).await;
                if committed.is_err() {
                    let _ = tokio::fs::remove_file(&staged_path).await;
                }
                committed
            }
            Err(e) => self.degrade(job, &e).await,
        }
    }

    /// Stream a file into the temp directory while hashing it.
    async fn stage(&self, file_id: &str) -> Result<StagedCopy> {
        let (mut reader, expected) = self.store.open(file_id).await?;
        let path = self.tmp_dir.join(format!(
            "{}.{:016x}.part",
            encode_file_name(file_id),
            fastrand::u64(..)
        ));

        let copied = copy_hashed(&mut reader, &path).await.and_then(|(checksum, size)| {
            match expected {
                Some(expected) if expected != size => Err(Error::ContentMismatch {
                    file_id: file_id.to_string(),
                    reason: format!("expected {expected} bytes, copied {size}"),
                }),
                _ => Ok(StagedCopy {
                    path: path.clone(),
                    checksum,
                    size,
                }),
            }
        });

        if copied.is_err() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        copied
    }

    async fn commit(&self, job: &ArchiveJob, staged: StagedCopy) -> Result<ArchiveOutcome> {
        let (existing, versions) = {
            let state = Arc::clone(&self.state);
            let file_id = job.file_id.clone();
            let checksum = staged.checksum.clone();
            blocking(move || {
                let existing = state.archive_entry(&file_id, &checksum)?;
                let versions = state
                    .archive_entries(&file_id)?
                    .iter()
                    .filter(|e| e.status == ArchiveStatus::Archived)
                    .count();
                Ok((existing, versions))
            })
            .await?
        };

        if let Some(existing) = existing {
            tokio::fs::remove_file(&staged.path).await?;
            let state = Arc::clone(&self.state);
            let done = job.clone();
            blocking(move || state.remove_job(&done)).await?;
            metrics::counter!("archive_files_unchanged_total").increment(1);
            debug!(file_id = %job.file_id, "Attachment content unchanged");
            return Ok(ArchiveOutcome::Unchanged(existing));
        }

        let dir = self.file_dir(&job.file_id);
        let created = !tokio::fs::try_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(&staged.checksum);
        tokio::fs::rename(&staged.path, &dest).await?;
        let archive_dir = self.config.archive_dir.clone();
        blocking(move || {
            sync_dir(&dir)?;
            if created {
                sync_dir(&archive_dir)?;
            }
            Ok(())
        })
        .await?;

        let mut entry = ArchiveEntry {
            file_id: job.file_id.clone(),
            source: self.store.locator(&job.file_id),
            archive_path: Some(dest),
            checksum: Some(staged.checksum),
            size_bytes: staged.size,
            copied_at: Utc::now(),
            status: ArchiveStatus::Archived,
            reason: None,
            room_id: Some(job.room_id.clone()),
            message_id: Some(job.message_id.clone()),
        };

        if versions > 0 {
            warn!(
                file_id = %job.file_id,
                versions = versions + 1,
                "Attachment content changed since it was archived; keeping both versions"
            );
            metrics::counter!("archive_checksum_conflicts_total").increment(1);
            entry.reason = Some(format!(
                "content differs from {versions} earlier archived version(s)"
            ));
        }

        self.record(&entry, job).await?;

        metrics::counter!("archive_files_archived_total").increment(1);
        metrics::counter!("archive_bytes_total").increment(entry.size_bytes);

        Ok(if versions > 0 {
            ArchiveOutcome::Conflict(entry)
        } else {
            ArchiveOutcome::Archived(entry)
        })
    }

    async fn degrade(&self, job: &ArchiveJob, cause: &Error) -> Result<ArchiveOutcome> {
        warn!(
            file_id = %job.file_id,
            room_id = %job.room_id,
            error = %cause,
            "Attachment could not be archived; recording degraded entry"
        );

        let entry = ArchiveEntry {
            file_id: job.file_id.clone(),
            source: self.store.locator(&job.file_id),
            archive_path: None,
            checksum: None,
            size_bytes: 0,
            copied_at: Utc::now(),
            status: ArchiveStatus::Degraded,
            reason: Some(cause.to_string()),
            room_id: Some(job.room_id.clone()),
            message_id: Some(job.message_id.clone()),
        };

        self.record(&entry, job).await?;
        metrics::counter!("archive_files_degraded_total").increment(1);

        Ok(ArchiveOutcome::Degraded(entry))
    }

    /// Append an entry to the journal, then index it and retire its job.
    async fn record(&self, entry: &ArchiveEntry, job: &ArchiveJob) -> Result<()> {
        let (line, _) = encode_line(entry)?;
        let journal = Arc::clone(&self.journal);
        let state = Arc::clone(&self.state);
        let (entry, job) = (entry.clone(), job.clone());
        blocking(move || {
            {
                let mut journal = journal.lock();
                journal.write_all(&line)?;
                journal.sync_data()?;
            }
            state.record_archive(&entry, &job)
        })
        .await
    }
}

/// Copy `reader` to a new file at `path`, returning the hex SHA-256 and size.
async fn copy_hashed(reader: &mut ContentReader, path: &Path) -> Result<(String, u64)> {
    let mut out = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    out.sync_all().await?;
    Ok((hex::encode(hasher.finalize()), size))
}

/// Outcome counts of an [`ArchivePool`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchivePoolStats {
    pub archived: u64,
    pub unchanged: u64,
    pub conflicts: u64,
    pub degraded: u64,
    /// Attempts whose outcome could not be recorded (each is retried).
    pub failed: u64,
    /// Jobs cut off by the shutdown grace period (still queued durably).
    pub abandoned: u64,
}

/// Bounded worker pool over the durable archive queue.
pub struct ArchivePool;

impl ArchivePool {
    /// Start the pool. Jobs left in the queue by an earlier run are
    /// dispatched first.
    pub fn spawn(archiver: Arc<FileArchiver>, state: Arc<StateDb>, workers: usize) -> Result<ArchiveHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let pending = state.pending_jobs()?;
        if !pending.is_empty() {
            info!("Resuming {} queued archive jobs", pending.len());
        }
        metrics::gauge!("archive_queue_depth").set(pending.len() as f64);
        for job in pending {
            // The receiver is alive until the dispatcher exits.
            let _ = tx.send(job);
        }

        let dispatcher = tokio::spawn(dispatch(archiver, rx, stop_rx, workers.max(1)));

        Ok(ArchiveHandle {
            queue: ArchiveQueue { tx, state },
            stop: stop_tx,
            dispatcher,
        })
    }
}

/// Producer side of the archive queue.
#[derive(Clone)]
pub struct ArchiveQueue {
    tx: mpsc::UnboundedSender<ArchiveJob>,
    state: Arc<StateDb>,
}

impl ArchiveQueue {
    /// Durably queue a job, then hand it to the workers.
    ///
    /// Only the durable write can fail. A pool that has already stopped
    /// leaves the job queued for the next start.
    pub async fn enqueue(&self, job: ArchiveJob) -> Result<()> {
        let state = Arc::clone(&self.state);
        let queued = job.clone();
        blocking(move || state.put_job(&queued)).await?;
        metrics::gauge!("archive_queue_depth").increment(1.0);

        if self.tx.send(job).is_err() {
            warn!("Archive pool has stopped; job stays queued until the next start");
        }
        Ok(())
    }
}

/// Handle used to feed and stop an [`ArchivePool`].
pub struct ArchiveHandle {
    queue: ArchiveQueue,
    stop: watch::Sender<bool>,
    dispatcher: tokio::task::JoinHandle<ArchivePoolStats>,
}

impl ArchiveHandle {
    /// A producer for this pool. The pool keeps draining until every
    /// producer is dropped and [`ArchiveHandle::shutdown`] is called.
    pub fn queue(&self) -> ArchiveQueue {
        self.queue.clone()
    }

    pub async fn enqueue(&self, job: ArchiveJob) -> Result<()> {
        self.queue.enqueue(job).await
    }

    /// Stop accepting jobs and let queued and in-flight jobs finish within
    /// `grace`. Jobs that do not finish in time stay in the durable queue.
    pub async fn shutdown(self, grace: Duration) -> ArchivePoolStats {
        let Self {
            queue,
            stop,
            mut dispatcher,
        } = self;
        drop(queue);

        match tokio::time::timeout(grace, &mut dispatcher).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs_f64(),
                    "Archive jobs still running after grace period; leaving them queued"
                );
                let _ = stop.send(true);
                dispatcher.await.unwrap_or_default()
            }
        }
    }
}

type JobKey = (String, String);

fn job_key(job: &ArchiveJob) -> JobKey {
    (job.file_id.clone(), job.message_id.clone())
}

/// Dispatcher bookkeeping.
///
/// At most one job per file id runs at a time; later jobs for the same file
/// wait for it and then run in order. A job whose outcome could not be
/// recorded is re-run after a backoff.
struct Dispatch {
    archiver: Arc<FileArchiver>,
    workers: usize,
    tasks: JoinSet<(ArchiveJob, Result<ArchiveOutcome>)>,
    delayed: JoinSet<ArchiveJob>,
    ready: VecDeque<ArchiveJob>,
    in_flight: HashSet<String>,
    waiting: HashMap<String, VecDeque<ArchiveJob>>,
    failures: HashMap<JobKey, u32>,
    stats: ArchivePoolStats,
}

impl Dispatch {
    fn start_ready(&mut self) {
        while self.tasks.len() < self.workers {
            let Some(job) = self.ready.pop_front() else {
                break;
            };

            if !self.in_flight.insert(job.file_id.clone()) {
                debug!(file_id = %job.file_id, message_id = %job.message_id, "File already in flight; job waits");
                self.waiting.entry(job.file_id.clone()).or_default().push_back(job);
                continue;
            }

            let archiver = Arc::clone(&self.archiver);
            self.tasks.spawn(async move {
                let outcome = AssertUnwindSafe(archiver.archive(&job))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(Error::Task("archive worker panicked".to_string())));
                (job, outcome)
            });
        }
    }

    fn finished(&mut self, job: ArchiveJob, outcome: Result<ArchiveOutcome>) {
        self.in_flight.remove(&job.file_id);
        if let Some(waiting) = self.waiting.remove(&job.file_id) {
            self.ready.extend(waiting);
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.failed += 1;
                let failures = self.failures.entry(job_key(&job)).or_insert(0);
                let delay = self.archiver.config.retry.delay(*failures);
                *failures += 1;
                error!(
                    file_id = %job.file_id,
                    error = %e,
                    attempt = *failures,
                    delay_ms = delay.as_millis() as u64,
                    "Archive job failed; retrying"
                );
                self.delayed.spawn(async move {
                    tokio::time::sleep(delay).await;
                    job
                });
                return;
            }
        };

        self.failures.remove(&job_key(&job));
        metrics::gauge!("archive_queue_depth").decrement(1.0);
        match outcome {
            ArchiveOutcome::Archived(_) => self.stats.archived += 1,
            ArchiveOutcome::Unchanged(_) => self.stats.unchanged += 1,
            ArchiveOutcome::Conflict(_) => self.stats.conflicts += 1,
            ArchiveOutcome::Degraded(_) => self.stats.degraded += 1,
        }
    }

    fn queued(&self) -> u64 {
        let waiting: usize = self.waiting.values().map(VecDeque::len).sum();
        (self.tasks.len() + self.delayed.len() + self.ready.len() + waiting) as u64
    }
}

async fn dispatch(
    archiver: Arc<FileArchiver>,
    mut rx: mpsc::UnboundedReceiver<ArchiveJob>,
    mut stop: watch::Receiver<bool>,
    workers: usize,
) -> ArchivePoolStats {
    let mut d = Dispatch {
        archiver,
        workers,
        tasks: JoinSet::new(),
        delayed: JoinSet::new(),
        ready: VecDeque::new(),
        in_flight: HashSet::new(),
        waiting: HashMap::new(),
        failures: HashMap::new(),
        stats: ArchivePoolStats::default(),
    };
    let mut open = true;

    loop {
        d.start_ready();

        if !open && d.tasks.is_empty() && d.ready.is_empty() {
            if !d.delayed.is_empty() {
                warn!(jobs = d.delayed.len(), "Archive jobs awaiting retry stay queued");
                d.stats.abandoned += d.delayed.len() as u64;
                d.delayed.abort_all();
            }
            break;
        }

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    d.stats.abandoned += d.queued();
                    d.tasks.abort_all();
                    d.delayed.abort_all();
                    break;
                }
            }
            Some(joined) = d.tasks.join_next(), if !d.tasks.is_empty() => match joined {
                Ok((job, outcome)) => d.finished(job, outcome),
                Err(e) => error!(error = %e, "Archive worker was cancelled"),
            },
            Some(joined) = d.delayed.join_next(), if !d.delayed.is_empty() => {
                if let Ok(job) = joined {
                    d.ready.push_back(job);
                }
            }
            job = rx.recv(), if open && d.tasks.len() < workers => match job {
                Some(job) => d.ready.push_back(job),
                None => open = false,
            },
        }
    }

    let stats = d.stats;
    info!(
        "Archive pool stopped: archived={}, unchanged={}, conflicts={}, degraded={}, failed={}, abandoned={}",
        stats.archived, stats.unchanged, stats.conflicts, stats.degraded, stats.failed, stats.abandoned
    );
    stats
}
