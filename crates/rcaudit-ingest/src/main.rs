//! Rocket.Chat audit recorder daemon.
//!
//! Tails the MongoDB oplog, records every message create, edit and delete in
//! per-room audit logs, and archives uploaded files referenced by messages.
//!
//! # Usage
//!
//! ```bash
//! # Replica set, audit logs only
//! rcaudit -H mongodb://db1:27017 -o /var/log/rocketchat-audit
//!
//! # Archive uploads stored in GridFS
//! rcaudit -o /var/log/rocketchat-audit -f gridfs -a /srv/audit-files
//!
//! # Legacy master/slave deployment, filesystem uploads
//! rcaudit -m -o /var/log/rocketchat-audit -f /srv/uploads -a /srv/audit-files
//! ```
//!
//! # Exit Codes
//!
//! - `0` graceful shutdown (SIGINT/SIGTERM)
//! - `2` compliance gap: the oplog no longer holds entries after the checkpoint
//! - `3` the oplog source could not be reached within the retry budget
//! - `1` any other failure

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use metrics::gauge;
use mongodb::Client;
use rcaudit_core::metrics::{init_metrics, start_metrics_server};
use rcaudit_ingest::{
    ArchivePool, ArchiverConfig, Classifier, ClassifierConfig, Coordinator, CoordinatorConfig,
    FileArchiver, FileStore, FileStoreLocation, MongoDirectory, OplogSource, PolledTail,
    ReplicaSetTail, RetryConfig, RoomAuditWriter, SourceConfig, StateDb, WriterConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Rocket.Chat audit recorder.
#[derive(Parser, Debug)]
#[command(name = "rcaudit")]
#[command(about = "Record Rocket.Chat message history from the MongoDB oplog")]
#[command(version)]
struct Args {
    /// Poll the legacy master/slave oplog instead of tailing a replica set
    #[arg(short = 'm', long, env = "RCAUDIT_MASTER_SLAVE")]
    master_slave: bool,

    /// MongoDB hostname or URI
    #[arg(short = 'H', long, env = "RCAUDIT_HOST", default_value = "mongodb://localhost:27017")]
    host: String,

    /// Root directory for per-room audit logs
    #[arg(short, long, env = "RCAUDIT_OUTPUT", default_value = "./audit")]
    output: PathBuf,

    /// Attachment source: `gridfs`, `gridfs:<bucket>`, or an upload directory
    #[arg(short = 'f', long, env = "RCAUDIT_FILE_STORE")]
    file_store: Option<FileStoreLocation>,

    /// Root directory for archived attachments (enables archiving)
    #[arg(short = 'a', long, env = "RCAUDIT_FILE_ARCHIVE")]
    file_archive: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Directory of the state database (checkpoint, archive index and queue)
    #[arg(long, env = "RCAUDIT_STATE_DIR", default_value = "./data/state")]
    state_dir: PathBuf,

    /// Without a checkpoint, start at the oldest retained oplog entry
    #[arg(long, env = "RCAUDIT_FROM_BEGINNING")]
    from_beginning: bool,

    /// Oplog time the oldest retained entry may lie past the checkpoint
    /// before it counts as a compliance gap
    #[arg(long, env = "RCAUDIT_GAP_TOLERANCE_SECS", default_value = "0")]
    gap_tolerance_secs: u64,

    /// Poll interval in master/slave mode
    #[arg(long, env = "RCAUDIT_POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Concurrent attachment copies
    #[arg(long, env = "RCAUDIT_ARCHIVE_WORKERS", default_value = "4")]
    archive_workers: usize,

    /// Rocket.Chat database name
    #[arg(long, env = "RCAUDIT_ROCKETCHAT_DB", default_value = "rocketchat")]
    rocketchat_db: String,

    /// Collection holding chat messages
    #[arg(long, env = "RCAUDIT_MESSAGE_COLLECTION", default_value = "rocketchat_message")]
    message_collection: String,

    /// Persist the checkpoint after this many entries
    #[arg(long, env = "RCAUDIT_CHECKPOINT_EVERY", default_value = "100")]
    checkpoint_every: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "RCAUDIT_METRICS_PORT", default_value = "0")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            let code = e
                .downcast_ref::<rcaudit_ingest::Error>()
                .map_or(1, rcaudit_ingest::Error::exit_code);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Accept a bare hostname as well as a full connection string.
fn mongo_uri(host: &str) -> String {
    if host.starts_with("mongodb://") || host.starts_with("mongodb+srv://") {
        host.to_string()
    } else {
        format!("mongodb://{host}")
    }
}

async fn run(args: Args) -> Result<()> {
    tracing::info!("Rocket.Chat audit recorder starting...");

    if args.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(args.metrics_port, handle)
            .await
            .with_context(|| format!("Failed to start metrics server on port {}", args.metrics_port))?;
        gauge!("recorder_running").set(1.0);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, draining...");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let client = Client::with_uri_str(mongo_uri(&args.host))
        .await
        .with_context(|| format!("Invalid MongoDB address {}", args.host))?;

    let state = Arc::new(
        StateDb::open(&args.state_dir)
            .with_context(|| format!("Failed to open state database at {}", args.state_dir.display()))?,
    );

    let writer = Arc::new(
        RoomAuditWriter::new(WriterConfig {
            output_dir: args.output.clone(),
            ..Default::default()
        })
        .with_context(|| format!("Failed to prepare audit directory {}", args.output.display()))?,
    );

    let directory = MongoDirectory::new(&client, &args.rocketchat_db, &args.message_collection);
    let classifier = Classifier::new(ClassifierConfig {
        namespace_suffixes: vec![args.message_collection.clone()],
        ..Default::default()
    })
    .with_directory(Arc::new(directory))
    .with_state(Arc::clone(&state));

    let source_config = SourceConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        gap_tolerance: Duration::from_secs(args.gap_tolerance_secs),
        from_beginning: args.from_beginning,
        ..Default::default()
    };
    let source: Box<dyn OplogSource> = if args.master_slave {
        Box::new(PolledTail::new(&client, source_config))
    } else {
        Box::new(ReplicaSetTail::new(&client, source_config))
    };

    tracing::info!("Configuration:");
    tracing::info!("  Mode: {}", source.mode());
    tracing::info!("  Output: {}", args.output.display());
    tracing::info!("  State: {}", args.state_dir.display());
    tracing::info!(
        "  Archive: {}",
        args.file_archive
            .as_ref()
            .map_or_else(|| "disabled".to_string(), |p| p.display().to_string())
    );

    let mut coordinator = Coordinator::new(
        CoordinatorConfig {
            checkpoint_every: args.checkpoint_every.max(1),
            ..Default::default()
        },
        source,
        Arc::new(classifier),
        writer,
        Arc::clone(&state),
    )
    .with_shutdown(shutdown);

    match (&args.file_archive, &args.file_store) {
        (Some(archive_dir), Some(location)) => {
            let store = FileStore::open_location(location, Some(&client), &args.rocketchat_db)?;
            let archiver = FileArchiver::new(
                ArchiverConfig {
                    archive_dir: archive_dir.clone(),
                    workers: args.archive_workers.max(1),
                    retry: RetryConfig::default(),
                },
                store,
                Arc::clone(&state),
            )
            .with_context(|| format!("Failed to prepare archive directory {}", archive_dir.display()))?;

            let pool = ArchivePool::spawn(Arc::new(archiver), state, args.archive_workers.max(1))?;
            coordinator = coordinator.with_archiver(pool);
        }
        (Some(_), None) => {
            anyhow::bail!("--file-archive requires --file-store");
        }
        (None, Some(_)) => {
            tracing::warn!("--file-store given without --file-archive; attachments will not be archived");
        }
        (None, None) => {}
    }

    let summary = coordinator.run().await?;

    gauge!("recorder_running").set(0.0);

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Entries read:         {}", summary.entries);
    tracing::info!("Records written:      {}", summary.records_written);
    tracing::info!("Replays skipped:      {}", summary.duplicates);
    tracing::info!("Attachments queued:   {}", summary.attachments_queued);
    if summary.stalls > 0 {
        tracing::info!("Stalled retry rounds: {}", summary.stalls);
    }
    if let Some(archive) = &summary.archive {
        tracing::info!(
            "Archive:              {} archived, {} unchanged, {} conflicts, {} degraded, {} left queued",
            archive.archived,
            archive.unchanged,
            archive.conflicts,
            archive.degraded,
            archive.abandoned
        );
    }
    if let Some(checkpoint) = summary.checkpoint {
        tracing::info!("Checkpoint:           {}", checkpoint);
    }

    Ok(())
}
