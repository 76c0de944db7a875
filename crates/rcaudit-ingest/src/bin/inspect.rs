//! Audit inspector.
//!
//! Reads the per-room audit logs and the archive journal written by the
//! recorder and prints what happened within a time window as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Today's chat logs, grouped by room
//! rcaudit-inspect -o /var/log/rocketchat-audit -t today logs
//!
//! # Full audit records from the last six hours
//! rcaudit-inspect -o /var/log/rocketchat-audit -t -6h logs --raw
//!
//! # Files archived over a date range
//! rcaudit-inspect -a /srv/audit-files -t 2016-10-11,2016-10-13 files
//! ```

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{ArgAction, Parser, Subcommand};
use rcaudit_core::{
    ARCHIVE_JOURNAL, AUDIT_LOG_EXTENSION, ArchiveEntry, AuditRecord, TimeWindow, read_all,
    read_audit_log,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rcaudit-inspect")]
#[command(about = "Show recorded Rocket.Chat audit data for a time window")]
#[command(version)]
struct Args {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Root directory of the per-room audit logs
    #[arg(short, long, env = "RCAUDIT_OUTPUT", default_value = "./audit")]
    output: PathBuf,

    /// Root directory of archived attachments
    #[arg(short = 'a', long, env = "RCAUDIT_FILE_ARCHIVE")]
    file_archive: Option<PathBuf>,

    /// Time window: today, yesterday, a lookback like -24h, or YYYY-MM-DD,YYYY-MM-DD
    #[arg(short, long, default_value = "today")]
    time: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat messages per room
    Logs {
        /// Print complete audit records instead of one line per event
        #[arg(long)]
        raw: bool,
    },
    /// Archive journal entries
    Files,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let window = TimeWindow::parse(&args.time, Utc::now())
        .with_context(|| format!("Invalid time window '{}'", args.time))?;

    let json = match args.command {
        Command::Logs { raw: false } => serde_json::to_string_pretty(&chat_logs(&args.output, &window)?)?,
        Command::Logs { raw: true } => serde_json::to_string_pretty(&audit_records(&args.output, &window)?)?,
        Command::Files => {
            let archive = args
                .file_archive
                .context("--file-archive is required to list archived files")?;
            serde_json::to_string_pretty(&archived_files(&archive, &window)?)?
        }
    };
    println!("{json}");

    Ok(())
}

/// Paths of every room log under `dir`, sorted.
fn room_logs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == AUDIT_LOG_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Records whose event happened within `window`, across all rooms.
fn audit_records(dir: &Path, window: &TimeWindow) -> Result<Vec<AuditRecord>> {
    let mut selected = Vec::new();
    for path in room_logs(dir)? {
        let (records, outcome) = read_audit_log(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if let Some(damage) = outcome.damage {
            warn!("{}: only the first {} records verified ({:?})", path.display(), outcome.records, damage);
        }
        selected.extend(records.into_iter().filter(|r| window.contains(r.event.occurred_at)));
    }
    Ok(selected)
}

/// One line per event, grouped by room name (or id when unnamed).
fn chat_logs(dir: &Path, window: &TimeWindow) -> Result<BTreeMap<String, Vec<String>>> {
    let mut rooms: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in audit_records(dir, window)? {
        let event = &record.event;
        let room = event.room_name.clone().unwrap_or_else(|| record.room_id.clone());
        let line = format!(
            "{} [{}] {}: {}",
            event.occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            event.event_type,
            event.actor().unwrap_or("unknown"),
            event.text.as_deref().unwrap_or_default()
        );
        rooms.entry(room).or_default().push(line);
    }
    Ok(rooms)
}

/// Archive journal entries copied within `window`.
fn archived_files(archive_dir: &Path, window: &TimeWindow) -> Result<Vec<ArchiveEntry>> {
    let path = archive_dir.join(ARCHIVE_JOURNAL);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let (entries, outcome) = read_all::<ArchiveEntry>(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if let Some(damage) = outcome.damage {
        warn!("{}: only the first {} entries verified ({:?})", path.display(), outcome.records, damage);
    }
    Ok(entries
        .into_iter()
        .filter(|e| window.contains(e.copied_at))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use rcaudit_core::{
        ArchiveNote, ArchiveStatus, EventType, MessageEvent, Sender, SequenceKey, encode_line,
    };
    use std::io::Write;
    use tempfile::TempDir;

    fn event(room: &str, name: Option<&str>, text: &str, at: DateTime<Utc>) -> MessageEvent {
        MessageEvent {
            event_type: EventType::Created,
            room_id: room.to_string(),
            room_name: name.map(str::to_string),
            message_id: format!("{room}-{text}"),
            sender: Some(Sender {
                id: "u1".to_string(),
                username: Some("alice".to_string()),
            }),
            edited_by: None,
            text: Some(text.to_string()),
            message_kind: None,
            attachments: Vec::new(),
            occurred_at: at,
            source_key: SequenceKey::new(at.timestamp() as u32, 1),
            tombstone: false,
        }
    }

    fn write_framed<T: serde::Serialize>(path: &Path, values: &[T]) {
        let mut file = std::fs::File::create(path).unwrap();
        for value in values {
            let (line, _) = encode_line(value).unwrap();
            file.write_all(&line).unwrap();
        }
    }

    fn record(seq: u64, event: MessageEvent) -> AuditRecord {
        AuditRecord {
            room_sequence: seq,
            room_id: event.room_id.clone(),
            event,
            written_at: Utc::now(),
            archive: ArchiveNote::None,
            integrity: None,
        }
    }

    #[test]
    fn test_chat_logs_grouped_by_room_and_windowed() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let old = now - Duration::days(3);

        write_framed(
            &tmp.path().join("R1.log"),
            &[
                record(1, event("R1", Some("general"), "old news", old)),
                record(2, event("R1", Some("general"), "fresh", now)),
            ],
        );
        write_framed(&tmp.path().join("R2.log"), &[record(1, event("R2", None, "hi", now))]);
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let window = TimeWindow::parse("-1d", now + Duration::seconds(1)).unwrap();
        let logs = chat_logs(tmp.path(), &window).unwrap();

        assert_eq!(logs.len(), 2);
        assert_eq!(logs["general"].len(), 1);
        assert!(logs["general"][0].ends_with("[created] alice: fresh"));
        assert!(logs["R2"][0].ends_with("alice: hi"));
    }

    #[test]
    fn test_torn_log_still_lists_verified_records() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let path = tmp.path().join("R1.log");
        write_framed(&path, &[record(1, event("R1", None, "kept", now))]);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"0000002a:deadbeef")
            .unwrap();

        let window = TimeWindow::parse("-1h", now + Duration::seconds(1)).unwrap();
        let records = audit_records(tmp.path(), &window).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.text.as_deref(), Some("kept"));
    }

    #[test]
    fn test_archived_files_filters_journal() {
        let tmp = TempDir::new().unwrap();
        let now = Utc::now();
        let entry = |file_id: &str, copied_at| ArchiveEntry {
            file_id: file_id.to_string(),
            source: format!("gridfs:rocketchat_uploads/{file_id}"),
            archive_path: None,
            checksum: None,
            size_bytes: 0,
            copied_at,
            status: ArchiveStatus::Degraded,
            reason: Some("source missing".to_string()),
            room_id: None,
            message_id: None,
        };
        write_framed(
            &tmp.path().join(ARCHIVE_JOURNAL),
            &[entry("f-old", now - Duration::days(2)), entry("f-new", now)],
        );

        let window = TimeWindow::parse("-1d", now + Duration::seconds(1)).unwrap();
        let files = archived_files(tmp.path(), &window).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_id, "f-new");

        let empty = TempDir::new().unwrap();
        assert!(archived_files(empty.path(), &window).unwrap().is_empty());
    }
}
