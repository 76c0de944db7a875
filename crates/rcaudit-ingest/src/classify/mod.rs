//! Change entry classification.
//!
//! Maps oplog change entries on the message collection to message lifecycle
//! events. Every event carries the full message state at that moment:
//! inserts provide it directly, updates are merged onto the last known
//! snapshot, and deletes reuse that snapshot or fall back to a tombstone.
//!
//! Snapshots are looked up in the in-memory cache first, then in the state
//! store (which survives restarts and cache eviction), and for edits finally
//! in the [`Directory`].
//!
//! Malformed documents are logged and skipped. Directory failures are
//! returned as errors so the caller retries the entry instead of losing it.

mod directory;
mod snapshot;

pub use directory::{Directory, MemoryDirectory, MongoDirectory, room_display_name};
pub use snapshot::{MessageFields, apply_delta};

use crate::source::{ChangeEntry, Payload, UpdateDelta};
use crate::state::StateDb;
use crate::{Error, Result};
use bson::Document;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use rcaudit_core::{EventType, MessageEvent, UNRESOLVED_ROOM};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Namespace suffixes holding message documents.
    pub namespace_suffixes: Vec<String>,

    /// Maximum message snapshots kept in memory.
    pub snapshot_capacity: u64,

    /// Maximum room names kept in memory.
    pub room_capacity: u64,

    /// How long a resolved room name is trusted.
    pub room_name_ttl: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            namespace_suffixes: vec!["rocketchat_message".to_string()],
            snapshot_capacity: 100_000,
            room_capacity: 10_000,
            room_name_ttl: Duration::from_secs(600),
        }
    }
}

/// Turns change entries into message events.
pub struct Classifier {
    config: ClassifierConfig,
    snapshots: Cache<String, Document>,
    rooms: Cache<String, Option<String>>,
    directory: Option<Arc<dyn Directory>>,
    state: Option<Arc<StateDb>>,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let snapshots = Cache::builder()
            .max_capacity(config.snapshot_capacity)
            .build();
        let rooms = Cache::builder()
            .max_capacity(config.room_capacity)
            .time_to_live(config.room_name_ttl)
            .build();

        Self {
            config,
            snapshots,
            rooms,
            directory: None,
            state: None,
        }
    }

    /// Resolve snapshots and room names through `directory` on cache misses.
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Keep snapshots in `state` so edits and deletes seen after a restart
    /// still resolve to their room.
    pub fn with_state(mut self, state: Arc<StateDb>) -> Self {
        self.state = Some(state);
        self
    }

    /// Whether entries on `namespace` hold message documents.
    pub fn matches(&self, namespace: &str) -> bool {
        self.config
            .namespace_suffixes
            .iter()
            .any(|suffix| namespace.ends_with(suffix.as_str()))
    }

    /// Classify one change entry into zero or more message events.
    pub async fn classify(&self, entry: &ChangeEntry) -> Result<Vec<MessageEvent>> {
        if !self.matches(&entry.namespace) {
            return Ok(Vec::new());
        }

        let result = match &entry.payload {
            Payload::Insert(doc) => self.created(entry, doc).await,
            Payload::Update(delta) => self.edited(entry, delta).await,
            Payload::Delete => self.deleted(entry).await,
        };

        match result {
            Ok(event) => {
                metrics::counter!("classifier_events_total", "type" => event.event_type.to_string())
                    .increment(1);
                Ok(vec![event])
            }
            Err(Error::Core(e)) => {
                warn!(
                    key = %entry.key,
                    message_id = %entry.document_id,
                    error = %e,
                    "Skipping malformed message document"
                );
                metrics::counter!("classifier_malformed_total").increment(1);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn created(&self, entry: &ChangeEntry, doc: &Document) -> Result<MessageEvent> {
        let fields = MessageFields::parse(doc)?;
        self.remember(&entry.document_id, doc.clone()).await?;

        let occurred_at = fields.sent_at.unwrap_or_else(|| entry.key.timestamp());
        Ok(self
            .event(EventType::Created, entry, fields, occurred_at)
            .await)
    }

    async fn edited(&self, entry: &ChangeEntry, delta: &UpdateDelta) -> Result<MessageEvent> {
        let known = match self.snapshot(&entry.document_id).await? {
            Some(doc) => Some(doc),
            None => self.lookup_message(&entry.document_id).await?,
        };

        let snapshot = match known {
            Some(mut doc) => {
                apply_delta(&mut doc, delta);
                doc
            }
            None => {
                let mut doc = Document::new();
                apply_delta(&mut doc, delta);
                if !doc.contains_key("rid") {
                    warn!(
                        key = %entry.key,
                        message_id = %entry.document_id,
                        "No snapshot for edited message; recording under unresolved room"
                    );
                    doc.insert("rid", UNRESOLVED_ROOM);
                }
                doc
            }
        };

        let fields = MessageFields::parse(&snapshot)?;
        self.remember(&entry.document_id, snapshot).await?;

        let occurred_at = fields.edited_at.unwrap_or_else(|| entry.key.timestamp());
        Ok(self
            .event(EventType::Edited, entry, fields, occurred_at)
            .await)
    }

    /// The stored snapshot is left in place until the deletion is recorded;
    /// the caller retires it with [`StateDb::remove_message`].
    async fn deleted(&self, entry: &ChangeEntry) -> Result<MessageEvent> {
        let known = match self.snapshots.remove(&entry.document_id).await {
            Some(doc) => Some(doc),
            None => self.stored(&entry.document_id)?,
        };
        let fields = known.and_then(|doc| MessageFields::parse(&doc).ok());

        match fields {
            Some(fields) => Ok(self
                .event(EventType::Deleted, entry, fields, entry.key.timestamp())
                .await),
            None => {
                debug!(message_id = %entry.document_id, "Delete without snapshot; writing tombstone");
                Ok(MessageEvent {
                    event_type: EventType::Deleted,
                    room_id: UNRESOLVED_ROOM.to_string(),
                    room_name: None,
                    message_id: entry.document_id.clone(),
                    sender: None,
                    edited_by: None,
                    text: None,
                    message_kind: None,
                    attachments: Vec::new(),
                    occurred_at: entry.key.timestamp(),
                    source_key: entry.key,
                    tombstone: true,
                })
            }
        }
    }

    /// Last known snapshot from the cache or the state store.
    async fn snapshot(&self, message_id: &str) -> Result<Option<Document>> {
        if let Some(doc) = self.snapshots.get(message_id).await {
            return Ok(Some(doc));
        }
        self.stored(message_id)
    }

    fn stored(&self, message_id: &str) -> Result<Option<Document>> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        let doc = state.message(message_id)?;
        if doc.is_some() {
            metrics::counter!("classifier_snapshot_restores_total").increment(1);
        }
        Ok(doc)
    }

    async fn remember(&self, message_id: &str, doc: Document) -> Result<()> {
        if let Some(state) = &self.state {
            state.put_message(message_id, &doc)?;
        }
        self.snapshots.insert(message_id.to_string(), doc).await;
        Ok(())
    }

    async fn event(
        &self,
        event_type: EventType,
        entry: &ChangeEntry,
        fields: MessageFields,
        occurred_at: DateTime<Utc>,
    ) -> MessageEvent {
        let room_name = self.room_name(&fields.room_id).await;
        MessageEvent {
            event_type,
            room_id: fields.room_id,
            room_name,
            message_id: entry.document_id.clone(),
            sender: fields.sender,
            edited_by: match event_type {
                EventType::Edited => fields.edited_by,
                _ => None,
            },
            text: fields.text,
            message_kind: fields.kind,
            attachments: fields.attachments,
            occurred_at,
            source_key: entry.key,
            tombstone: false,
        }
    }

    async fn lookup_message(&self, message_id: &str) -> Result<Option<Document>> {
        let Some(directory) = &self.directory else {
            return Ok(None);
        };
        metrics::counter!("classifier_snapshot_lookups_total").increment(1);
        directory.message(message_id).await
    }

    /// Display name of a room; lookup failures leave the name unset.
    async fn room_name(&self, room_id: &str) -> Option<String> {
        if room_id == UNRESOLVED_ROOM {
            return None;
        }
        if let Some(name) = self.rooms.get(room_id).await {
            return name;
        }
        let directory = self.directory.as_ref()?;

        match directory.room_name(room_id).await {
            Ok(name) => {
                self.rooms.insert(room_id.to_string(), name.clone()).await;
                name
            }
            Err(e) => {
                warn!(room_id, error = %e, "Room name lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use rcaudit_core::SequenceKey;

    const NS: &str = "rocketchat.rocketchat_message";

    fn key(ordinal: u32) -> SequenceKey {
        SequenceKey::new(1_700_000_000, ordinal)
    }

    fn message(id: &str, rid: &str, text: &str) -> Document {
        doc! {
            "_id": id,
            "rid": rid,
            "msg": text,
            "ts": bson::DateTime::from_millis(1_700_000_000_000),
            "u": { "_id": "u1", "username": "alice" },
        }
    }

    fn edit(ordinal: u32, id: &str, text: &str) -> ChangeEntry {
        ChangeEntry::update(
            key(ordinal),
            NS,
            id,
            UpdateDelta::Fields {
                set: doc! {
                    "msg": text,
                    "editedAt": bson::DateTime::from_millis(1_700_000_060_000),
                    "editedBy": { "_id": "u2", "username": "bob" },
                },
                unset: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_lifecycle_carries_full_snapshots() {
        let classifier = Classifier::new(ClassifierConfig::default());

        let insert = ChangeEntry::insert(key(1), NS, message("m1", "R1", "hello")).unwrap();
        let created = classifier.classify(&insert).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].event_type, EventType::Created);
        assert_eq!(created[0].text.as_deref(), Some("hello"));
        assert_eq!(created[0].source_key, key(1));

        let edited = classifier.classify(&edit(2, "m1", "hello!")).await.unwrap();
        assert_eq!(edited[0].event_type, EventType::Edited);
        assert_eq!(edited[0].room_id, "R1");
        assert_eq!(edited[0].text.as_deref(), Some("hello!"));
        assert_eq!(edited[0].sender.as_ref().unwrap().id, "u1");
        assert_eq!(edited[0].edited_by.as_ref().unwrap().username.as_deref(), Some("bob"));
        assert_eq!(edited[0].occurred_at.timestamp(), 1_700_000_060);

        let deleted = classifier
            .classify(&ChangeEntry::delete(key(3), NS, "m1"))
            .await
            .unwrap();
        assert_eq!(deleted[0].event_type, EventType::Deleted);
        assert_eq!(deleted[0].room_id, "R1");
        assert_eq!(deleted[0].text.as_deref(), Some("hello!"));
        assert!(!deleted[0].tombstone);
    }

    #[tokio::test]
    async fn test_metadata_only_update_is_an_edit() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let insert = ChangeEntry::insert(key(1), NS, message("m1", "R1", "hi")).unwrap();
        classifier.classify(&insert).await.unwrap();

        let touch = ChangeEntry::update(
            key(2),
            NS,
            "m1",
            UpdateDelta::Fields {
                set: doc! { "editedAt": bson::DateTime::from_millis(1_700_000_100_000) },
                unset: Vec::new(),
            },
        );
        let events = classifier.classify(&touch).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Edited);
        assert_eq!(events[0].text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_edit_cache_miss_uses_directory() {
        let directory = Arc::new(MemoryDirectory::new());
        directory.put_message(message("m9", "R2", "original"));
        directory.put_room(doc! { "_id": "R2", "t": "d", "usernames": ["alice", "bob"] });
        let classifier =
            Classifier::new(ClassifierConfig::default()).with_directory(directory.clone());

        let events = classifier.classify(&edit(5, "m9", "changed")).await.unwrap();
        assert_eq!(events[0].room_id, "R2");
        assert_eq!(events[0].room_name.as_deref(), Some("alice_x_bob"));
        assert_eq!(events[0].text.as_deref(), Some("changed"));
    }

    #[tokio::test]
    async fn test_directory_outage_is_an_error_not_a_skip() {
        let directory = Arc::new(MemoryDirectory::new());
        directory.set_unavailable(true);
        let classifier =
            Classifier::new(ClassifierConfig::default()).with_directory(directory.clone());

        let result = classifier.classify(&edit(5, "m9", "changed")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_room_name_failure_leaves_name_unset() {
        let directory = Arc::new(MemoryDirectory::new());
        let classifier =
            Classifier::new(ClassifierConfig::default()).with_directory(directory.clone());
        let insert = ChangeEntry::insert(key(1), NS, message("m1", "R1", "hi")).unwrap();
        directory.put_message(message("m1", "R1", "hi"));

        // The insert path only needs the room name; an outage there is not fatal.
        directory.set_unavailable(true);
        let events = classifier.classify(&insert).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].room_name.is_none());
    }

    #[tokio::test]
    async fn test_edit_without_any_snapshot_goes_to_unresolved_room() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let events = classifier.classify(&edit(5, "ghost", "text")).await.unwrap();
        assert_eq!(events[0].room_id, UNRESOLVED_ROOM);
        assert_eq!(events[0].text.as_deref(), Some("text"));
    }

    #[tokio::test]
    async fn test_delete_without_snapshot_is_tombstone() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let events = classifier
            .classify(&ChangeEntry::delete(key(7), NS, "m404"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].tombstone);
        assert_eq!(events[0].room_id, UNRESOLVED_ROOM);
        assert_eq!(events[0].message_id, "m404");
    }

    #[tokio::test]
    async fn test_stored_snapshot_outlives_the_cache() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(StateDb::open(tmp.path()).unwrap());

        let before = Classifier::new(ClassifierConfig::default()).with_state(Arc::clone(&state));
        let insert = ChangeEntry::insert(key(1), NS, message("m1", "R1", "hello")).unwrap();
        before.classify(&insert).await.unwrap();
        before.classify(&edit(2, "m1", "hello again")).await.unwrap();

        // A fresh classifier starts with an empty cache, as after a restart.
        let after = Classifier::new(ClassifierConfig::default()).with_state(Arc::clone(&state));
        let deleted = after
            .classify(&ChangeEntry::delete(key(3), NS, "m1"))
            .await
            .unwrap();
        assert_eq!(deleted[0].room_id, "R1");
        assert_eq!(deleted[0].text.as_deref(), Some("hello again"));
        assert!(!deleted[0].tombstone);

        // Retired by the caller once the deletion is recorded.
        assert!(state.message("m1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_edit_prefers_stored_snapshot_over_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = Arc::new(StateDb::open(tmp.path()).unwrap());
        state.put_message("m1", &message("m1", "R1", "stored")).unwrap();

        let directory = Arc::new(MemoryDirectory::new());
        directory.set_unavailable(true);
        let classifier = Classifier::new(ClassifierConfig::default())
            .with_directory(directory)
            .with_state(Arc::clone(&state));

        let events = classifier.classify(&edit(2, "m1", "edited")).await.unwrap();
        assert_eq!(events[0].room_id, "R1");
        assert_eq!(events[0].text.as_deref(), Some("edited"));
        assert_eq!(
            state.message("m1").unwrap().unwrap().get_str("msg").unwrap(),
            "edited"
        );
    }

    #[tokio::test]
    async fn test_other_namespaces_are_ignored() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let entry = ChangeEntry::insert(
            key(1),
            "rocketchat.rocketchat_room",
            doc! { "_id": "R1", "name": "general" },
        )
        .unwrap();
        assert!(classifier.classify(&entry).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_insert_is_skipped() {
        let classifier = Classifier::new(ClassifierConfig::default());
        let entry = ChangeEntry::insert(key(1), NS, doc! { "_id": "m1", "msg": "no rid" }).unwrap();
        assert!(classifier.classify(&entry).await.unwrap().is_empty());
    }
}
