//! Lookups into the live chat database.
//!
//! The oplog carries only deltas for updates and nothing but the id for
//! deletes, so the classifier falls back to the current message document
//! when its own snapshot cache misses. Room display names are resolved here
//! as well.

use crate::{Error, Result};
use async_trait::async_trait;
use bson::{Bson, Document, doc};
use mongodb::{Client, Collection};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read-only access to message and room documents.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Current document of a message, if it still exists.
    async fn message(&self, message_id: &str) -> Result<Option<Document>>;

    /// Display name of a room, if the room exists and has one.
    async fn room_name(&self, room_id: &str) -> Result<Option<String>>;
}

/// [`Directory`] backed by the Rocket.Chat database.
pub struct MongoDirectory {
    messages: Collection<Document>,
    rooms: Collection<Document>,
}

impl MongoDirectory {
    pub fn new(client: &Client, database: &str, message_collection: &str) -> Self {
        let db = client.database(database);
        Self {
            messages: db.collection(message_collection),
            rooms: db.collection("rocketchat_room"),
        }
    }
}

#[async_trait]
impl Directory for MongoDirectory {
    async fn message(&self, message_id: &str) -> Result<Option<Document>> {
        Ok(self.messages.find_one(doc! { "_id": message_id }).await?)
    }

    async fn room_name(&self, room_id: &str) -> Result<Option<String>> {
        let room = self
            .rooms
            .find_one(doc! { "_id": room_id })
            .projection(doc! { "name": 1, "t": 1, "usernames": 1 })
            .await?;
        Ok(room.as_ref().and_then(room_display_name))
    }
}

/// Name shown for a room: its `name`, or for direct messages (`t: "d"`) the
/// participants' usernames joined by `_x_`.
pub fn room_display_name(room: &Document) -> Option<String> {
    if room.get_str("t").ok() == Some("d") {
        let usernames: Vec<&str> = room
            .get_array("usernames")
            .ok()?
            .iter()
            .filter_map(Bson::as_str)
            .collect();
        if !usernames.is_empty() {
            return Some(usernames.join("_x_"));
        }
    }
    room.get_str("name").ok().map(str::to_string)
}

/// In-memory [`Directory`] for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    messages: RwLock<HashMap<String, Document>>,
    rooms: RwLock<HashMap<String, Document>>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a message document under its `_id`.
    pub fn put_message(&self, message: Document) {
        if let Ok(id) = message.get_str("_id").map(str::to_string) {
            self.messages.write().insert(id, message);
        }
    }

    /// Store a room document under its `_id`.
    pub fn put_room(&self, room: Document) {
        if let Ok(id) = room.get_str("_id").map(str::to_string) {
            self.rooms.write().insert(id, room);
        }
    }

    /// Make every lookup fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "directory unavailable",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn message(&self, message_id: &str) -> Result<Option<Document>> {
        self.check()?;
        Ok(self.messages.read().get(message_id).cloned())
    }

    async fn room_name(&self, room_id: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.rooms.read().get(room_id).and_then(room_display_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_uses_name() {
        let room = doc! { "_id": "GENERAL", "t": "c", "name": "general" };
        assert_eq!(room_display_name(&room).as_deref(), Some("general"));
    }

    #[test]
    fn test_direct_message_joins_usernames() {
        let room = doc! { "_id": "ab", "t": "d", "usernames": ["alice", "bob"] };
        assert_eq!(room_display_name(&room).as_deref(), Some("alice_x_bob"));
    }

    #[test]
    fn test_nameless_room() {
        assert_eq!(room_display_name(&doc! { "_id": "x", "t": "p" }), None);
    }

    #[tokio::test]
    async fn test_memory_directory_lookups() {
        let dir = MemoryDirectory::new();
        dir.put_message(doc! { "_id": "m1", "rid": "r1", "msg": "hi" });
        dir.put_room(doc! { "_id": "r1", "t": "c", "name": "random" });

        assert!(dir.message("m1").await.unwrap().is_some());
        assert!(dir.message("m2").await.unwrap().is_none());
        assert_eq!(dir.room_name("r1").await.unwrap().as_deref(), Some("random"));

        dir.set_unavailable(true);
        assert!(dir.room_name("r1").await.is_err());
    }
}
