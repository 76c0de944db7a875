//! Message documents: field extraction and delta application.

use crate::source::{UpdateDelta, id_string};
use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use rcaudit_core::{AttachmentRef, Error, Result, Sender};
use tracing::warn;

/// Array positions past this are not materialized from an update path.
const MAX_ARRAY_INDEX: usize = 4096;

/// The audit-relevant fields of a Rocket.Chat message document.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFields {
    pub room_id: String,
    pub sender: Option<Sender>,
    pub text: Option<String>,
    pub kind: Option<String>,
    pub attachments: Vec<AttachmentRef>,
    pub sent_at: Option<DateTime<Utc>>,
    pub edited_by: Option<Sender>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl MessageFields {
    pub fn parse(doc: &Document) -> Result<Self> {
        let room_id = match doc.get("rid") {
            Some(Bson::String(rid)) if !rid.is_empty() => rid.clone(),
            Some(_) => return Err(Error::invalid("rid", "not a non-empty string")),
            None => return Err(Error::invalid("rid", "missing")),
        };

        Ok(Self {
            room_id,
            sender: user(doc, "u")?,
            text: optional_str(doc, "msg")?,
            kind: optional_str(doc, "t")?,
            attachments: attachments(doc)?,
            sent_at: optional_date(doc, "ts")?,
            edited_by: user(doc, "editedBy")?,
            edited_at: optional_date(doc, "editedAt")?,
        })
    }
}

fn optional_str(doc: &Document, field: &'static str) -> Result<Option<String>> {
    match doc.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::invalid(
            field,
            format!("expected string, found {:?}", other.element_type()),
        )),
    }
}

fn optional_date(doc: &Document, field: &'static str) -> Result<Option<DateTime<Utc>>> {
    match doc.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::DateTime(dt)) => Ok(DateTime::from_timestamp_millis(dt.timestamp_millis())),
        Some(other) => Err(Error::invalid(
            field,
            format!("expected date, found {:?}", other.element_type()),
        )),
    }
}

fn user(doc: &Document, field: &'static str) -> Result<Option<Sender>> {
    match doc.get(field) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Document(u)) => Ok(Some(Sender {
            id: id_string(u.get("_id"), field)?,
            username: optional_str(u, "username")?,
        })),
        Some(_) => Err(Error::invalid(field, "not a document")),
    }
}

/// Uploads referenced by the message.
///
/// File ids come from `files[]` (or the single `file` of older versions);
/// names and content types fall back to the matching `attachments[]` entry.
fn attachments(doc: &Document) -> Result<Vec<AttachmentRef>> {
    let mut files: Vec<&Document> = Vec::new();
    match doc.get("files") {
        Some(Bson::Array(items)) => files.extend(items.iter().filter_map(Bson::as_document)),
        Some(Bson::Null) | None => {}
        Some(_) => return Err(Error::invalid("files", "not an array")),
    }
    if files.is_empty() {
        match doc.get("file") {
            Some(Bson::Document(file)) => files.push(file),
            Some(Bson::Null) | None => {}
            Some(_) => return Err(Error::invalid("file", "not a document")),
        }
    }

    let described: Vec<&Document> = match doc.get("attachments") {
        Some(Bson::Array(items)) => items.iter().filter_map(Bson::as_document).collect(),
        _ => Vec::new(),
    };

    let mut refs: Vec<AttachmentRef> = Vec::with_capacity(files.len());
    for (i, file) in files.iter().enumerate() {
        let file_id = id_string(file.get("_id"), "file._id")?;
        if refs.iter().any(|r| r.file_id == file_id) {
            continue;
        }
        let described = described.get(i);
        let name = file
            .get_str("name")
            .ok()
            .or_else(|| described.and_then(|a| a.get_str("title").ok()))
            .map(str::to_string);
        let content_type = file
            .get_str("type")
            .ok()
            .or_else(|| {
                described.and_then(|a| {
                    ["image_type", "audio_type", "video_type"]
                        .iter()
                        .find_map(|key| a.get_str(key).ok())
                })
            })
            .map(str::to_string);

        refs.push(AttachmentRef {
            file_id,
            name,
            content_type,
        });
    }

    Ok(refs)
}

/// Apply an update delta to a snapshot in place.
pub fn apply_delta(snapshot: &mut Document, delta: &UpdateDelta) {
    match delta {
        UpdateDelta::Replacement(doc) => *snapshot = doc.clone(),
        UpdateDelta::Fields { set, unset } => {
            for (path, value) in set {
                set_path(snapshot, path, value.clone());
            }
            for path in unset {
                unset_path(snapshot, path);
            }
        }
    }
}

/// Set a possibly dotted path (`attachments.0.title`), creating documents
/// along the way.
fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            set_in(child, rest, value);
        }
    }
}

fn set_in(node: &mut Bson, path: &str, value: Bson) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    match node {
        Bson::Document(doc) => match rest {
            None => {
                doc.insert(head, value);
            }
            Some(rest) => set_path(doc, &format!("{head}.{rest}"), value),
        },
        Bson::Array(items) => {
            let Ok(idx) = head.parse::<usize>() else {
                return;
            };
            if idx > MAX_ARRAY_INDEX {
                warn!(index = idx, limit = MAX_ARRAY_INDEX, "Ignoring update to out-of-range array index");
                return;
            }
            if idx >= items.len() {
                items.resize(idx + 1, Bson::Null);
            }
            match rest {
                None => items[idx] = value,
                Some(rest) => {
                    if !matches!(items[idx], Bson::Document(_) | Bson::Array(_)) {
                        items[idx] = Bson::Document(Document::new());
                    }
                    set_in(&mut items[idx], rest, value);
                }
            }
        }
        other => {
            let mut doc = Document::new();
            set_path(&mut doc, path, value);
            *other = Bson::Document(doc);
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Bson::Document(child)) => unset_path(child, rest),
            Some(Bson::Array(items)) => {
                let (idx, tail) = match rest.split_once('.') {
                    Some((idx, tail)) => (idx, Some(tail)),
                    None => (rest, None),
                };
                let Some(item) = idx.parse::<usize>().ok().and_then(|i| items.get_mut(i)) else {
                    return;
                };
                match (tail, item) {
                    // $unset on an array element nulls it rather than removing it.
                    (None, item) => *item = Bson::Null,
                    (Some(tail), Bson::Document(child)) => unset_path(child, tail),
                    _ => {}
                }
            }
            _ => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_parse_full_message() {
        let doc = doc! {
            "_id": "m1",
            "rid": "GENERAL",
            "msg": "see attached",
            "ts": bson::DateTime::from_millis(1_700_000_000_000),
            "u": { "_id": "u1", "username": "alice" },
            "file": { "_id": "f1", "name": "report.pdf", "type": "application/pdf" },
            "attachments": [ { "title": "report.pdf" } ],
        };
        let fields = MessageFields::parse(&doc).unwrap();
        assert_eq!(fields.room_id, "GENERAL");
        assert_eq!(fields.sender.unwrap().username.as_deref(), Some("alice"));
        assert_eq!(fields.attachments.len(), 1);
        assert_eq!(fields.attachments[0].file_id, "f1");
        assert_eq!(fields.attachments[0].content_type.as_deref(), Some("application/pdf"));
        assert_eq!(fields.sent_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_attachment_metadata_falls_back_to_attachments() {
        let doc = doc! {
            "rid": "r",
            "file": { "_id": "f1" },
            "attachments": [ { "title": "cat.png", "image_type": "image/png" } ],
        };
        let fields = MessageFields::parse(&doc).unwrap();
        assert_eq!(fields.attachments[0].name.as_deref(), Some("cat.png"));
        assert_eq!(fields.attachments[0].content_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_files_array_is_deduplicated() {
        let doc = doc! {
            "rid": "r",
            "files": [ { "_id": "f1" }, { "_id": "f2" }, { "_id": "f1" } ],
            "file": { "_id": "f1" },
        };
        let ids: Vec<_> = MessageFields::parse(&doc)
            .unwrap()
            .attachments
            .into_iter()
            .map(|a| a.file_id)
            .collect();
        assert_eq!(ids, vec!["f1", "f2"]);
    }

    #[test]
    fn test_malformed_fields_are_rejected() {
        assert!(MessageFields::parse(&doc! { "msg": "no room" }).is_err());
        assert!(MessageFields::parse(&doc! { "rid": "r", "msg": 5 }).is_err());
        assert!(MessageFields::parse(&doc! { "rid": "r", "u": "alice" }).is_err());
    }

    #[test]
    fn test_apply_field_delta() {
        let mut snapshot = doc! {
            "rid": "r",
            "msg": "old",
            "pinned": true,
            "attachments": [ { "title": "a" } ],
        };
        let delta = UpdateDelta::Fields {
            set: doc! {
                "msg": "new",
                "editedBy.username": "bob",
                "attachments.0.title": "b",
            },
            unset: vec!["pinned".to_string()],
        };
        apply_delta(&mut snapshot, &delta);

        assert_eq!(snapshot.get_str("msg").unwrap(), "new");
        assert!(!snapshot.contains_key("pinned"));
        assert_eq!(
            snapshot.get_document("editedBy").unwrap().get_str("username").unwrap(),
            "bob"
        );
        let first = snapshot.get_array("attachments").unwrap()[0].as_document().unwrap();
        assert_eq!(first.get_str("title").unwrap(), "b");
    }

    #[test]
    fn test_out_of_range_array_index_is_ignored() {
        let mut snapshot = doc! { "rid": "r", "attachments": [ { "title": "a" } ] };
        let delta = UpdateDelta::Fields {
            set: doc! {
                "attachments.4000000000.title": "huge",
                "attachments.2.title": "padded",
            },
            unset: Vec::new(),
        };
        apply_delta(&mut snapshot, &delta);

        let items = snapshot.get_array("attachments").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], Bson::Null);
        assert_eq!(
            items[2].as_document().unwrap().get_str("title").unwrap(),
            "padded"
        );
    }

    #[test]
    fn test_apply_replacement() {
        let mut snapshot = doc! { "rid": "r", "msg": "old", "pinned": true };
        apply_delta(
            &mut snapshot,
            &UpdateDelta::Replacement(doc! { "rid": "r", "msg": "replaced" }),
        );
        assert_eq!(snapshot, doc! { "rid": "r", "msg": "replaced" });
    }
}
