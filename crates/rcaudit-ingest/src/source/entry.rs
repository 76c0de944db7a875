//! Oplog documents decoded into typed change entries.
//!
//! Oplog entries are loosely shaped BSON. Decoding validates the envelope
//! (`ts`, `op`, `ns`, `o`, `o2`) and turns the operation-specific part into a
//! [`Payload`] variant; the message fields inside are left to the classifier.

use bson::{Bson, Document, Timestamp};
use rcaudit_core::{Error, Result, SequenceKey};

/// Kind of write recorded in the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// Changes carried by an update entry.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDelta {
    /// Field-level changes (`$set`/`$unset`, or the `$v: 2` diff format).
    Fields { set: Document, unset: Vec<String> },
    /// The whole document was replaced.
    Replacement(Document),
}

/// Operation-specific content of a change entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Insert(Document),
    Update(UpdateDelta),
    Delete,
}

/// One insert, update or delete read from the oplog.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub key: SequenceKey,
    pub namespace: String,
    pub document_id: String,
    pub payload: Payload,
}

impl ChangeEntry {
    /// An insert of `doc`, whose `_id` becomes the document id.
    pub fn insert(key: SequenceKey, namespace: &str, doc: Document) -> Result<Self> {
        let document_id = id_string(doc.get("_id"), "o._id")?;
        Ok(Self {
            key,
            namespace: namespace.to_string(),
            document_id,
            payload: Payload::Insert(doc),
        })
    }

    pub fn update(key: SequenceKey, namespace: &str, document_id: &str, delta: UpdateDelta) -> Self {
        Self {
            key,
            namespace: namespace.to_string(),
            document_id: document_id.to_string(),
            payload: Payload::Update(delta),
        }
    }

    pub fn delete(key: SequenceKey, namespace: &str, document_id: &str) -> Self {
        Self {
            key,
            namespace: namespace.to_string(),
            document_id: document_id.to_string(),
            payload: Payload::Delete,
        }
    }

    pub fn operation(&self) -> OperationKind {
        match self.payload {
            Payload::Insert(_) => OperationKind::Insert,
            Payload::Update(_) => OperationKind::Update,
            Payload::Delete => OperationKind::Delete,
        }
    }
}

/// Result of decoding one oplog document.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Change(ChangeEntry),
    /// A no-op, command or other entry that carries no document change.
    Other(SequenceKey),
}

pub fn key_from_timestamp(ts: Timestamp) -> SequenceKey {
    SequenceKey::new(ts.time, ts.increment)
}

pub fn timestamp_from_key(key: SequenceKey) -> Timestamp {
    Timestamp {
        time: key.time,
        increment: key.ordinal,
    }
}

/// Decode a raw oplog document.
pub fn decode_oplog(doc: &Document) -> Result<Decoded> {
    let ts = doc
        .get_timestamp("ts")
        .map_err(|e| Error::invalid("ts", e.to_string()))?;
    let key = key_from_timestamp(ts);

    let op = doc
        .get_str("op")
        .map_err(|e| Error::invalid("op", e.to_string()))?;
    if !matches!(op, "i" | "u" | "d") {
        return Ok(Decoded::Other(key));
    }

    let ns = doc
        .get_str("ns")
        .map_err(|e| Error::invalid("ns", e.to_string()))?;
    let o = doc
        .get_document("o")
        .map_err(|e| Error::invalid("o", e.to_string()))?;

    let entry = match op {
        "i" => ChangeEntry::insert(key, ns, o.clone())?,
        "u" => {
            let o2 = doc
                .get_document("o2")
                .map_err(|e| Error::invalid("o2", e.to_string()))?;
            let id = id_string(o2.get("_id"), "o2._id")?;
            ChangeEntry::update(key, ns, &id, decode_update(o)?)
        }
        _ => {
            let id = id_string(o.get("_id"), "o._id")?;
            ChangeEntry::delete(key, ns, &id)
        }
    };

    Ok(Decoded::Change(entry))
}

/// Interpret the `o` field of an update entry.
pub fn decode_update(o: &Document) -> Result<UpdateDelta> {
    if let Ok(diff) = o.get_document("diff") {
        // `$v: 2` format: `u` updated, `i` inserted, `d` deleted fields.
        // `s<field>` sub-diffs of nested documents are not interpreted.
        let mut set = Document::new();
        for section in ["u", "i"] {
            if let Some(fields) = diff.get(section) {
                let fields = fields
                    .as_document()
                    .ok_or_else(|| Error::invalid("o.diff", format!("'{section}' is not a document")))?;
                set.extend(fields.clone());
            }
        }
        let unset = match diff.get("d") {
            Some(Bson::Document(d)) => d.keys().cloned().collect(),
            Some(_) => return Err(Error::invalid("o.diff", "'d' is not a document")),
            None => Vec::new(),
        };
        return Ok(UpdateDelta::Fields { set, unset });
    }

    if o.keys().any(|k| k.starts_with('$')) {
        let set = match o.get("$set") {
            Some(Bson::Document(d)) => d.clone(),
            Some(_) => return Err(Error::invalid("o.$set", "not a document")),
            None => Document::new(),
        };
        let unset = match o.get("$unset") {
            Some(Bson::Document(d)) => d.keys().cloned().collect(),
            Some(_) => return Err(Error::invalid("o.$unset", "not a document")),
            None => Vec::new(),
        };
        return Ok(UpdateDelta::Fields { set, unset });
    }

    Ok(UpdateDelta::Replacement(o.clone()))
}

/// Render a document id as a string (Rocket.Chat uses string ids, but
/// ObjectIds show up in uploads and older data).
pub fn id_string(value: Option<&Bson>, field: &'static str) -> Result<String> {
    match value {
        Some(Bson::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Bson::ObjectId(oid)) => Ok(oid.to_hex()),
        Some(other) => Err(Error::invalid(field, format!("unexpected id type {:?}", other.element_type()))),
        None => Err(Error::invalid(field, "missing")),
    }
}
