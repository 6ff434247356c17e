//! Converts raw oplog entries into the pipeline's own tagged-variant change
//! event, replacing the source system's untyped map with something the rest
//! of the crate can match on exhaustively.

use mongodb::bson::{self, Bson, Document};

use crate::error::{Result, RiverError};
use crate::timestamp::OplogTimestamp;

/// The operation a `ChangeEvent` represents, independent of how it was
/// produced (a direct oplog entry, a synthetic bootstrap insert, or an
/// update fan-out re-query).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    /// A new document (or, for GridFS, a new file) was created.
    Insert,
    /// An existing document was modified. Carries the *current* state of the
    /// document, not the mutation itself (see update fan-out).
    Update,
    /// A document was removed.
    Delete,
    /// A namespace-level command (only `drop` is acted upon downstream).
    Command,
}

/// Metadata and content of a GridFS file, as fetched from the `.files`
/// collection plus its chunk data.
#[derive(Clone, Debug, PartialEq)]
pub struct GridFsFile {
    /// The file's `_id` in the `.files` collection, stringified.
    pub id: String,
    /// Original upload filename.
    pub filename: String,
    /// MIME content type, if recorded.
    pub content_type: Option<String>,
    /// MD5 digest of the file's content.
    pub md5: String,
    /// Total length of the file in bytes.
    pub length: i64,
    /// Chunk size used when the file was uploaded.
    pub chunk_size: i64,
    /// The file's full content, reassembled from its chunks.
    pub content: Vec<u8>,
}

/// A single change produced by the slurper and consumed by the indexer.
///
/// Every variant carries a `ts` so the indexer can always compute a batch's
/// maximum timestamp for the checkpoint write, regardless of payload shape.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    /// An ordinary document change (insert, update or delete).
    Document {
        /// Document identity, absent only for command events (which use
        /// the `Command` variant instead, so this is actually always
        /// `Some` for this variant, but kept as `Option` to share the
        /// "no id, can't address it, drop" check with `Command`).
        id: Option<String>,
        /// Oplog timestamp this event was produced at.
        ts: OplogTimestamp,
        /// What kind of change this is.
        op: ChangeOp,
        /// The document body (for insert/update, its current state; for
        /// delete, typically just `{_id: ...}`).
        body: Document,
    },
    /// A GridFS file change.
    Attachment {
        /// The file's `_id`, stringified.
        id: String,
        /// Oplog timestamp this event was produced at.
        ts: OplogTimestamp,
        /// Always `Insert` or `Update`; GridFS files are never deleted via
        /// this pipeline's tracked operations.
        op: ChangeOp,
        /// The attachment's metadata and content.
        file: GridFsFile,
    },
    /// A namespace-level command, used only to observe collection drops.
    Command {
        /// Oplog timestamp this event was produced at.
        ts: OplogTimestamp,
        /// The raw command document (e.g. `{drop: "mongoCollection"}`).
        command: Document,
    },
}

impl ChangeOp {
    /// The operation name passed into a transformation script's context
    /// (`"insert"`, `"update"`, `"delete"`, `"command"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
            ChangeOp::Command => "command",
        }
    }
}

impl ChangeEvent {
    /// The timestamp every variant carries, used to compute a batch's
    /// maximum timestamp for the checkpoint write.
    pub fn ts(&self) -> OplogTimestamp {
        match self {
            ChangeEvent::Document { ts, .. } => *ts,
            ChangeEvent::Attachment { ts, .. } => *ts,
            ChangeEvent::Command { ts, .. } => *ts,
        }
    }

    /// The document identity this event addresses, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            ChangeEvent::Document { id, .. } => id.as_deref(),
            ChangeEvent::Attachment { id, .. } => Some(id.as_str()),
            ChangeEvent::Command { .. } => None,
        }
    }
}

/// Extract a document's `_id` as a string, accepting any BSON type that can
/// be rendered that way (`ObjectId`, string, integer, ...).
pub fn extract_id(doc: &Document) -> Option<String> {
    doc.get("_id").map(bson_to_id_string)
}

fn bson_to_id_string(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

/// Remove a set of top-level fields from a document in place, used to honor
/// a river's configured exclude-field list before an event is emitted.
pub fn exclude_fields(doc: &mut Document, excluded: &[String]) {
    for field in excluded {
        doc.remove(field);
    }
}

/// Build a `ChangeEvent::Document` for a plain insert/update/delete oplog
/// entry whose body is already the document to emit (as opposed to an
/// update mutation, which must be fanned out by the caller instead).
pub fn document_event(
    id: Option<String>,
    ts: OplogTimestamp,
    op: ChangeOp,
    mut body: Document,
    excluded: &[String],
) -> ChangeEvent {
    exclude_fields(&mut body, excluded);
    ChangeEvent::Document { id, ts, op, body }
}

/// Build a `ChangeEvent::Command` from a raw oplog command payload.
pub fn command_event(ts: OplogTimestamp, command: Document) -> ChangeEvent {
    ChangeEvent::Command { ts, command }
}

/// Build a `ChangeEvent::Attachment` from a fetched GridFS file.
pub fn attachment_event(ts: OplogTimestamp, op: ChangeOp, file: GridFsFile) -> ChangeEvent {
    ChangeEvent::Attachment {
        id: file.id.clone(),
        ts,
        op,
        file,
    }
}

/// Extract the `op` discriminant (`"i"`, `"u"`, `"d"`, `"c"`) from a raw
/// oplog entry.
pub fn op_code(entry: &Document) -> Result<&str> {
    entry
        .get_str("op")
        .map_err(|_| RiverError::MissingField("op".into()))
}

/// Extract the `ns` (namespace) field from a raw oplog entry.
pub fn namespace(entry: &Document) -> Result<&str> {
    entry
        .get_str("ns")
        .map_err(|_| RiverError::MissingField("ns".into()))
}

/// Extract the oplog `ts` field from a raw oplog entry.
pub fn entry_ts(entry: &Document) -> Result<OplogTimestamp> {
    entry
        .get_timestamp("ts")
        .map(OplogTimestamp::from_bson)
        .map_err(|_| RiverError::MissingField("ts".into()))
}

/// Whether this oplog entry should be skipped because it was written as a
/// side effect of the shard balancer migrating a chunk.
pub fn is_from_migrate(entry: &Document) -> bool {
    entry.get_bool("fromMigrate").unwrap_or(false)
}

/// Whether a namespace is the `.chunks` half of a GridFS bucket (its events
/// carry no independent meaning; the `.files` sentinel does).
pub fn is_gridfs_chunks_namespace(ns: &str) -> bool {
    ns.ends_with(".chunks")
}

/// Whether a namespace is the `.files` half of a GridFS bucket.
pub fn is_gridfs_files_namespace(ns: &str) -> bool {
    ns.ends_with(".files")
}

/// Extract the `_id` of the document an entry concerns, preferring `o` and
/// falling back to `o2` (present on updates).
pub fn extract_entry_id(entry: &Document) -> Option<String> {
    entry
        .get_document("o")
        .ok()
        .and_then(extract_id)
        .or_else(|| entry.get_document("o2").ok().and_then(extract_id))
}

/// Serialize a GridFS file into the attachment envelope document the
/// indexer writes into the sink (`content` base64, plus metadata fields).
pub fn attachment_envelope(file: &GridFsFile) -> Document {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    bson::doc! {
        "content": STANDARD.encode(&file.content),
        "filename": file.filename.clone(),
        "contentType": file.content_type.clone(),
        "md5": file.md5.clone(),
        "length": file.length,
        "chunkSize": file.chunk_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn extracts_string_and_object_id_ids() {
        let doc = doc! { "_id": "abc" };
        assert_eq!(extract_id(&doc), Some("abc".to_string()));

        let oid = bson::oid::ObjectId::new();
        let doc = doc! { "_id": oid };
        assert_eq!(extract_id(&doc), Some(oid.to_hex()));
    }

    #[test]
    fn excludes_configured_fields() {
        let mut doc = doc! { "_id": "a", "secret": 1, "keep": 2 };
        exclude_fields(&mut doc, &["secret".to_string()]);

        assert_eq!(doc, doc! { "_id": "a", "keep": 2 });
    }

    #[test]
    fn change_event_ts_and_id_are_consistent_across_variants() {
        let ts = OplogTimestamp::new(1, 2);

        let doc_event = document_event(
            Some("a".into()),
            ts,
            ChangeOp::Insert,
            doc! { "_id": "a" },
            &[],
        );
        assert_eq!(doc_event.ts(), ts);
        assert_eq!(doc_event.id(), Some("a"));

        let cmd_event = command_event(ts, doc! { "drop": "foo" });
        assert_eq!(cmd_event.ts(), ts);
        assert_eq!(cmd_event.id(), None);
    }

    #[test]
    fn attachment_envelope_base64_encodes_content() {
        let file = GridFsFile {
            id: "f1".into(),
            filename: "hello.txt".into(),
            content_type: Some("text/plain".into()),
            md5: "5d41402abc4b2a76b9719d911017c592".into(),
            length: 5,
            chunk_size: 261_120,
            content: b"hello".to_vec(),
        };

        let envelope = attachment_envelope(&file);

        assert_eq!(envelope.get_str("filename").unwrap(), "hello.txt");
        assert_eq!(envelope.get_i64("length").unwrap(), 5);
        assert_eq!(envelope.get_str("content").unwrap(), "aGVsbG8=");
    }

    #[test]
    fn detects_gridfs_namespaces() {
        assert!(is_gridfs_chunks_namespace("db.fs.chunks"));
        assert!(is_gridfs_files_namespace("db.fs.files"));
        assert!(!is_gridfs_chunks_namespace("db.fs.files"));
    }

    #[test]
    fn entry_id_falls_back_to_o2() {
        let entry = doc! {
            "op": "u",
            "o2": { "_id": "x" },
            "o": { "$set": { "color": "blue" } },
        };

        assert_eq!(extract_entry_id(&entry), Some("x".to_string()));
    }
}
