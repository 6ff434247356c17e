//! The Elasticsearch client contract required by the core pipeline (§6).
//!
//! The core never talks to an HTTP client directly: everything it needs from
//! the sink goes through the `SinkClient` trait so that tests can swap in an
//! in-memory fake (see `crate::testsupport`) and so the real implementation
//! (`elasticsearch::HttpSinkClient`) stays an interchangeable adapter.

pub mod elasticsearch;

use async_trait::async_trait;
use mongodb::bson::Document;
use serde_json::Value;

use crate::error::Result;

/// One action within a bulk request: either replace (index) a document or
/// remove it.
#[derive(Clone, Debug, PartialEq)]
pub enum BulkAction {
    /// Create or fully replace a document.
    Index {
        /// Target index name (may differ from the river's default, via a
        /// script override).
        index: String,
        /// Target document type.
        doc_type: String,
        /// Document id, if known (absent lets the sink assign one — not
        /// used by this pipeline, which always addresses by `_id`, but
        /// modeled for completeness).
        id: Option<String>,
        /// Parent document id, for parent/child mappings.
        parent: Option<String>,
        /// Custom shard routing key.
        routing: Option<String>,
        /// The document body to index.
        body: Document,
    },
    /// Remove a document.
    Delete {
        /// Target index name.
        index: String,
        /// Target document type.
        doc_type: String,
        /// Document id to remove.
        id: String,
        /// Parent document id, for parent/child mappings.
        parent: Option<String>,
        /// Custom shard routing key.
        routing: Option<String>,
    },
}

impl BulkAction {
    /// The document id this action addresses, for error reporting.
    pub fn id(&self) -> Option<&str> {
        match self {
            BulkAction::Index { id, .. } => id.as_deref(),
            BulkAction::Delete { id, .. } => Some(id.as_str()),
        }
    }
}

/// The outcome of one item within a submitted bulk request.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkItemResult {
    /// Document id the item addressed, if known.
    pub id: Option<String>,
    /// `None` on success; `Some(reason)` when the sink rejected this item
    /// specifically (the rest of the bulk may still have succeeded).
    pub error: Option<String>,
}

/// The response to a submitted bulk request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BulkResponse {
    /// Per-item outcomes, in the same order the actions were submitted.
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    /// Items that failed, for logging and stats.
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|item| item.error.is_some())
    }

    /// Count of items that succeeded.
    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|item| item.error.is_none()).count()
    }
}

/// A mapping definition as returned by `get_mapping` / accepted by
/// `put_mapping`, left as an opaque JSON value since its shape is entirely
/// up to the Elasticsearch version and the user's customizations.
pub type MappingDefinition = Value;

/// The Elasticsearch operations the core pipeline depends on (§6).
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Create an index if it doesn't already exist. Implementations must
    /// tolerate an "already exists" response as success.
    async fn create_index(&self, index: &str) -> Result<()>;

    /// Install (or overwrite) a type mapping.
    async fn put_mapping(&self, index: &str, doc_type: &str, mapping: &MappingDefinition) -> Result<()>;

    /// Remove a type mapping.
    async fn delete_mapping(&self, index: &str, doc_type: &str) -> Result<()>;

    /// Force a refresh of an index so subsequent reads see just-written
    /// documents.
    async fn refresh_index(&self, index: &str) -> Result<()>;

    /// Fetch the current mapping definition for a type, used to preserve
    /// customizations across a drop-collection mapping reinstall.
    async fn get_mapping(&self, index: &str, doc_type: &str) -> Result<Option<MappingDefinition>>;

    /// Fetch a single document by id (used for checkpoint and enable-flag
    /// reads).
    async fn get_document(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Document>>;

    /// Submit a batch of index/delete actions as one bulk request.
    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<BulkResponse>;
}
