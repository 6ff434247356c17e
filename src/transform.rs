//! The user transformation script boundary (§4.4/§9): modeled as a trait so
//! the core never depends on a particular scripting runtime, with a no-op
//! implementation for rivers that don't configure one.

use async_trait::async_trait;
use mongodb::bson::Document;

use crate::error::Result;

/// The context passed to a transformation script and read back afterwards.
/// Mirrors the control-directive surface of §6: `ignore`/`deleted` plus
/// index/type/parent/routing/id overrides.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptContext {
    /// The document being indexed or deleted.
    pub document: Document,
    /// The operation name (`"insert"`, `"update"`, `"delete"`, `"command"`).
    pub operation: String,
    /// The document's `_id`, if any.
    pub id: Option<String>,
    /// When set by the script, the event is dropped entirely (the
    /// checkpoint still advances — see DESIGN.md open question (a)).
    pub ignore: bool,
    /// When set by the script, the operation is overridden to a delete
    /// regardless of what the oplog said.
    pub deleted: bool,
    /// Override the target index for this event only.
    pub index_override: Option<String>,
    /// Override the target type for this event only.
    pub type_override: Option<String>,
    /// Override the parent id for this event only.
    pub parent_override: Option<String>,
    /// Override the shard routing key for this event only.
    pub routing_override: Option<String>,
}

impl ScriptContext {
    /// Build the initial context for an event before a script runs.
    pub fn new(document: Document, operation: impl Into<String>, id: Option<String>) -> Self {
        ScriptContext {
            document,
            operation: operation.into(),
            id,
            ignore: false,
            deleted: false,
            index_override: None,
            type_override: None,
            parent_override: None,
            routing_override: None,
        }
    }
}

/// A user-supplied transformation applied to each event before it is
/// translated into a bulk action.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Run the transformation, returning the (possibly modified) context.
    /// A script evaluation error (§7 kind 10) should be logged by the
    /// caller and the original context kept, not propagated as a fatal
    /// error: implementations that can fail return `Err` and the indexer
    /// handles the fallback.
    async fn apply(&self, context: ScriptContext) -> Result<ScriptContext>;
}

/// The transformer used when a river configures no script: passes the
/// context through unchanged.
pub struct NoopTransformer;

#[async_trait]
impl Transformer for NoopTransformer {
    async fn apply(&self, context: ScriptContext) -> Result<ScriptContext> {
        Ok(context)
    }
}
