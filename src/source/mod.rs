//! The MongoDB driver contract required by the core pipeline (§6).
//!
//! As with the sink side, the core never calls the `mongodb` driver
//! directly outside of `mongo.rs`: everything the slurper needs goes through
//! `SourceClient` so `crate::testsupport` can provide an in-memory fake for
//! exercising the full pipeline without a live replica set.

pub mod mongo;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use mongodb::bson::Document;

use crate::error::Result;
use crate::event::GridFsFile;

/// The replication topology discovered from `serverStatus`/`config.shards`,
/// determining how many slurpers the supervisor spawns (§4.3.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    /// A single replica set; one slurper tails it directly.
    ReplicaSet,
    /// A sharded cluster; one slurper per shard, each given that shard's
    /// own connection string.
    Sharded {
        /// One entry per shard, `(shard_name, connection_string)`.
        shards: Vec<(String, String)>,
    },
}

/// The MongoDB operations the core pipeline depends on (§6).
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Discover whether this connection points at a replica set member or a
    /// `mongos` router (§4.3.1).
    async fn topology(&self) -> Result<Topology>;

    /// Open a tailable, await-data cursor over `local.oplog.rs` filtered by
    /// `filter`, sorted in natural (insertion) order (§4.3.2/§4.3.3).
    async fn tail_oplog(&self, filter: Document) -> Result<BoxStream<'static, Result<Document>>>;

    /// Stream every document currently in a collection, used for the
    /// full-collection bootstrap (§4.3.2).
    async fn find_all(&self, namespace: &str) -> Result<BoxStream<'static, Result<Document>>>;

    /// Find every document in a collection matching `filter`, used for
    /// update fan-out re-queries (§4.3.4).
    async fn find(&self, namespace: &str, filter: Document) -> Result<BoxStream<'static, Result<Document>>>;

    /// Fetch a single GridFS file (metadata plus content) by its `_id`.
    async fn gridfs_find_one(&self, bucket_namespace: &str, id: &mongodb::bson::Bson) -> Result<Option<GridFsFile>>;

    /// Authenticate against a database, falling back from admin credentials
    /// to a local credential per §4.3.5/§7 kind 4/5.
    async fn authenticate(&self, database: &str, username: &str, password: &str) -> Result<()>;

    /// Read the current maximum timestamp in the oplog, used to stamp the
    /// full-collection bootstrap (§4.3.2).
    async fn max_oplog_timestamp(&self) -> Result<crate::timestamp::OplogTimestamp>;

    /// Connect to one shard's own member set, used when `topology` reports
    /// `Sharded` so the supervisor can give each shard's slurper its own
    /// connection (§4.3.1).
    async fn connect_shard(&self, connection_string: &str) -> Result<Arc<dyn SourceClient>>;
}
