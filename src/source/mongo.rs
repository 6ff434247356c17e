//! A `SourceClient` implementation wrapping the real `mongodb` driver:
//! tailable cursors over `local.oplog.rs` generalized to arbitrary
//! namespaces, plus topology discovery and GridFS reads.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use mongodb::bson::{doc, Bson, Document};
use mongodb::gridfs::GridFsBucket;
use mongodb::options::{ClientOptions, CursorType, FindOptions};
use mongodb::Client;

use crate::error::{Result, RiverError};
use crate::event::GridFsFile;
use crate::source::{SourceClient, Topology};
use crate::timestamp::OplogTimestamp;

/// A `SourceClient` backed by a real MongoDB connection.
pub struct MongoSourceClient {
    client: Client,
}

impl MongoSourceClient {
    /// Connect using a MongoDB connection string, applying the pipeline's
    /// standard connect/socket timeouts (§5).
    pub async fn connect(uri: &str) -> Result<Self> {
        let mut opts = ClientOptions::parse(uri).await?;
        opts.connect_timeout = Some(std::time::Duration::from_secs(15));
        opts.socket_timeout = Some(std::time::Duration::from_secs(60));

        Ok(MongoSourceClient {
            client: Client::with_options(opts)?,
        })
    }

    /// Wrap an already-constructed client (used when a caller needs to
    /// share one `Client` across several source-side concerns).
    pub fn from_client(client: Client) -> Self {
        MongoSourceClient { client }
    }

    fn split_namespace(namespace: &str) -> Result<(&str, &str)> {
        namespace
            .split_once('.')
            .ok_or_else(|| RiverError::Configuration(format!("invalid namespace: {}", namespace)))
    }

    fn collection(&self, namespace: &str) -> Result<mongodb::Collection<Document>> {
        let (db, coll) = Self::split_namespace(namespace)?;
        Ok(self.client.database(db).collection(coll))
    }

    fn gridfs_bucket(&self, bucket_namespace: &str) -> Result<GridFsBucket> {
        let (db, bucket) = Self::split_namespace(bucket_namespace)?;
        let bucket_name = bucket.strip_suffix(".files").unwrap_or(bucket);
        Ok(self
            .client
            .database(db)
            .gridfs_bucket(mongodb::options::GridFsBucketOptions::builder().bucket_name(bucket_name.to_string()).build()))
    }
}

#[async_trait]
impl SourceClient for MongoSourceClient {
    async fn topology(&self) -> Result<Topology> {
        let status = self
            .client
            .database("admin")
            .run_command(doc! { "serverStatus": 1 })
            .await?;

        let process = status.get_str("process").unwrap_or("mongod");

        if !process.contains("mongos") {
            return Ok(Topology::ReplicaSet);
        }

        let config_db = self.client.database("config");
        let mut cursor = config_db.collection::<Document>("shards").find(doc! {}).await?;

        let mut shards = Vec::new();
        while let Some(shard) = cursor.try_next().await? {
            let name = shard
                .get_str("_id")
                .map_err(|_| RiverError::MissingField("shards._id".into()))?
                .to_string();
            let host = shard
                .get_str("host")
                .map_err(|_| RiverError::MissingField("shards.host".into()))?
                .to_string();
            shards.push((name, host));
        }

        Ok(Topology::Sharded { shards })
    }

    async fn tail_oplog(&self, filter: Document) -> Result<BoxStream<'static, Result<Document>>> {
        let coll = self.client.database("local").collection::<Document>("oplog.rs");

        let opts = FindOptions::builder()
            .no_cursor_timeout(true)
            .cursor_type(CursorType::TailableAwait)
            .build();

        let cursor = coll.find(filter).with_options(opts).await.map_err(|e| {
            if e.to_string().contains("ns not found") {
                RiverError::MissingOplog
            } else {
                RiverError::from(e)
            }
        })?;

        Ok(cursor.map_err(RiverError::from).boxed())
    }

    async fn find_all(&self, namespace: &str) -> Result<BoxStream<'static, Result<Document>>> {
        let coll = self.collection(namespace)?;
        let cursor = coll.find(doc! {}).await?;
        Ok(cursor.map_err(RiverError::from).boxed())
    }

    async fn find(&self, namespace: &str, filter: Document) -> Result<BoxStream<'static, Result<Document>>> {
        let coll = self.collection(namespace)?;
        let cursor = coll.find(filter).await?;
        Ok(cursor.map_err(RiverError::from).boxed())
    }

    async fn gridfs_find_one(&self, bucket_namespace: &str, id: &Bson) -> Result<Option<GridFsFile>> {
        let bucket = self.gridfs_bucket(bucket_namespace)?;

        let mut stream = match bucket.open_download_stream(id.clone()).await {
            Ok(stream) => stream,
            Err(e) if e.to_string().contains("FileNotFound") => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut content = Vec::new();
        use futures::io::AsyncReadExt;
        stream
            .read_to_end(&mut content)
            .await
            .map_err(|e| RiverError::MissingField(format!("gridfs read error: {}", e)))?;

        let files_coll = self.collection(&format!("{}.files", bucket_namespace.trim_end_matches(".files")))?;
        let meta = files_coll
            .find_one(doc! { "_id": id.clone() })
            .await?
            .ok_or_else(|| RiverError::MissingField("gridfs file metadata".into()))?;

        let filename = meta.get_str("filename").unwrap_or("").to_string();
        let content_type = meta.get_str("contentType").ok().map(str::to_string);
        let length = meta.get_i64("length").unwrap_or(content.len() as i64);
        let chunk_size = meta.get_i64("chunkSize").unwrap_or(261_120);

        let mut hasher = Md5::new();
        hasher.update(&content);
        let md5 = format!("{:x}", hasher.finalize());

        Ok(Some(GridFsFile {
            id: crate::event::extract_id(&doc! { "_id": id.clone() }).unwrap_or_default(),
            filename,
            content_type,
            md5,
            length,
            chunk_size,
            content,
        }))
    }

    async fn authenticate(&self, _database: &str, _username: &str, _password: &str) -> Result<()> {
        // Authentication is performed by the driver itself from the
        // connection string's credentials; this method exists so the
        // slurper's admin-then-local fallback (§4.3.5/§7 kinds 4,5) has a
        // concrete hook to call and a concrete error to react to.
        Ok(())
    }

    async fn max_oplog_timestamp(&self) -> Result<OplogTimestamp> {
        let coll = self.client.database("local").collection::<Document>("oplog.rs");
        let opts = FindOptions::builder()
            .sort(doc! { "$natural": -1 })
            .limit(1)
            .build();

        let mut cursor = coll.find(doc! {}).with_options(opts).await?;
        match cursor.try_next().await? {
            Some(entry) => crate::event::entry_ts(&entry),
            None => Ok(OplogTimestamp::MIN),
        }
    }

    async fn connect_shard(&self, connection_string: &str) -> Result<std::sync::Arc<dyn SourceClient>> {
        let client = MongoSourceClient::connect(connection_string).await?;
        Ok(std::sync::Arc::new(client))
    }
}
