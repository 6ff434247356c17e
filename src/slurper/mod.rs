//! The Slurper (§4.3): tails a single oplog-producing source (one replica
//! set, or one shard of a sharded cluster) and produces normalized
//! `ChangeEvent`s onto the event queue.
//!
//! Unlike a bare tailable-cursor stream left for a caller to drive by hand,
//! this owns its own `run()` loop, resume logic and error recovery policy
//! (§4.3.5) so several of these can run concurrently under one supervisor.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::RiverConfig;
use crate::error::{Result, RiverError};
use crate::event::{
    attachment_event, command_event, document_event, entry_ts, extract_entry_id, extract_id,
    is_from_migrate, is_gridfs_chunks_namespace, is_gridfs_files_namespace, namespace, op_code,
    ChangeOp,
};
use crate::queue::EventQueueSender;
use crate::source::SourceClient;
use crate::timestamp::OplogTimestamp;

/// Sleep between outer-loop restarts, to avoid a tight reconnect spin
/// (§4.3.5).
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// One slurper: owns a source handle for a single replica set (or shard),
/// a handle onto the shared event queue, and the checkpoint store it reads
/// its resume position from.
pub struct Slurper {
    config: Arc<RiverConfig>,
    source: Arc<dyn SourceClient>,
    checkpoints: Arc<CheckpointStore>,
    queue: EventQueueSender,
    cancel: CancellationToken,
    /// Shard name, for sharded topologies; `None` for a plain replica set.
    shard: Option<String>,
}

impl Slurper {
    /// Build a slurper for a single source handle.
    pub fn new(
        config: Arc<RiverConfig>,
        source: Arc<dyn SourceClient>,
        checkpoints: Arc<CheckpointStore>,
        queue: EventQueueSender,
        cancel: CancellationToken,
        shard: Option<String>,
    ) -> Self {
        Slurper {
            config,
            source,
            checkpoints,
            queue,
            cancel,
            shard,
        }
    }

    /// Run until cancelled or a fatal error is hit (§4.3.5). Authenticates
    /// once, then loops the resume/tail cycle, sleeping briefly between
    /// restarts.
    #[instrument(skip_all, fields(namespace = %self.config.namespace(), shard = ?self.shard))]
    pub async fn run(&self) {
        if let Err(e) = self.authenticate().await {
            warn!(error = %e, "slurper authentication failed, giving up");
            return;
        }

        while !self.cancel.is_cancelled() {
            match self.run_once().await {
                Ok(()) => {
                    warn!("oplog cursor ended unexpectedly, restarting");
                }
                Err(RiverError::Interrupted) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "fatal slurper error, stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "slurper error, restarting outer loop");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// Authenticate against the admin database, falling back to a local
    /// credential on failure (§4.3.5/§7 kinds 4,5). A no-op when no
    /// credentials are configured.
    async fn authenticate(&self) -> Result<()> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password) else {
            return Ok(());
        };

        match self.source.authenticate("admin", username, password).await {
            Ok(()) => Ok(()),
            Err(RiverError::AdminAuthFailed(reason)) => {
                warn!(reason, "admin auth failed, falling back to local credentials");
                self.source
                    .authenticate(self.config.source_db(), username, password)
                    .await
                    .map_err(|_| RiverError::LocalAuthFailed("local credential auth failed".into()))
            }
            Err(e) => Err(e),
        }
    }

    /// One full resume/tail cycle (§4.3.2): read the checkpoint, bootstrap
    /// if necessary, then tail until the cursor ends or errors.
    async fn run_once(&self) -> Result<()> {
        let checkpoint = self.checkpoints.last_checkpoint(self.config.namespace()).await?;

        let resume_ts = match (checkpoint, self.config.initial_timestamp) {
            (Some(ts), _) => ts,
            (None, Some(initial)) => initial,
            (None, None) => {
                let t0 = self.source.max_oplog_timestamp().await?;
                self.bootstrap(t0).await?;
                t0
            }
        };

        let filter = build_filter(&self.target_namespaces(), self.config.filter.as_ref(), resume_ts);
        let mut cursor = self.source.tail_oplog(filter).await?;

        while let Some(next) = cursor.next().await {
            if self.cancel.is_cancelled() {
                return Err(RiverError::Interrupted);
            }
            self.process_entry(next?).await?;
        }

        Ok(())
    }

    /// The namespaces the oplog filter watches: the target collection (or
    /// its `.files` sentinel for GridFS) plus `db.$cmd` for drop commands.
    fn target_namespaces(&self) -> Vec<String> {
        let cmd_ns = format!("{}.$cmd", self.config.source_db());
        match self.config.gridfs_files_namespace() {
            Some(files_ns) => vec![files_ns, cmd_ns],
            None => vec![self.config.namespace().to_string(), cmd_ns],
        }
    }

    /// Full-collection bootstrap (§4.3.2): enqueue every current document
    /// (or GridFS file) as a synthetic insert stamped with `t0`.
    async fn bootstrap(&self, t0: OplogTimestamp) -> Result<()> {
        info!(ts = %t0, "starting full-collection bootstrap");
        let mut count = 0u64;

        if let Some(files_ns) = self.config.gridfs_files_namespace() {
            let mut stream = self.source.find_all(&files_ns).await?;
            while let Some(doc) = stream.next().await {
                let doc = doc?;
                if let Some(id) = doc.get("_id").cloned() {
                    if let Some(file) = self.source.gridfs_find_one(&files_ns, &id).await? {
                        self.emit(attachment_event(t0, ChangeOp::Insert, file)).await?;
                        count += 1;
                    }
                }
            }
        } else {
            let mut stream = self.source.find_all(self.config.namespace()).await?;
            while let Some(doc) = stream.next().await {
                let doc = doc?;
                let id = extract_id(&doc);
                self.emit(document_event(id, t0, ChangeOp::Insert, doc, &self.config.exclude_fields))
                    .await?;
                count += 1;
            }
        }

        info!(count, "full-collection bootstrap complete");
        Ok(())
    }

    /// Process a single raw oplog entry into zero or more queued events
    /// (§4.3.4).
    async fn process_entry(&self, entry: Document) -> Result<()> {
        if is_from_migrate(&entry) {
            return Ok(());
        }

        let ns = namespace(&entry)?;
        if is_gridfs_chunks_namespace(ns) {
            return Ok(());
        }

        let op = op_code(&entry)?;
        let ts = entry_ts(&entry)?;

        if self.config.is_gridfs && is_gridfs_files_namespace(ns) && matches!(op, "i" | "u") {
            return self.handle_gridfs_entry(ts, op, &entry).await;
        }

        match op {
            "i" => {
                let body = entry
                    .get_document("o")
                    .map_err(|_| RiverError::MissingField("o".into()))?
                    .clone();
                let id = extract_id(&body);
                self.emit(document_event(id, ts, ChangeOp::Insert, body, &self.config.exclude_fields))
                    .await
            }
            "u" => {
                let selector = entry
                    .get_document("o2")
                    .map_err(|_| RiverError::MissingField("o2".into()))?
                    .clone();
                self.fan_out_update(ts, selector).await
            }
            "d" => {
                let body = entry
                    .get_document("o")
                    .map_err(|_| RiverError::MissingField("o".into()))?
                    .clone();
                let id = extract_id(&body);
                self.emit(document_event(id, ts, ChangeOp::Delete, body, &self.config.exclude_fields))
                    .await
            }
            "c" => {
                let command = entry
                    .get_document("o")
                    .map_err(|_| RiverError::MissingField("o".into()))?
                    .clone();
                self.emit(command_event(ts, command)).await
            }
            other => {
                warn!(op = other, "unrecognized oplog op, skipping");
                Ok(())
            }
        }
    }

    /// Update fan-out (§4.3.4): re-query the source using `o2` as selector
    /// and emit one event per currently matching document.
    async fn fan_out_update(&self, ts: OplogTimestamp, selector: Document) -> Result<()> {
        let mut stream = self.source.find(self.config.namespace(), selector).await?;
        while let Some(doc) = stream.next().await {
            let doc = doc?;
            let id = extract_id(&doc);
            self.emit(document_event(id, ts, ChangeOp::Update, doc, &self.config.exclude_fields))
                .await?;
        }
        Ok(())
    }

    /// Fetch and emit a GridFS file change. A file deleted between the
    /// oplog write and this fetch silently drops, mirroring update fan-out's
    /// eventually-consistent semantics.
    async fn handle_gridfs_entry(&self, ts: OplogTimestamp, op: &str, entry: &Document) -> Result<()> {
        let files_ns = self
            .config
            .gridfs_files_namespace()
            .expect("gridfs files namespace must exist for a gridfs entry");

        let id: Bson = entry
            .get_document("o")
            .ok()
            .and_then(|o| o.get("_id").cloned())
            .or_else(|| entry.get_document("o2").ok().and_then(|o2| o2.get("_id").cloned()))
            .ok_or_else(|| RiverError::MissingField("_id".into()))?;

        match self.source.gridfs_find_one(&files_ns, &id).await? {
            Some(file) => {
                let change_op = if op == "i" { ChangeOp::Insert } else { ChangeOp::Update };
                self.emit(attachment_event(ts, change_op, file)).await
            }
            None => Ok(()),
        }
    }

    async fn emit(&self, event: crate::event::ChangeEvent) -> Result<()> {
        self.queue.put(event, &self.cancel).await
    }
}

/// Build the oplog cursor filter (§4.3.3): namespace membership, an
/// optional user filter disjoined with plain deletes, and a strict
/// lower bound on `ts`.
pub fn build_filter(namespaces: &[String], user_filter: Option<&Document>, resume_ts: OplogTimestamp) -> Document {
    let ns_values: Vec<Bson> = namespaces.iter().map(|ns| Bson::String(ns.clone())).collect();

    let mut clauses = vec![
        doc! { "ns": { "$in": ns_values } },
        doc! { "ts": { "$gt": resume_ts.into_bson_value() } },
    ];

    if let Some(user_filter) = user_filter {
        clauses.push(doc! {
            "$or": [
                { "op": "d" },
                { "$and": [{ "op": { "$in": ["i", "u"] } }, user_filter.clone()] },
            ]
        });
    }

    doc! { "$and": clauses }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::RiverConfigBuilder;
    use crate::queue::{event_queue, ThrottleSize};
    use crate::sink::SinkClient;
    use crate::testsupport::{FakeSinkClient, FakeSourceClient};

    fn river_config() -> Arc<RiverConfig> {
        Arc::new(
            RiverConfigBuilder::new()
                .river_name("my_river")
                .source("mongodb://localhost", "db", "coll")
                .target("my_index", "my_type")
                .build()
                .unwrap(),
        )
    }

    fn test_slurper(config: Arc<RiverConfig>, source: Arc<FakeSourceClient>) -> (Slurper, crate::queue::EventQueueReceiver) {
        let sink: Arc<dyn SinkClient> = Arc::new(FakeSinkClient::new());
        let checkpoints = Arc::new(CheckpointStore::new(sink, "_river", &config.river_name));
        let (tx, rx) = event_queue(ThrottleSize::Unbounded);
        let slurper = Slurper::new(config, source, checkpoints, tx, CancellationToken::new(), None);
        (slurper, rx)
    }

    #[test]
    fn build_filter_without_user_filter() {
        let filter = build_filter(&["db.coll".to_string(), "db.$cmd".to_string()], None, OplogTimestamp::new(5, 0));
        let and = filter.get_array("$and").unwrap();
        assert_eq!(and.len(), 2);
    }

    #[test]
    fn build_filter_with_user_filter_adds_or_clause() {
        let user_filter = doc! { "color": "red" };
        let filter = build_filter(&["db.coll".to_string()], Some(&user_filter), OplogTimestamp::MIN);
        let and = filter.get_array("$and").unwrap();
        assert_eq!(and.len(), 3);
    }

    #[tokio::test]
    async fn skips_frommigrate_and_chunks_entries() {
        let config = river_config();
        let source = Arc::new(FakeSourceClient::new());
        let (slurper, mut rx) = test_slurper(config, source);

        slurper
            .process_entry(doc! { "op": "i", "ns": "db.coll", "ts": OplogTimestamp::new(1, 0).to_bson(), "o": { "_id": "a" }, "fromMigrate": true })
            .await
            .unwrap();
        slurper
            .process_entry(doc! { "op": "i", "ns": "db.coll.chunks", "ts": OplogTimestamp::new(2, 0).to_bson(), "o": { "_id": "b" } })
            .await
            .unwrap();

        assert!(rx.poll(Duration::from_millis(20), &CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn update_fan_out_emits_one_event_per_match() {
        let config = river_config();
        let source = Arc::new(FakeSourceClient::new());
        source.seed_collection("db.coll", vec![doc! { "_id": "x", "color": "red" }, doc! { "_id": "y", "color": "red" }]).await;

        let (slurper, mut rx) = test_slurper(config, source);

        slurper
            .fan_out_update(OplogTimestamp::new(1, 0), doc! { "color": "red" })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let first = rx.take(&cancel).await.unwrap();
        let second = rx.take(&cancel).await.unwrap();
        let mut ids = vec![first.id().unwrap().to_string(), second.id().unwrap().to_string()];
        ids.sort();
        assert_eq!(ids, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn bootstrap_stamps_every_document_with_t0() {
        let config = river_config();
        let source = Arc::new(FakeSourceClient::new());
        source
            .seed_collection("db.coll", vec![doc! { "_id": "a" }, doc! { "_id": "b" }])
            .await;

        let (slurper, mut rx) = test_slurper(config, source);
        let t0 = OplogTimestamp::new(10, 0);
        slurper.bootstrap(t0).await.unwrap();

        let cancel = CancellationToken::new();
        let first = rx.take(&cancel).await.unwrap();
        let second = rx.take(&cancel).await.unwrap();
        assert_eq!(first.ts(), t0);
        assert_eq!(second.ts(), t0);
    }

    #[tokio::test]
    async fn gridfs_update_missing_file_drops_silently() {
        let config = Arc::new(
            RiverConfigBuilder::new()
                .river_name("my_river")
                .source("mongodb://localhost", "db", "fs")
                .target("my_index", "my_type")
                .gridfs(true)
                .build()
                .unwrap(),
        );
        let source = Arc::new(FakeSourceClient::new());
        let (slurper, mut rx) = test_slurper(config, source);

        let entry = doc! { "op": "u", "ns": "db.fs.files", "ts": OplogTimestamp::new(1, 0).to_bson(), "o2": { "_id": "missing" } };
        slurper.process_entry(entry).await.unwrap();

        assert!(rx.poll(Duration::from_millis(20), &CancellationToken::new()).await.is_none());
    }
}
