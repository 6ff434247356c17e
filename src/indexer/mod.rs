//! The Indexer (§4.4): the pipeline's single consumer. Drains the event
//! queue in batches, runs the optional transformation script, translates
//! events into Elasticsearch bulk actions, and checkpoints progress in the
//! same bulk as the documents it guards.

use std::sync::Arc;
use std::time::Instant;

use mongodb::bson::Document;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::RiverConfig;
use crate::error::{Result, RiverError};
use crate::event::{attachment_envelope, ChangeEvent, ChangeOp};
use crate::queue::EventQueueReceiver;
use crate::sink::{BulkAction, SinkClient};
use crate::timestamp::OplogTimestamp;
use crate::transform::{ScriptContext, Transformer};

#[derive(Default, Clone, Copy)]
struct BatchStats {
    inserted: u64,
    updated: u64,
    deleted: u64,
}

impl BatchStats {
    fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// The indexer. Owns the consuming end of the event queue and accumulates
/// bulk actions across failed submits so a transport failure replays the
/// same batch rather than losing it (§4.4 step 5, §7 kind 8).
pub struct Indexer {
    config: Arc<RiverConfig>,
    sink: Arc<dyn SinkClient>,
    queue: EventQueueReceiver,
    checkpoints: Arc<CheckpointStore>,
    transformer: Arc<dyn Transformer>,
    cancel: CancellationToken,
    pending_actions: Vec<BulkAction>,
    batch_max_ts: Option<OplogTimestamp>,
    stats: BatchStats,
}

impl Indexer {
    /// Build an indexer over a fresh queue receiver.
    pub fn new(
        config: Arc<RiverConfig>,
        sink: Arc<dyn SinkClient>,
        queue: EventQueueReceiver,
        checkpoints: Arc<CheckpointStore>,
        transformer: Arc<dyn Transformer>,
        cancel: CancellationToken,
    ) -> Self {
        Indexer {
            config,
            sink,
            queue,
            checkpoints,
            transformer,
            cancel,
            pending_actions: Vec::new(),
            batch_max_ts: None,
            stats: BatchStats::default(),
        }
    }

    /// Run batches until cancelled. A non-fatal batch error is logged and
    /// the loop continues (the failed batch's actions remain pending and
    /// are retried on the next iteration).
    #[instrument(skip_all, fields(namespace = %self.config.namespace()))]
    pub async fn run(&mut self) {
        while !self.cancel.is_cancelled() {
            if let Err(e) = self.run_batch().await {
                match e {
                    RiverError::Interrupted => break,
                    e if e.is_fatal() => {
                        tracing::error!(error = %e, "fatal indexer error, stopping");
                        break;
                    }
                    e => warn!(error = %e, "indexer batch failed, retrying"),
                }
            }
        }
    }

    /// Accumulate, transform, translate and submit one batch (§4.4).
    async fn run_batch(&mut self) -> Result<()> {
        let Some(first) = self.queue.take(&self.cancel).await else {
            return Ok(());
        };

        let mut events = vec![first];
        while self.pending_actions.len() + events.len() < self.config.bulk_size {
            match self.queue.poll(self.config.bulk_timeout, &self.cancel).await {
                Some(event) => events.push(event),
                None => break,
            }
        }

        let started = Instant::now();
        for event in events {
            let ts = event.ts();
            self.batch_max_ts = Some(match self.batch_max_ts {
                Some(current) => current.max(ts),
                None => ts,
            });
            self.transform_event(event).await?;
        }

        let Some(max_ts) = self.batch_max_ts else {
            return Ok(());
        };

        let namespace = self.config.namespace().to_string();
        let mut actions = self.pending_actions.clone();
        actions.push(self.checkpoints.checkpoint_action(&namespace, max_ts));

        match self.sink.bulk(actions).await {
            Ok(response) => {
                for failure in response.failures() {
                    warn!(id = ?failure.id, reason = ?failure.error, "bulk item failed");
                }

                let elapsed = started.elapsed();
                let docs = self.stats.total();
                let docs_per_sec = if elapsed.as_secs_f64() > 0.0 {
                    docs as f64 / elapsed.as_secs_f64()
                } else {
                    0.0
                };
                info!(
                    inserted = self.stats.inserted,
                    updated = self.stats.updated,
                    deleted = self.stats.deleted,
                    elapsed_ms = elapsed.as_millis() as u64,
                    docs_per_sec,
                    "submitted bulk"
                );

                self.pending_actions.clear();
                self.batch_max_ts = None;
                self.stats = BatchStats::default();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "bulk transport failed, will retry next loop turn");
                Ok(())
            }
        }
    }

    /// Transform and translate one event into pending bulk actions (§4.4
    /// step 2-3).
    async fn transform_event(&mut self, event: ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::Command { command, .. } => self.handle_command(command).await,
            ChangeEvent::Document { id, op, body, .. } => self.handle_document(id, op, body).await,
            ChangeEvent::Attachment { op, file, .. } => {
                let body = attachment_envelope(&file);
                self.handle_document(Some(file.id.clone()), op, body).await
            }
        }
    }

    async fn handle_document(&mut self, id: Option<String>, op: ChangeOp, mut body: Document) -> Result<()> {
        let Some(id) = id else {
            warn!("dropping document event with no id");
            return Ok(());
        };

        if let Some(field) = &self.config.include_collection_field {
            body.insert(field.clone(), self.config.source_collection_name());
        }

        let ctx = ScriptContext::new(body, op.as_str(), Some(id.clone()));
        let ctx = match self.transformer.apply(ctx.clone()).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, "script evaluation failed, keeping original event");
                ctx
            }
        };

        if ctx.ignore {
            return Ok(());
        }

        let final_op = if ctx.deleted { ChangeOp::Delete } else { op };
        let index = ctx.index_override.clone().unwrap_or_else(|| self.config.target_index.clone());
        let doc_type = ctx.type_override.clone().unwrap_or_else(|| self.config.target_type.clone());
        let parent = ctx.parent_override.clone();
        let routing = ctx.routing_override.clone();
        let resolved_id = ctx.id.clone().unwrap_or(id);

        match final_op {
            ChangeOp::Insert => {
                self.pending_actions.push(BulkAction::Index {
                    index,
                    doc_type,
                    id: Some(resolved_id),
                    parent,
                    routing,
                    body: ctx.document,
                });
                self.stats.inserted += 1;
            }
            ChangeOp::Update => {
                self.pending_actions.push(BulkAction::Delete {
                    index: index.clone(),
                    doc_type: doc_type.clone(),
                    id: resolved_id.clone(),
                    parent: parent.clone(),
                    routing: routing.clone(),
                });
                self.pending_actions.push(BulkAction::Index {
                    index,
                    doc_type,
                    id: Some(resolved_id),
                    parent,
                    routing,
                    body: ctx.document,
                });
                self.stats.updated += 1;
            }
            ChangeOp::Delete => {
                self.pending_actions.push(BulkAction::Delete {
                    index,
                    doc_type,
                    id: resolved_id,
                    parent,
                    routing,
                });
                self.stats.deleted += 1;
            }
            ChangeOp::Command => unreachable!("command events are handled by handle_command"),
        }

        Ok(())
    }

    /// A command event: only `drop <source collection>` with the
    /// drop-collection policy enabled causes any sink mutation (§4.4 step
    /// 3, scenario 5).
    async fn handle_command(&mut self, command: Document) -> Result<()> {
        let Ok(dropped) = command.get_str("drop") else {
            return Ok(());
        };

        if dropped != self.config.source_collection_name() || !self.config.drop_collection {
            return Ok(());
        }

        info!(collection = dropped, "drop collection observed, resetting pending bulk");
        self.pending_actions.clear();
        self.stats = BatchStats::default();

        self.sink.refresh_index(&self.config.target_index).await?;
        let mapping = self.sink.get_mapping(&self.config.target_index, &self.config.target_type).await?;
        self.sink.delete_mapping(&self.config.target_index, &self.config.target_type).await?;
        if let Some(mapping) = mapping {
            self.sink.put_mapping(&self.config.target_index, &self.config.target_type, &mapping).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiverConfigBuilder;
    use crate::event::document_event;
    use crate::queue::{event_queue, ThrottleSize};
    use crate::testsupport::FakeSinkClient;
    use crate::transform::NoopTransformer;
    use mongodb::bson::doc;

    struct IgnoreEverything;

    #[async_trait::async_trait]
    impl Transformer for IgnoreEverything {
        async fn apply(&self, mut ctx: ScriptContext) -> Result<ScriptContext> {
            ctx.ignore = true;
            Ok(ctx)
        }
    }

    fn test_config() -> Arc<RiverConfig> {
        Arc::new(
            RiverConfigBuilder::new()
                .river_name("my_river")
                .source("mongodb://localhost", "db", "coll")
                .target("my_index", "my_type")
                .bulk_timeout_ms(20)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn ignored_event_still_advances_checkpoint() {
        let config = test_config();
        let sink = Arc::new(FakeSinkClient::new());
        let checkpoints = Arc::new(CheckpointStore::new(sink.clone(), "_river", &config.river_name));
        let (tx, rx) = event_queue(ThrottleSize::Unbounded);

        let mut indexer = Indexer::new(
            config.clone(),
            sink.clone(),
            rx,
            checkpoints.clone(),
            Arc::new(IgnoreEverything),
            CancellationToken::new(),
        );

        let ts = OplogTimestamp::new(5, 0);
        let event = document_event(Some("a".into()), ts, ChangeOp::Insert, doc! { "_id": "a" }, &[]);
        tx.put(event, &CancellationToken::new()).await.unwrap();

        indexer.run_batch().await.unwrap();

        assert!(sink.documents_in("my_index", "my_type").await.is_empty());
        assert_eq!(checkpoints.last_checkpoint("db.coll").await.unwrap(), Some(ts));
    }

    #[tokio::test]
    async fn insert_then_update_produces_delete_and_index() {
        let config = test_config();
        let sink = Arc::new(FakeSinkClient::new());
        let checkpoints = Arc::new(CheckpointStore::new(sink.clone(), "_river", &config.river_name));
        let (tx, rx) = event_queue(ThrottleSize::Unbounded);

        let mut indexer = Indexer::new(
            config.clone(),
            sink.clone(),
            rx,
            checkpoints,
            Arc::new(NoopTransformer),
            CancellationToken::new(),
        );

        let ts1 = OplogTimestamp::new(1, 0);
        tx.put(
            document_event(Some("a".into()), ts1, ChangeOp::Insert, doc! { "_id": "a", "color": "red" }, &[]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        indexer.run_batch().await.unwrap();

        let ts2 = OplogTimestamp::new(2, 0);
        tx.put(
            document_event(Some("a".into()), ts2, ChangeOp::Update, doc! { "_id": "a", "color": "blue" }, &[]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        indexer.run_batch().await.unwrap();

        let docs = sink.documents_in("my_index", "my_type").await;
        assert_eq!(docs.get("a").unwrap().get_str("color").unwrap(), "blue");
    }

    #[tokio::test]
    async fn drop_command_resets_pending_and_reinstalls_mapping() {
        let config = Arc::new(
            RiverConfigBuilder::new()
                .river_name("my_river")
                .source("mongodb://localhost", "db", "coll")
                .target("my_index", "my_type")
                .bulk_timeout_ms(200)
                .drop_collection(true)
                .build()
                .unwrap(),
        );
        let sink = Arc::new(FakeSinkClient::new());
        let custom_mapping = serde_json::json!({"my_type": {"properties": {"custom": {"type": "keyword"}}}});
        sink.put_mapping("my_index", "my_type", &custom_mapping).await.unwrap();

        let checkpoints = Arc::new(CheckpointStore::new(sink.clone(), "_river", &config.river_name));
        let (tx, rx) = event_queue(ThrottleSize::Unbounded);

        let mut indexer = Indexer::new(
            config.clone(),
            sink.clone(),
            rx,
            checkpoints,
            Arc::new(NoopTransformer),
            CancellationToken::new(),
        );

        let cancel = CancellationToken::new();
        tx.put(
            document_event(Some("z".into()), OplogTimestamp::new(1, 0), ChangeOp::Insert, doc! { "_id": "z" }, &[]),
            &cancel,
        )
        .await
        .unwrap();
        tx.put(
            crate::event::command_event(OplogTimestamp::new(2, 0), doc! { "drop": "coll" }),
            &cancel,
        )
        .await
        .unwrap();

        indexer.run_batch().await.unwrap();

        assert!(sink.documents_in("my_index", "my_type").await.is_empty());
        assert_eq!(sink.mapping_for("my_index", "my_type").await, Some(custom_mapping));
    }

    #[tokio::test]
    async fn drop_command_ignored_when_policy_disabled() {
        let config = test_config();
        let sink = Arc::new(FakeSinkClient::new());
        let checkpoints = Arc::new(CheckpointStore::new(sink.clone(), "_river", &config.river_name));
        let (tx, rx) = event_queue(ThrottleSize::Unbounded);

        let mut indexer = Indexer::new(
            config.clone(),
            sink.clone(),
            rx,
            checkpoints.clone(),
            Arc::new(NoopTransformer),
            CancellationToken::new(),
        );

        let ts = OplogTimestamp::new(1, 0);
        tx.put(crate::event::command_event(ts, doc! { "drop": "coll" }), &CancellationToken::new())
            .await
            .unwrap();
        indexer.run_batch().await.unwrap();

        assert_eq!(checkpoints.last_checkpoint("db.coll").await.unwrap(), Some(ts));
        assert!(sink.mapping_for("my_index", "my_type").await.is_none());
    }
}
