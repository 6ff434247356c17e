//! Persists and reads the last-applied oplog timestamp per namespace,
//! stored as a document in the sink itself (§3/§6 persistence layout).
//!
//! A load-or-none checkpoint round trip read/written through `SinkClient`
//! instead of a dedicated store, keeping the checkpoint alongside the data
//! it guards.

use std::sync::Arc;

use mongodb::bson::doc;

use crate::error::Result;
use crate::sink::{BulkAction, SinkClient};
use crate::timestamp::OplogTimestamp;

/// Reads and builds checkpoint writes for a single river (index/type pair).
pub struct CheckpointStore {
    sink: Arc<dyn SinkClient>,
    river_index: String,
    river_name: String,
}

impl CheckpointStore {
    /// Build a store writing into `river_index`/`river_name` (the river's
    /// own status index and the river's name as its document type).
    pub fn new(sink: Arc<dyn SinkClient>, river_index: impl Into<String>, river_name: impl Into<String>) -> Self {
        CheckpointStore {
            sink,
            river_index: river_index.into(),
            river_name: river_name.into(),
        }
    }

    /// Read the last stored checkpoint for `namespace` (`db.collection`), if
    /// any. A stale read here is acceptable: the indexer is the only writer
    /// and always advances monotonically (§5).
    pub async fn last_checkpoint(&self, namespace: &str) -> Result<Option<OplogTimestamp>> {
        let doc = self
            .sink
            .get_document(&self.river_index, &self.river_name, namespace)
            .await?;

        let Some(doc) = doc else { return Ok(None) };

        let ts = doc
            .get_document(&self.river_name)
            .ok()
            .and_then(|inner| inner.get_timestamp("_last_ts").ok())
            .map(OplogTimestamp::from_bson);

        Ok(ts)
    }

    /// Build the bulk action that writes `namespace`'s checkpoint to `ts`,
    /// to be appended into the same bulk as the batch's document actions
    /// (§4.4 step 4's "in the SAME bulk" invariant).
    pub fn checkpoint_action(&self, namespace: &str, ts: OplogTimestamp) -> BulkAction {
        let type_key = self.river_name.clone();
        BulkAction::Index {
            index: self.river_index.clone(),
            doc_type: self.river_name.clone(),
            id: Some(namespace.to_string()),
            parent: None,
            routing: None,
            body: doc! { type_key: { "_last_ts": ts.into_bson_value() } },
        }
    }

    /// Read the river's enable flag (`{enabled: bool}`), used by the
    /// supervisor's monitor loop (§4.5). Missing record defaults to
    /// disabled.
    pub async fn enabled(&self, river_name: &str) -> Result<bool> {
        let doc = self
            .sink
            .get_document(&self.river_index, &self.river_name, river_name)
            .await?;

        Ok(doc
            .and_then(|d| d.get_bool("enabled").ok())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BulkResponse;
    use async_trait::async_trait;
    use mongodb::bson::Document;
    use std::sync::Mutex;

    struct StubSink {
        docs: Mutex<std::collections::HashMap<(String, String, String), Document>>,
    }

    #[async_trait]
    impl SinkClient for StubSink {
        async fn create_index(&self, _index: &str) -> Result<()> {
            Ok(())
        }
        async fn put_mapping(&self, _index: &str, _doc_type: &str, _mapping: &crate::sink::MappingDefinition) -> Result<()> {
            Ok(())
        }
        async fn delete_mapping(&self, _index: &str, _doc_type: &str) -> Result<()> {
            Ok(())
        }
        async fn refresh_index(&self, _index: &str) -> Result<()> {
            Ok(())
        }
        async fn get_mapping(&self, _index: &str, _doc_type: &str) -> Result<Option<crate::sink::MappingDefinition>> {
            Ok(None)
        }
        async fn get_document(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Document>> {
            Ok(self
                .docs
                .lock()
                .unwrap()
                .get(&(index.to_string(), doc_type.to_string(), id.to_string()))
                .cloned())
        }
        async fn bulk(&self, actions: Vec<BulkAction>) -> Result<BulkResponse> {
            for action in actions {
                if let BulkAction::Index { index, doc_type, id: Some(id), body, .. } = action {
                    self.docs.lock().unwrap().insert((index, doc_type, id), body);
                }
            }
            Ok(BulkResponse::default())
        }
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let sink: Arc<dyn SinkClient> = Arc::new(StubSink { docs: Mutex::new(Default::default()) });
        let store = CheckpointStore::new(sink, "_river", "my_river");

        assert_eq!(store.last_checkpoint("db.coll").await.unwrap(), None);
    }

    #[tokio::test]
    async fn round_trips_through_bulk_and_read() {
        let sink: Arc<dyn SinkClient> = Arc::new(StubSink { docs: Mutex::new(Default::default()) });
        let store = CheckpointStore::new(sink.clone(), "_river", "my_river");

        let ts = OplogTimestamp::new(100, 1);
        let action = store.checkpoint_action("db.coll", ts);
        sink.bulk(vec![action]).await.unwrap();

        assert_eq!(store.last_checkpoint("db.coll").await.unwrap(), Some(ts));
    }
}
