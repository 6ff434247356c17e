//! Mapping Bootstrap (§4.1): creates the target index if absent and, for
//! GridFS rivers, installs the fixed attachment field mapping.

use serde_json::json;
use tracing::{info, warn};

use crate::error::{Result, RiverError};
use crate::sink::{MappingDefinition, SinkClient};

/// The static GridFS attachment mapping (§4.1/§6): `content` as a binary
/// attachment field, `filename`/`contentType`/`md5` as text, `length`/
/// `chunkSize` as 64-bit integers.
pub fn gridfs_attachment_mapping(type_name: &str) -> MappingDefinition {
    json!({
        type_name: {
            "properties": {
                "content": { "type": "attachment" },
                "filename": { "type": "text" },
                "contentType": { "type": "text" },
                "md5": { "type": "text" },
                "length": { "type": "long" },
                "chunkSize": { "type": "long" },
            }
        }
    })
}

/// Create `index_name` if it doesn't already exist and, if `is_gridfs`,
/// install the attachment mapping under `type_name`.
///
/// A transient cluster-unavailable condition is logged and treated as
/// recoverable (§4.1, §7 kind 3): this function returns `Ok(())` so startup
/// proceeds and the first bulk either succeeds once the cluster recovers or
/// is retried by the indexer loop. Any other failure is propagated as
/// `RiverError::Startup` and aborts startup.
pub async fn ensure_target_ready(
    sink: &dyn SinkClient,
    index_name: &str,
    type_name: &str,
    is_gridfs: bool,
) -> Result<()> {
    match sink.create_index(index_name).await {
        Ok(()) => info!(index = index_name, "created target index"),
        Err(RiverError::ClusterNotReady(reason)) => {
            warn!(index = index_name, reason, "cluster not ready, proceeding anyway");
            return Ok(());
        }
        Err(other) => return Err(other),
    }

    if is_gridfs {
        let mapping = gridfs_attachment_mapping(type_name);
        sink.put_mapping(index_name, type_name, &mapping).await?;
        info!(index = index_name, r#type = type_name, "installed gridfs attachment mapping");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{BulkAction, BulkResponse};
    use async_trait::async_trait;
    use mongodb::bson::Document;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        created: Mutex<Vec<String>>,
        mappings: Mutex<Vec<(String, String)>>,
        fail_create: bool,
        cluster_not_ready: bool,
    }

    #[async_trait]
    impl SinkClient for RecordingSink {
        async fn create_index(&self, index: &str) -> Result<()> {
            if self.cluster_not_ready {
                return Err(RiverError::ClusterNotReady("unavailable".into()));
            }
            if self.fail_create {
                return Err(RiverError::Startup("disk full".into()));
            }
            self.created.lock().unwrap().push(index.to_string());
            Ok(())
        }
        async fn put_mapping(&self, index: &str, doc_type: &str, _mapping: &MappingDefinition) -> Result<()> {
            self.mappings.lock().unwrap().push((index.to_string(), doc_type.to_string()));
            Ok(())
        }
        async fn delete_mapping(&self, _index: &str, _doc_type: &str) -> Result<()> {
            Ok(())
        }
        async fn refresh_index(&self, _index: &str) -> Result<()> {
            Ok(())
        }
        async fn get_mapping(&self, _index: &str, _doc_type: &str) -> Result<Option<MappingDefinition>> {
            Ok(None)
        }
        async fn get_document(&self, _index: &str, _doc_type: &str, _id: &str) -> Result<Option<Document>> {
            Ok(None)
        }
        async fn bulk(&self, _actions: Vec<BulkAction>) -> Result<BulkResponse> {
            Ok(BulkResponse::default())
        }
    }

    #[tokio::test]
    async fn creates_index_and_installs_gridfs_mapping() {
        let sink = RecordingSink::default();
        ensure_target_ready(&sink, "my_index", "my_type", true).await.unwrap();

        assert_eq!(*sink.created.lock().unwrap(), vec!["my_index".to_string()]);
        assert_eq!(
            *sink.mappings.lock().unwrap(),
            vec![("my_index".to_string(), "my_type".to_string())]
        );
    }

    #[tokio::test]
    async fn skips_mapping_for_non_gridfs() {
        let sink = RecordingSink::default();
        ensure_target_ready(&sink, "my_index", "my_type", false).await.unwrap();

        assert!(sink.mappings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cluster_not_ready_is_recoverable() {
        let sink = RecordingSink { cluster_not_ready: true, ..Default::default() };
        let result = ensure_target_ready(&sink, "my_index", "my_type", false).await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn other_failures_abort_startup() {
        let sink = RecordingSink { fail_create: true, ..Default::default() };
        let result = ensure_target_ready(&sink, "my_index", "my_type", false).await;

        assert!(matches!(result, Err(RiverError::Startup(_))));
    }
}
