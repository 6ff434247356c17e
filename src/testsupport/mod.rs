//! In-memory fakes for `SourceClient`/`SinkClient` (§10.4), used to drive
//! `Slurper`/`Indexer`/`Supervisor` through the full pipeline without a live
//! MongoDB replica set or Elasticsearch cluster: a small in-memory double
//! standing in for each driver client, hand-built BSON fixtures scaled up
//! to whole collections plus a notify-driven tailable cursor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use mongodb::bson::{doc, Bson, Document};
use tokio::sync::{Mutex, Notify};

use crate::error::Result;
use crate::event::GridFsFile;
use crate::sink::{BulkAction, BulkItemResult, BulkResponse, MappingDefinition, SinkClient};
use crate::source::{SourceClient, Topology};
use crate::timestamp::OplogTimestamp;

fn doc_matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| doc.get(key) == Some(value))
}

/// A minimal evaluator for the conjunctions `build_filter` (see
/// `crate::slurper`) constructs: `$and`/`$or` at the top level, `$in`/`$gt`
/// inside a field position, plain equality otherwise. Not a general Mongo
/// query engine — just enough to drive the fake tailable cursor.
fn oplog_matches(entry: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| match key.as_str() {
        "$and" => match value {
            Bson::Array(clauses) => clauses
                .iter()
                .all(|clause| clause.as_document().is_some_and(|c| oplog_matches(entry, c))),
            _ => false,
        },
        "$or" => match value {
            Bson::Array(clauses) => clauses
                .iter()
                .any(|clause| clause.as_document().is_some_and(|c| oplog_matches(entry, c))),
            _ => false,
        },
        _ => field_matches(entry.get(key), value),
    })
}

fn field_matches(actual: Option<&Bson>, expected: &Bson) -> bool {
    match expected {
        Bson::Document(ops) if ops.contains_key("$in") => match ops.get("$in") {
            Some(Bson::Array(values)) => actual.is_some_and(|a| values.contains(a)),
            _ => false,
        },
        Bson::Document(ops) if ops.contains_key("$gt") => match (actual, ops.get("$gt")) {
            (Some(Bson::Timestamp(a)), Some(Bson::Timestamp(b))) => a > b,
            _ => false,
        },
        other => actual == Some(other),
    }
}

fn find_next(oplog: &[Document], from: usize, filter: &Document) -> Option<(usize, Document)> {
    oplog[from..]
        .iter()
        .position(|entry| oplog_matches(entry, filter))
        .map(|offset| (from + offset + 1, oplog[from + offset].clone()))
}

struct FakeSourceState {
    topology: Topology,
    collections: HashMap<String, Vec<Document>>,
    oplog: Vec<Document>,
    gridfs: HashMap<String, GridFsFile>,
    seq: u32,
}

impl FakeSourceState {
    fn next_ts(&mut self) -> OplogTimestamp {
        self.seq += 1;
        OplogTimestamp::new(self.seq, 0)
    }
}

/// An in-memory `SourceClient`: a fake replica set with its own collections
/// and a synthetic oplog, plus a `Notify` so a fake tailable cursor can
/// block the same way a real await-data cursor would.
#[derive(Clone)]
pub struct FakeSourceClient {
    inner: Arc<Mutex<FakeSourceState>>,
    notify: Arc<Notify>,
}

impl Default for FakeSourceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSourceClient {
    /// A fake replica set with empty collections and oplog.
    pub fn new() -> Self {
        FakeSourceClient {
            inner: Arc::new(Mutex::new(FakeSourceState {
                topology: Topology::ReplicaSet,
                collections: HashMap::new(),
                oplog: Vec::new(),
                gridfs: HashMap::new(),
                seq: 0,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A fake sharded cluster, reporting the given shards from `topology()`.
    pub fn sharded(shards: Vec<(String, String)>) -> Self {
        let client = Self::new();
        client
            .inner
            .try_lock()
            .expect("fresh client is uncontended")
            .topology = Topology::Sharded { shards };
        client
    }

    /// Seed a collection's current state without producing any oplog entry
    /// (the state a collection is in before a slurper's bootstrap runs).
    pub async fn seed_collection(&self, namespace: &str, docs: Vec<Document>) {
        self.inner.lock().await.collections.entry(namespace.to_string()).or_default().extend(docs);
    }

    /// Insert a document, appending a matching oplog `"i"` entry.
    pub async fn insert(&self, namespace: &str, doc: Document) -> OplogTimestamp {
        let mut state = self.inner.lock().await;
        let ts = state.next_ts();
        state.collections.entry(namespace.to_string()).or_default().push(doc.clone());
        state.oplog.push(doc! { "op": "i", "ns": namespace, "ts": ts.to_bson(), "o": doc });
        drop(state);
        self.notify.notify_waiters();
        ts
    }

    /// Delete every document matching `selector`, appending a matching
    /// oplog `"d"` entry (`o` carries the selector, as MongoDB does for a
    /// single-document delete).
    pub async fn delete(&self, namespace: &str, selector: Document) -> OplogTimestamp {
        let mut state = self.inner.lock().await;
        let ts = state.next_ts();
        if let Some(docs) = state.collections.get_mut(namespace) {
            docs.retain(|d| !doc_matches(d, &selector));
        }
        state.oplog.push(doc! { "op": "d", "ns": namespace, "ts": ts.to_bson(), "o": selector });
        drop(state);
        self.notify.notify_waiters();
        ts
    }

    /// Apply `set_fields` to every document currently matching `selector`,
    /// appending one oplog `"u"` entry per matched document with
    /// `o2 = {_id: ...}` — mirroring how MongoDB fans a multi-document
    /// update out into per-document oplog entries.
    pub async fn update_many(&self, namespace: &str, selector: Document, set_fields: Document) -> Vec<OplogTimestamp> {
        let mut state = self.inner.lock().await;

        let matched_ids: Vec<Bson> = state
            .collections
            .get(namespace)
            .map(|docs| {
                docs.iter()
                    .filter(|d| doc_matches(d, &selector))
                    .filter_map(|d| d.get("_id").cloned())
                    .collect()
            })
            .unwrap_or_default();

        let mut timestamps = Vec::with_capacity(matched_ids.len());
        for id in matched_ids {
            let ts = state.next_ts();
            if let Some(docs) = state.collections.get_mut(namespace) {
                for d in docs.iter_mut() {
                    if d.get("_id") == Some(&id) {
                        for (k, v) in set_fields.iter() {
                            d.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            state.oplog.push(doc! {
                "op": "u", "ns": namespace, "ts": ts.to_bson(),
                "o": { "$set": set_fields.clone() },
                "o2": { "_id": id },
            });
            timestamps.push(ts);
        }

        drop(state);
        self.notify.notify_waiters();
        timestamps
    }

    /// Append a `{drop: collection}` command oplog entry against `db.$cmd`.
    pub async fn drop_collection(&self, db: &str, collection: &str) -> OplogTimestamp {
        let mut state = self.inner.lock().await;
        let ts = state.next_ts();
        state.oplog.push(doc! {
            "op": "c", "ns": format!("{}.$cmd", db), "ts": ts.to_bson(),
            "o": { "drop": collection },
        });
        drop(state);
        self.notify.notify_waiters();
        ts
    }

    /// Store a GridFS file and append a matching `"i"` entry against its
    /// `.files` namespace.
    pub async fn upload_file(&self, files_namespace: &str, file: GridFsFile) -> OplogTimestamp {
        let mut state = self.inner.lock().await;
        let ts = state.next_ts();
        let key = format!("{}:{}", files_namespace, file.id);
        let id = file.id.clone();
        state.gridfs.insert(key, file);
        state.oplog.push(doc! {
            "op": "i", "ns": files_namespace, "ts": ts.to_bson(),
            "o": { "_id": id },
        });
        drop(state);
        self.notify.notify_waiters();
        ts
    }
}

#[async_trait]
impl SourceClient for FakeSourceClient {
    async fn topology(&self) -> Result<Topology> {
        Ok(self.inner.lock().await.topology.clone())
    }

    async fn tail_oplog(&self, filter: Document) -> Result<BoxStream<'static, Result<Document>>> {
        let inner = self.inner.clone();
        let notify = self.notify.clone();

        Ok(stream::unfold((0usize, inner, notify, filter), |(mut pos, inner, notify, filter)| async move {
            loop {
                let notified = notify.notified();

                let found = {
                    let state = inner.lock().await;
                    find_next(&state.oplog, pos, &filter)
                };

                if let Some((next_pos, entry)) = found {
                    pos = next_pos;
                    return Some((Ok(entry), (pos, inner, notify, filter)));
                }

                notified.await;
            }
        })
        .boxed())
    }

    async fn find_all(&self, namespace: &str) -> Result<BoxStream<'static, Result<Document>>> {
        let docs = self.inner.lock().await.collections.get(namespace).cloned().unwrap_or_default();
        Ok(stream::iter(docs.into_iter().map(Ok)).boxed())
    }

    async fn find(&self, namespace: &str, filter: Document) -> Result<BoxStream<'static, Result<Document>>> {
        let docs = self.inner.lock().await.collections.get(namespace).cloned().unwrap_or_default();
        let matched: Vec<Document> = docs.into_iter().filter(|d| doc_matches(d, &filter)).collect();
        Ok(stream::iter(matched.into_iter().map(Ok)).boxed())
    }

    async fn gridfs_find_one(&self, bucket_namespace: &str, id: &Bson) -> Result<Option<GridFsFile>> {
        let key = format!("{}:{}", bucket_namespace, crate::event::extract_id(&doc! { "_id": id.clone() }).unwrap_or_default());
        Ok(self.inner.lock().await.gridfs.get(&key).cloned())
    }

    async fn authenticate(&self, _database: &str, _username: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    async fn max_oplog_timestamp(&self) -> Result<OplogTimestamp> {
        let state = self.inner.lock().await;
        match state.oplog.last() {
            Some(entry) => crate::event::entry_ts(entry),
            None => Ok(OplogTimestamp::MIN),
        }
    }

    async fn connect_shard(&self, _connection_string: &str) -> Result<Arc<dyn SourceClient>> {
        Ok(Arc::new(self.clone()))
    }
}

#[derive(Default)]
struct FakeSinkState {
    indices: std::collections::HashSet<String>,
    mappings: HashMap<(String, String), MappingDefinition>,
    documents: HashMap<(String, String, String), Document>,
}

/// An in-memory `SinkClient`: indices, mappings and documents all held in a
/// locked map, with `bulk` applying index/delete actions directly.
pub struct FakeSinkClient {
    state: Mutex<FakeSinkState>,
}

impl Default for FakeSinkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSinkClient {
    /// An empty sink: no indices, mappings or documents.
    pub fn new() -> Self {
        FakeSinkClient {
            state: Mutex::new(FakeSinkState::default()),
        }
    }

    /// Seed a document directly, bypassing `bulk` (used to pre-populate a
    /// checkpoint or enable-flag record for a test).
    pub async fn seed_document(&self, index: &str, doc_type: &str, id: &str, body: Document) {
        self.state
            .lock()
            .await
            .documents
            .insert((index.to_string(), doc_type.to_string(), id.to_string()), body);
    }

    /// All documents currently stored under `(index, doc_type)`, keyed by
    /// id, for test assertions.
    pub async fn documents_in(&self, index: &str, doc_type: &str) -> HashMap<String, Document> {
        self.state
            .lock()
            .await
            .documents
            .iter()
            .filter(|((i, t, _), _)| i == index && t == doc_type)
            .map(|((_, _, id), body)| (id.clone(), body.clone()))
            .collect()
    }

    /// The mapping currently installed under `(index, doc_type)`, if any.
    pub async fn mapping_for(&self, index: &str, doc_type: &str) -> Option<MappingDefinition> {
        self.state.lock().await.mappings.get(&(index.to_string(), doc_type.to_string())).cloned()
    }
}

#[async_trait]
impl SinkClient for FakeSinkClient {
    async fn create_index(&self, index: &str) -> Result<()> {
        self.state.lock().await.indices.insert(index.to_string());
        Ok(())
    }

    async fn put_mapping(&self, index: &str, doc_type: &str, mapping: &MappingDefinition) -> Result<()> {
        self.state
            .lock()
            .await
            .mappings
            .insert((index.to_string(), doc_type.to_string()), mapping.clone());
        Ok(())
    }

    async fn delete_mapping(&self, index: &str, doc_type: &str) -> Result<()> {
        self.state.lock().await.mappings.remove(&(index.to_string(), doc_type.to_string()));
        Ok(())
    }

    async fn refresh_index(&self, _index: &str) -> Result<()> {
        Ok(())
    }

    async fn get_mapping(&self, index: &str, doc_type: &str) -> Result<Option<MappingDefinition>> {
        Ok(self.state.lock().await.mappings.get(&(index.to_string(), doc_type.to_string())).cloned())
    }

    async fn get_document(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Document>> {
        Ok(self
            .state
            .lock()
            .await
            .documents
            .get(&(index.to_string(), doc_type.to_string(), id.to_string()))
            .cloned())
    }

    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<BulkResponse> {
        let mut state = self.state.lock().await;
        let mut items = Vec::with_capacity(actions.len());

        for action in actions {
            match action {
                BulkAction::Index { index, doc_type, id, body, .. } => {
                    let key_id = id.clone().unwrap_or_default();
                    state.documents.insert((index, doc_type, key_id), body);
                    items.push(BulkItemResult { id, error: None });
                }
                BulkAction::Delete { index, doc_type, id, .. } => {
                    state.documents.remove(&(index, doc_type, id.clone()));
                    items.push(BulkItemResult { id: Some(id), error: None });
                }
            }
        }

        Ok(BulkResponse { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slurper::build_filter;

    #[tokio::test]
    async fn find_all_returns_seeded_documents() {
        let source = FakeSourceClient::new();
        source.seed_collection("db.coll", vec![doc! { "_id": "a" }, doc! { "_id": "b" }]).await;

        let mut stream = source.find_all("db.coll").await.unwrap();
        let mut ids = Vec::new();
        while let Some(doc) = stream.next().await {
            ids.push(crate::event::extract_id(&doc.unwrap()).unwrap());
        }
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn tail_oplog_observes_filter_and_resume_position() {
        let source = FakeSourceClient::new();
        source.insert("db.coll", doc! { "_id": "a" }).await;
        let resume_after = source.insert("db.coll", doc! { "_id": "b" }).await;
        source.insert("db.coll", doc! { "_id": "c" }).await;

        let filter = build_filter(&["db.coll".to_string()], None, resume_after);
        let mut stream = source.tail_oplog(filter).await.unwrap();

        let entry = stream.next().await.unwrap().unwrap();
        assert_eq!(crate::event::op_code(&entry).unwrap(), "i");
        let body = entry.get_document("o").unwrap();
        assert_eq!(crate::event::extract_id(body), Some("c".to_string()));
    }

    #[tokio::test]
    async fn tail_oplog_wakes_on_new_entry() {
        let source = FakeSourceClient::new();
        let filter = build_filter(&["db.coll".to_string()], None, OplogTimestamp::MIN);
        let mut stream = source.tail_oplog(filter).await.unwrap();

        let source2 = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            source2.insert("db.coll", doc! { "_id": "late" }).await;
        });

        let entry = tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
            .await
            .expect("should not time out")
            .unwrap()
            .unwrap();
        assert_eq!(crate::event::extract_entry_id(&entry), Some("late".to_string()));
    }

    #[tokio::test]
    async fn bulk_applies_index_and_delete_actions() {
        let sink = FakeSinkClient::new();
        sink.bulk(vec![BulkAction::Index {
            index: "idx".into(),
            doc_type: "t".into(),
            id: Some("a".into()),
            parent: None,
            routing: None,
            body: doc! { "_id": "a" },
        }])
        .await
        .unwrap();

        assert_eq!(sink.documents_in("idx", "t").await.len(), 1);

        sink.bulk(vec![BulkAction::Delete {
            index: "idx".into(),
            doc_type: "t".into(),
            id: "a".into(),
            parent: None,
            routing: None,
        }])
        .await
        .unwrap();

        assert!(sink.documents_in("idx", "t").await.is_empty());
    }
}
