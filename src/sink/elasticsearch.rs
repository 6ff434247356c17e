//! A `SinkClient` implementation over the Elasticsearch REST API using
//! `reqwest`, since no official `elasticsearch` crate appears anywhere in
//! the wider pack this crate draws its ecosystem stack from.

use async_trait::async_trait;
use mongodb::bson::Document;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, RiverError};
use crate::sink::{BulkAction, BulkItemResult, BulkResponse, MappingDefinition, SinkClient};

/// An Elasticsearch sink reached over HTTP.
pub struct HttpSinkClient {
    http: Client,
    base_url: String,
}

impl HttpSinkClient {
    /// Build a client talking to the cluster at `base_url` (e.g.
    /// `http://localhost:9200`), with the pipeline's standard connect/socket
    /// timeouts (§5).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .build()?;

        Ok(HttpSinkClient {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn handle_status(status: StatusCode, body: &str) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }

        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            debug!("index already exists, treating as success");
            return Ok(());
        }

        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(RiverError::ClusterNotReady(body.to_string()));
        }

        Err(RiverError::Startup(format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl SinkClient for HttpSinkClient {
    async fn create_index(&self, index: &str) -> Result<()> {
        let resp = self.http.put(self.url(index)).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Self::handle_status(status, &body)
    }

    async fn put_mapping(&self, index: &str, doc_type: &str, mapping: &MappingDefinition) -> Result<()> {
        let path = format!("{}/_mapping/{}", index, doc_type);
        let resp = self.http.put(self.url(&path)).json(mapping).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Self::handle_status(status, &body)
    }

    async fn delete_mapping(&self, index: &str, doc_type: &str) -> Result<()> {
        let path = format!("{}/_mapping/{}", index, doc_type);
        let resp = self.http.delete(self.url(&path)).send().await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Self::handle_status(status, &body)
    }

    async fn refresh_index(&self, index: &str) -> Result<()> {
        let path = format!("{}/_refresh", index);
        let resp = self.http.post(self.url(&path)).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Self::handle_status(status, &body)
    }

    async fn get_mapping(&self, index: &str, doc_type: &str) -> Result<Option<MappingDefinition>> {
        let path = format!("{}/_mapping/{}", index, doc_type);
        let resp = self.http.get(self.url(&path)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: Value = resp.json().await?;
        Ok(Some(value))
    }

    async fn get_document(&self, index: &str, doc_type: &str, id: &str) -> Result<Option<Document>> {
        let path = format!("{}/{}/{}", index, doc_type, id);
        let resp = self.http.get(self.url(&path)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: Value = resp.json().await?;
        let source = value.get("_source").cloned().unwrap_or(Value::Null);
        let doc: Document = mongodb::bson::to_document(&source)?;
        Ok(Some(doc))
    }

    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<BulkResponse> {
        if actions.is_empty() {
            return Ok(BulkResponse::default());
        }

        let mut body = String::new();
        for action in &actions {
            match action {
                BulkAction::Index {
                    index,
                    doc_type,
                    id,
                    parent,
                    routing,
                    body: doc,
                } => {
                    let mut meta = json!({ "_index": index, "_type": doc_type });
                    if let Some(id) = id {
                        meta["_id"] = json!(id);
                    }
                    if let Some(parent) = parent {
                        meta["_parent"] = json!(parent);
                    }
                    if let Some(routing) = routing {
                        meta["_routing"] = json!(routing);
                    }
                    body.push_str(&json!({ "index": meta }).to_string());
                    body.push('\n');
                    let doc_value: Value = mongodb::bson::to_bson(doc)?
                        .into_relaxed_extjson();
                    body.push_str(&doc_value.to_string());
                    body.push('\n');
                }
                BulkAction::Delete {
                    index,
                    doc_type,
                    id,
                    parent,
                    routing,
                } => {
                    let mut meta = json!({ "_index": index, "_type": doc_type, "_id": id });
                    if let Some(parent) = parent {
                        meta["_parent"] = json!(parent);
                    }
                    if let Some(routing) = routing {
                        meta["_routing"] = json!(routing);
                    }
                    body.push_str(&json!({ "delete": meta }).to_string());
                    body.push('\n');
                }
            }
        }

        let resp = self
            .http
            .post(self.url("_bulk"))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RiverError::BulkTransportFailed(format!("{}: {}", status, text)));
        }

        let parsed: Value = resp.json().await?;
        let raw_items = parsed
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut items = Vec::with_capacity(raw_items.len());
        for (action, raw) in actions.iter().zip(raw_items.iter()) {
            let inner = raw.values().next().cloned().unwrap_or(Value::Null);
            let error = inner
                .get("error")
                .map(|e| e.to_string())
                .or_else(|| {
                    inner
                        .get("status")
                        .and_then(Value::as_u64)
                        .filter(|status| *status >= 300)
                        .map(|status| format!("status {}", status))
                });

            if let Some(reason) = &error {
                warn!(id = ?action.id(), reason, "bulk item failed");
            }

            items.push(BulkItemResult {
                id: action.id().map(str::to_string),
                error,
            });
        }

        Ok(BulkResponse { items })
    }
}
