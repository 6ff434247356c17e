//! The River Definition (§3): an immutable snapshot of a river's
//! configuration, built once via `RiverConfigBuilder`'s builder pattern
//! and never mutated afterwards.

use mongodb::bson::Document;
use serde::Deserialize;

use crate::error::{Result, RiverError};
use crate::queue::ThrottleSize;
use crate::timestamp::OplogTimestamp;

/// A plain, `serde`-deserializable view of a river's configuration as it
/// would arrive from a TOML file or environment layer. Parsing that source
/// document is out of scope for this crate (per spec.md §1); a host
/// application deserializes one of these and hands it to
/// `RiverConfigBuilder::from_source`.
#[derive(Clone, Debug, Deserialize)]
pub struct RiverConfigSource {
    pub river_name: String,
    pub source_uri: String,
    pub source_db: String,
    pub source_collection: String,
    pub target_index: String,
    pub target_type: String,
    #[serde(default)]
    pub is_gridfs: bool,
    #[serde(default = "default_throttle_size")]
    pub throttle_size: i64,
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_bulk_timeout_ms")]
    pub bulk_timeout_ms: u64,
    #[serde(default)]
    pub filter: Option<Document>,
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    #[serde(default)]
    pub include_collection_field: Option<String>,
    #[serde(default)]
    pub drop_collection: bool,
    #[serde(default)]
    pub initial_timestamp: Option<(u32, u32)>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_throttle_size() -> i64 {
    -1
}

fn default_bulk_size() -> usize {
    500
}

fn default_bulk_timeout_ms() -> u64 {
    500
}

/// The immutable River Definition used by the supervisor, slurpers and
/// indexer. Built once via `RiverConfigBuilder`; `Clone` but offers no
/// setters, since a river's definition is created once and never mutated.
#[derive(Clone, Debug)]
pub struct RiverConfig {
    pub river_name: String,
    pub source_uri: String,
    pub source_namespace: String,
    pub target_index: String,
    pub target_type: String,
    pub is_gridfs: bool,
    pub throttle_size: ThrottleSize,
    pub bulk_size: usize,
    pub bulk_timeout: std::time::Duration,
    pub filter: Option<Document>,
    pub exclude_fields: Vec<String>,
    pub include_collection_field: Option<String>,
    pub drop_collection: bool,
    pub initial_timestamp: Option<OplogTimestamp>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RiverConfig {
    /// The fully-qualified `db.collection` namespace this river tails.
    pub fn namespace(&self) -> &str {
        &self.source_namespace
    }

    /// The GridFS `.files` namespace for this river, if it is a GridFS
    /// river.
    pub fn gridfs_files_namespace(&self) -> Option<String> {
        if self.is_gridfs {
            Some(format!("{}.files", self.source_namespace))
        } else {
            None
        }
    }

    /// The database half of `source_namespace`, used to address `$cmd`.
    pub fn source_db(&self) -> &str {
        self.source_namespace
            .split('.')
            .next()
            .unwrap_or(&self.source_namespace)
    }

    /// The collection half of `source_namespace`, used for the
    /// include-collection-field injection and drop-command matching.
    pub fn source_collection_name(&self) -> &str {
        self.source_namespace
            .splitn(2, '.')
            .nth(1)
            .unwrap_or(&self.source_namespace)
    }
}

/// Builds a `RiverConfig`, mirroring `oplog::OplogBuilder`'s construction
/// pattern: configure optional fields via chained setters, then `build()`
/// to validate and freeze the result.
#[derive(Clone, Default)]
pub struct RiverConfigBuilder {
    river_name: Option<String>,
    source_uri: Option<String>,
    source_db: Option<String>,
    source_collection: Option<String>,
    target_index: Option<String>,
    target_type: Option<String>,
    is_gridfs: bool,
    throttle_size: i64,
    bulk_size: usize,
    bulk_timeout_ms: u64,
    filter: Option<Document>,
    exclude_fields: Vec<String>,
    include_collection_field: Option<String>,
    drop_collection: bool,
    initial_timestamp: Option<(u32, u32)>,
    username: Option<String>,
    password: Option<String>,
}

impl RiverConfigBuilder {
    /// Start a builder with the documented defaults (unbounded queue,
    /// 500-document/500ms bulk batching).
    pub fn new() -> Self {
        RiverConfigBuilder {
            throttle_size: default_throttle_size(),
            bulk_size: default_bulk_size(),
            bulk_timeout_ms: default_bulk_timeout_ms(),
            ..Default::default()
        }
    }

    /// Populate the builder from a deserialized `RiverConfigSource`.
    pub fn from_source(source: RiverConfigSource) -> Self {
        RiverConfigBuilder {
            river_name: Some(source.river_name),
            source_uri: Some(source.source_uri),
            source_db: Some(source.source_db),
            source_collection: Some(source.source_collection),
            target_index: Some(source.target_index),
            target_type: Some(source.target_type),
            is_gridfs: source.is_gridfs,
            throttle_size: source.throttle_size,
            bulk_size: source.bulk_size,
            bulk_timeout_ms: source.bulk_timeout_ms,
            filter: source.filter,
            exclude_fields: source.exclude_fields,
            include_collection_field: source.include_collection_field,
            drop_collection: source.drop_collection,
            initial_timestamp: source.initial_timestamp,
            username: source.username,
            password: source.password,
        }
    }

    pub fn river_name(mut self, name: impl Into<String>) -> Self {
        self.river_name = Some(name.into());
        self
    }

    pub fn source(mut self, uri: impl Into<String>, db: impl Into<String>, collection: impl Into<String>) -> Self {
        self.source_uri = Some(uri.into());
        self.source_db = Some(db.into());
        self.source_collection = Some(collection.into());
        self
    }

    pub fn target(mut self, index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        self.target_index = Some(index.into());
        self.target_type = Some(doc_type.into());
        self
    }

    pub fn gridfs(mut self, is_gridfs: bool) -> Self {
        self.is_gridfs = is_gridfs;
        self
    }

    pub fn throttle_size(mut self, throttle_size: i64) -> Self {
        self.throttle_size = throttle_size;
        self
    }

    pub fn bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size;
        self
    }

    pub fn bulk_timeout_ms(mut self, ms: u64) -> Self {
        self.bulk_timeout_ms = ms;
        self
    }

    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn exclude_fields(mut self, fields: Vec<String>) -> Self {
        self.exclude_fields = fields;
        self
    }

    pub fn include_collection_field(mut self, field: impl Into<String>) -> Self {
        self.include_collection_field = Some(field.into());
        self
    }

    pub fn drop_collection(mut self, drop_collection: bool) -> Self {
        self.drop_collection = drop_collection;
        self
    }

    pub fn initial_timestamp(mut self, seconds: u32, ordinal: u32) -> Self {
        self.initial_timestamp = Some((seconds, ordinal));
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Validate the builder and produce the immutable `RiverConfig`.
    pub fn build(self) -> Result<RiverConfig> {
        let river_name = self
            .river_name
            .ok_or_else(|| RiverError::Configuration("river_name is required".into()))?;
        let source_uri = self
            .source_uri
            .ok_or_else(|| RiverError::Configuration("source_uri is required".into()))?;
        let source_db = self
            .source_db
            .ok_or_else(|| RiverError::Configuration("source_db is required".into()))?;
        let source_collection = self
            .source_collection
            .ok_or_else(|| RiverError::Configuration("source_collection is required".into()))?;
        let target_index = self
            .target_index
            .ok_or_else(|| RiverError::Configuration("target_index is required".into()))?;
        let target_type = self
            .target_type
            .ok_or_else(|| RiverError::Configuration("target_type is required".into()))?;

        let throttle_size = ThrottleSize::from_config(self.throttle_size)?;

        if self.bulk_size == 0 {
            return Err(RiverError::Configuration("bulk_size must be >= 1".into()));
        }

        Ok(RiverConfig {
            river_name,
            source_uri,
            source_namespace: format!("{}.{}", source_db, source_collection),
            target_index,
            target_type,
            is_gridfs: self.is_gridfs,
            throttle_size,
            bulk_size: self.bulk_size,
            bulk_timeout: std::time::Duration::from_millis(self.bulk_timeout_ms),
            filter: self.filter,
            exclude_fields: self.exclude_fields,
            include_collection_field: self.include_collection_field,
            drop_collection: self.drop_collection,
            initial_timestamp: self.initial_timestamp.map(|(s, o)| OplogTimestamp::new(s, o)),
            username: self.username,
            password: self.password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_required_fields_and_defaults() {
        let config = RiverConfigBuilder::new()
            .river_name("my_river")
            .source("mongodb://localhost", "db", "coll")
            .target("my_index", "my_type")
            .build()
            .unwrap();

        assert_eq!(config.namespace(), "db.coll");
        assert_eq!(config.throttle_size, ThrottleSize::Unbounded);
        assert_eq!(config.bulk_size, 500);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let result = RiverConfigBuilder::new().river_name("my_river").build();
        assert!(matches!(result, Err(RiverError::Configuration(_))));
    }

    #[test]
    fn rejects_invalid_throttle_size() {
        let result = RiverConfigBuilder::new()
            .river_name("my_river")
            .source("mongodb://localhost", "db", "coll")
            .target("my_index", "my_type")
            .throttle_size(0)
            .build();

        assert!(matches!(result, Err(RiverError::Configuration(_))));
    }

    #[test]
    fn gridfs_files_namespace_only_set_when_configured() {
        let config = RiverConfigBuilder::new()
            .river_name("my_river")
            .source("mongodb://localhost", "db", "fs")
            .target("my_index", "my_type")
            .gridfs(true)
            .build()
            .unwrap();

        assert_eq!(config.gridfs_files_namespace(), Some("db.fs.files".to_string()));
    }
}
