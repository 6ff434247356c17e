#![warn(missing_docs)]

//! A change-data-capture pipeline that tails a MongoDB oplog (including
//! GridFS binary files) and replicates it into an Elasticsearch index in
//! near-real-time.
//!
//! The pipeline has three moving parts: a [`slurper::Slurper`] tails the
//! oplog and produces normalized [`event::ChangeEvent`]s onto a
//! [`queue::EventQueueSender`]; an [`indexer::Indexer`] drains that queue in
//! batches, applies an optional [`transform::Transformer`], and writes
//! Elasticsearch bulk actions through a [`sink::SinkClient`]; a
//! [`supervisor::Supervisor`] starts and stops both in response to an
//! external enable flag.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use riverdb::config::RiverConfigBuilder;
//! use riverdb::sink::elasticsearch::HttpSinkClient;
//! use riverdb::source::mongo::MongoSourceClient;
//! use riverdb::supervisor::Supervisor;
//! use riverdb::transform::NoopTransformer;
//!
//! # async fn run() -> riverdb::Result<()> {
//! let config = Arc::new(
//!     RiverConfigBuilder::new()
//!         .river_name("my_river")
//!         .source("mongodb://localhost", "mydb", "mycollection")
//!         .target("my_index", "my_type")
//!         .build()?,
//! );
//!
//! let source = Arc::new(MongoSourceClient::connect(&config.source_uri).await?);
//! let sink = Arc::new(HttpSinkClient::new("http://localhost:9200")?);
//!
//! let supervisor = Supervisor::new(config, source, sink, Arc::new(NoopTransformer));
//! supervisor.start().await?;
//! # Ok(())
//! # }
//! ```

pub use mongodb;
pub use mongodb::bson;

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod indexer;
pub mod mapping;
pub mod queue;
pub mod sink;
pub mod slurper;
pub mod source;
pub mod supervisor;
pub mod testsupport;
pub mod timestamp;
pub mod transform;

pub use error::{Result, RiverError};
