//! The Supervisor: a long-lived monitor loop that starts and stops the
//! worker set in response to an external enable flag, owning every handle
//! the slurpers and indexer need so neither holds a back-reference to this
//! type; handles flow downward only, which keeps start/close idempotent and
//! avoids a shutdown ordering cycle between the three worker kinds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::RiverConfig;
use crate::error::Result;
use crate::indexer::Indexer;
use crate::mapping::ensure_target_ready;
use crate::queue::{event_queue, EventQueueSender};
use crate::sink::SinkClient;
use crate::slurper::Slurper;
use crate::source::{SourceClient, Topology};
use crate::transform::Transformer;

/// How often the monitor loop re-reads the enable flag (§4.5).
const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Worker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns the full worker set for one river and starts/stops it in response to
/// the sink's enable flag. The only component that spawns slurpers and the
/// indexer; everything downstream receives its handles by reference, never
/// the other way around.
pub struct Supervisor {
    config: Arc<RiverConfig>,
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn SinkClient>,
    checkpoints: Arc<CheckpointStore>,
    transformer: Arc<dyn Transformer>,
    active: AtomicBool,
    workers: Mutex<Vec<Worker>>,
}

impl Supervisor {
    /// Build a supervisor for one river. `sink` is also used to construct the
    /// `CheckpointStore` (the checkpoint lives in the sink, per §6).
    pub fn new(
        config: Arc<RiverConfig>,
        source: Arc<dyn SourceClient>,
        sink: Arc<dyn SinkClient>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        let checkpoints = Arc::new(CheckpointStore::new(sink.clone(), "_river", config.river_name.clone()));

        Supervisor {
            config,
            source,
            sink,
            checkpoints,
            transformer,
            active: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Whether the worker set is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the ~1s-period monitor loop until `shutdown` fires (§4.5), then
    /// close the worker set before returning.
    #[instrument(skip_all, fields(river = %self.config.river_name))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("supervisor monitor loop starting");

        while !shutdown.is_cancelled() {
            match self.checkpoints.enabled(&self.config.river_name).await {
                Ok(enabled) => {
                    if enabled && !self.is_active() {
                        if let Err(e) = self.start().await {
                            warn!(error = %e, "failed to start river, will retry next poll");
                        }
                    } else if !enabled && self.is_active() {
                        self.close().await;
                    }
                }
                Err(e) => warn!(error = %e, "failed to read enable flag, leaving worker set unchanged"),
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.close().await;
        info!("supervisor monitor loop stopped");
    }

    /// Idempotent: if already active, does nothing. Otherwise prepares the
    /// target index/mapping, discovers topology, and spawns one slurper per
    /// shard (or one for a replica set) plus one indexer.
    pub async fn start(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = ensure_target_ready(self.sink.as_ref(), &self.config.target_index, &self.config.target_type, self.config.is_gridfs).await {
            self.active.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let topology = match self.source.topology().await {
            Ok(topology) => topology,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (queue_tx, queue_rx) = event_queue(self.config.throttle_size);

        let mut workers = Vec::new();
        match self.spawn_slurpers(topology, &queue_tx, &mut workers).await {
            Ok(()) => {}
            Err(e) => {
                for worker in workers {
                    worker.cancel.cancel();
                }
                self.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        let indexer_cancel = CancellationToken::new();
        let mut indexer = Indexer::new(
            self.config.clone(),
            self.sink.clone(),
            queue_rx,
            self.checkpoints.clone(),
            self.transformer.clone(),
            indexer_cancel.clone(),
        );
        let handle = tokio::spawn(async move { indexer.run().await });
        workers.push(Worker { handle, cancel: indexer_cancel });

        *self.workers.lock().await = workers;
        info!(shard_count = self.shard_count(&topology), "river started");

        Ok(())
    }

    async fn spawn_slurpers(&self, topology: Topology, queue_tx: &EventQueueSender, workers: &mut Vec<Worker>) -> Result<()> {
        match topology {
            Topology::ReplicaSet => {
                let cancel = CancellationToken::new();
                let slurper = Arc::new(Slurper::new(
                    self.config.clone(),
                    self.source.clone(),
                    self.checkpoints.clone(),
                    queue_tx.clone(),
                    cancel.clone(),
                    None,
                ));
                let handle = tokio::spawn(async move { slurper.run().await });
                workers.push(Worker { handle, cancel });
            }
            Topology::Sharded { shards } => {
                for (shard_name, connection_string) in shards {
                    let shard_source = self.source.connect_shard(&connection_string).await?;
                    let cancel = CancellationToken::new();
                    let slurper = Arc::new(Slurper::new(
                        self.config.clone(),
                        shard_source,
                        self.checkpoints.clone(),
                        queue_tx.clone(),
                        cancel.clone(),
                        Some(shard_name),
                    ));
                    let handle = tokio::spawn(async move { slurper.run().await });
                    workers.push(Worker { handle, cancel });
                }
            }
        }

        Ok(())
    }

    fn shard_count(&self, topology: &Topology) -> usize {
        match topology {
            Topology::ReplicaSet => 1,
            Topology::Sharded { shards } => shards.len(),
        }
    }

    /// Idempotent: interrupts every slurper and the indexer, waits for them
    /// to exit, and clears the worker registry.
    pub async fn close(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "worker task panicked during shutdown");
            }
        }

        info!("river closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiverConfigBuilder;
    use crate::transform::NoopTransformer;
    use mongodb::bson::doc;
    use std::time::Duration as StdDuration;

    use crate::testsupport::{FakeSinkClient, FakeSourceClient};

    fn test_config() -> Arc<RiverConfig> {
        Arc::new(
            RiverConfigBuilder::new()
                .river_name("my_river")
                .source("mongodb://localhost", "db", "coll")
                .target("my_index", "my_type")
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let config = test_config();
        let source: Arc<dyn SourceClient> = Arc::new(FakeSourceClient::new());
        let sink: Arc<dyn SinkClient> = Arc::new(FakeSinkClient::new());
        let supervisor = Supervisor::new(config, source, sink, Arc::new(NoopTransformer));

        supervisor.start().await.unwrap();
        assert!(supervisor.is_active());
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.workers.lock().await.len(), 2);

        supervisor.close().await;
    }

    #[tokio::test]
    async fn close_before_start_is_a_noop() {
        let config = test_config();
        let source: Arc<dyn SourceClient> = Arc::new(FakeSourceClient::new());
        let sink: Arc<dyn SinkClient> = Arc::new(FakeSinkClient::new());
        let supervisor = Supervisor::new(config, source, sink, Arc::new(NoopTransformer));

        supervisor.close().await;
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn run_starts_on_enabled_flag_and_stops_on_shutdown() {
        let config = test_config();
        let source: Arc<dyn SourceClient> = Arc::new(FakeSourceClient::new());
        let fake_sink = Arc::new(FakeSinkClient::new());
        fake_sink
            .seed_document("_river", "my_river", "my_river", doc! { "enabled": true })
            .await;
        let sink: Arc<dyn SinkClient> = fake_sink;

        let supervisor = Supervisor::new(config, source, sink, Arc::new(NoopTransformer));
        let shutdown = CancellationToken::new();

        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            shutdown_clone.cancel();
        });

        supervisor.run(shutdown).await;
        handle.await.unwrap();
    }
}
