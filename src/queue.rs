//! The handoff between slurpers (producers) and the indexer (consumer).
//!
//! Selected by `throttle_size` (see `RiverConfig`): `-1` yields an unbounded
//! FIFO where `put` never blocks; any positive value yields a bounded FIFO
//! of that capacity where `put` blocks (and is cancellation-observing) once
//! full.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::event::ChangeEvent;
use crate::error::{Result, RiverError};

/// Throttle size selecting a bounded or unbounded queue, mirroring the
/// river definition's `throttleSize` setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleSize {
    /// No bound: producers never block on enqueue. An opt-in hazard — see
    /// DESIGN.md.
    Unbounded,
    /// A bounded FIFO of the given capacity.
    Bounded(usize),
}

impl ThrottleSize {
    /// Interpret the river definition's `throttleSize` integer (`-1` means
    /// unbounded, any other value must be `>= 1`).
    pub fn from_config(throttle_size: i64) -> Result<Self> {
        match throttle_size {
            -1 => Ok(ThrottleSize::Unbounded),
            n if n >= 1 => Ok(ThrottleSize::Bounded(n as usize)),
            n => Err(RiverError::Configuration(format!(
                "throttleSize must be -1 or >= 1, got {}",
                n
            ))),
        }
    }
}

/// Build a new queue sized by `throttle_size`, returning a cloneable sender
/// (one per slurper) and the single receiver owned by the indexer.
///
/// `tokio::sync::mpsc` backs both configurations: the "unbounded" queue uses
/// `mpsc::unbounded_channel` wrapped behind the same sender/receiver
/// interface so callers never branch on which mode is active.
pub fn event_queue(throttle_size: ThrottleSize) -> (EventQueueSender, EventQueueReceiver) {
    match throttle_size {
        ThrottleSize::Bounded(capacity) => {
            let (tx, rx) = mpsc::channel(capacity);
            (EventQueueSender::Bounded(tx), EventQueueReceiver::Bounded(rx))
        }
        ThrottleSize::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                EventQueueSender::Unbounded(tx),
                EventQueueReceiver::Unbounded(rx),
            )
        }
    }
}

/// Producer handle, held by each slurper. `put` blocks on a bounded queue
/// once full and observes a `CancellationToken` so a slurper shutdown is
/// never stuck waiting on a full queue forever.
#[derive(Clone)]
pub enum EventQueueSender {
    Bounded(mpsc::Sender<ChangeEvent>),
    Unbounded(mpsc::UnboundedSender<ChangeEvent>),
}

impl EventQueueSender {
    /// Enqueue an event, blocking if the queue is bounded and full. Returns
    /// `Err(RiverError::Interrupted)` if `cancel` fires first.
    pub async fn put(&self, event: ChangeEvent, cancel: &CancellationToken) -> Result<()> {
        match self {
            EventQueueSender::Bounded(tx) => tokio::select! {
                res = tx.send(event) => res.map_err(|_| RiverError::Interrupted),
                _ = cancel.cancelled() => Err(RiverError::Interrupted),
            },
            EventQueueSender::Unbounded(tx) => {
                if cancel.is_cancelled() {
                    return Err(RiverError::Interrupted);
                }
                tx.send(event).map_err(|_| RiverError::Interrupted)
            }
        }
    }
}

/// Consumer handle, held by the indexer.
pub enum EventQueueReceiver {
    Bounded(mpsc::Receiver<ChangeEvent>),
    Unbounded(mpsc::UnboundedReceiver<ChangeEvent>),
}

impl EventQueueReceiver {
    /// Block until the first event of a new batch arrives, or until
    /// `cancel` fires.
    pub async fn take(&mut self, cancel: &CancellationToken) -> Option<ChangeEvent> {
        match self {
            EventQueueReceiver::Bounded(rx) => tokio::select! {
                event = rx.recv() => event,
                _ = cancel.cancelled() => None,
            },
            EventQueueReceiver::Unbounded(rx) => tokio::select! {
                event = rx.recv() => event,
                _ = cancel.cancelled() => None,
            },
        }
    }

    /// Poll for the next event with a bound on how long to wait, used while
    /// accumulating a batch. Returns `None` both on timeout and on channel
    /// closure/cancellation; callers distinguish "batch is just quiet" from
    /// "queue is gone" by checking `cancel` themselves if it matters.
    pub async fn poll(&mut self, wait: Duration, cancel: &CancellationToken) -> Option<ChangeEvent> {
        let recv = async {
            match self {
                EventQueueReceiver::Bounded(rx) => rx.recv().await,
                EventQueueReceiver::Unbounded(rx) => rx.recv().await,
            }
        };

        tokio::select! {
            res = timeout(wait, recv) => res.ok().flatten(),
            _ = cancel.cancelled() => None,
        }
    }
}
