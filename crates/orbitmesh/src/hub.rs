// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event broadcaster: per-topic fan-out with bounded subscriber queues.
//!
//! Each subscriber gets its own bounded queue. Publishing never blocks: a
//! queue with no room gets its subscriber dropped on the spot, and the
//! client's next connect re-syncs through the snapshot provider. That is
//! the whole backpressure contract.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::wire::{Envelope, EnvelopeType, Topic, ENVELOPE_VERSION};

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Interval between `heartbeat` envelopes on `sessions.state`.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct Subscriber {
    topics: HashSet<String>,
    queue: mpsc::Sender<Envelope>,
}

/// Handle returned by [`Hub::subscribe`].
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Envelope>,
}

/// The process-wide event hub.
pub struct Hub {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    seq: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for `topics` with a queue of `capacity`.
    pub async fn subscribe(&self, topics: &[Topic], capacity: usize) -> Subscription {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let topics = topics.iter().map(Topic::name).collect();

        self.subscribers.write().await.insert(id, Subscriber { topics, queue });
        Subscription { id, receiver }
    }

    /// Add topics to an existing subscriber. Idempotent; unknown subscriber
    /// ids are ignored.
    pub async fn add_topics(&self, id: u64, topics: &[Topic]) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subscriber) = subscribers.get_mut(&id) {
            subscriber.topics.extend(topics.iter().map(Topic::name));
        }
    }

    /// Remove a subscriber. Idempotent: returns whether it was registered.
    pub async fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.write().await.remove(&id).is_some()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Next envelope sequence number (strictly monotone per hub).
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Sequence number of the most recently published envelope.
    ///
    /// The snapshot provider stamps this onto initial-state responses so
    /// clients can dedupe history against the live stream.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Publish `payload` on `topic`, fanning out to every subscriber.
    ///
    /// Sends are non-blocking. A subscriber whose queue is full (or whose
    /// receiver is gone) is unregistered immediately and receives nothing
    /// further. Returns the published envelope.
    pub async fn publish(
        &self,
        topic: &Topic,
        kind: EnvelopeType,
        payload: serde_json::Value,
    ) -> Envelope {
        let topic_name = topic.name();
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            kind,
            topic: topic_name.clone(),
            seq: self.next_seq(),
            ts: crate::session::now_ms(),
            payload,
        };

        // Snapshot matching queues under the read lock, send outside it.
        let targets: Vec<(u64, mpsc::Sender<Envelope>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|(_, s)| s.topics.contains(&topic_name))
                .map(|(id, s)| (*id, s.queue.clone()))
                .collect()
        };

        let mut dropped: Vec<u64> = Vec::new();
        for (id, queue) in targets {
            if queue.try_send(envelope.clone()).is_err() {
                dropped.push(id);
            }
        }

        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dropped {
                if subscribers.remove(&id).is_some() {
                    debug!(subscriber = id, topic = %topic_name, "dropped slow subscriber");
                }
            }
        }

        envelope
    }

    /// Publish `heartbeat` envelopes on `sessions.state` until shutdown, so
    /// dashboards can detect a stalled control plane.
    pub async fn run_heartbeat(self: Arc<Self>, shutdown: CancellationToken) {
        info!("hub heartbeat started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                _ = shutdown.cancelled() => {
                    debug!("hub heartbeat shutting down");
                    return;
                }
            }
            self.publish(&Topic::SessionsState, EnvelopeType::Heartbeat, serde_json::json!({}))
                .await;
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
