//! Fan-out of relay messages to connected UI clients
//!
//! Membership changes (connect/disconnect) may interleave with sends; every
//! send iterates over a snapshot of the current senders.
//!
//! Messages belonging to a run are tagged with that run's generation. Once a
//! newer run has been announced via [`Broadcaster::advance`], messages tagged
//! with an older generation are dropped.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use testscope_common::RelayMessage;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Outbound queue of one client; frames are pre-serialised JSON.
pub type ClientSender = mpsc::UnboundedSender<String>;

#[derive(Debug, Default)]
struct Shared {
    clients: DashMap<u64, ClientSender>,
    next_client: AtomicU64,
    generation: RwLock<u64>,
}

/// Connected-client registry
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; returns its id and the receiving end of its queue.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.clients.insert(id, tx);
        debug!("Client {} connected ({} total)", id, self.client_count());
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        if self.shared.clients.remove(&id).is_some() {
            debug!("Client {} disconnected ({} total)", id, self.client_count());
        }
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Generation of the current run
    pub fn generation(&self) -> u64 {
        *self.shared.generation.read()
    }

    /// Announce a new run. Messages of earlier runs are dropped from now on.
    pub fn advance(&self) -> u64 {
        let mut generation = self.shared.generation.write();
        *generation += 1;
        *generation
    }

    /// Send a message that is not tied to any run.
    pub fn broadcast(&self, message: &RelayMessage) -> usize {
        match serde_json::to_string(message) {
            Ok(frame) => self.fan_out(frame),
            Err(e) => {
                warn!("Failed to serialise {} message: {}", message.kind(), e);
                0
            }
        }
    }

    /// Send a message on behalf of run `generation`.
    ///
    /// Returns `None` when the run has been superseded, otherwise the number
    /// of clients the frame was queued for.
    pub fn send_scoped(&self, generation: u64, message: &RelayMessage) -> Option<usize> {
        // Held across the enqueue so `advance` cannot slip in between.
        let current = self.shared.generation.read();
        if *current != generation {
            trace!(
                "Dropping {} from superseded run {} (current {})",
                message.kind(),
                generation,
                *current
            );
            return None;
        }
        Some(self.broadcast(message))
    }

    fn fan_out(&self, frame: String) -> usize {
        let snapshot: Vec<(u64, ClientSender)> = self
            .shared
            .clients
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in snapshot {
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                self.unregister(id);
            }
        }
        delivered
    }

    /// Handle for one run's messages
    pub fn sink(&self, generation: u64) -> RunSink {
        RunSink {
            broadcaster: self.clone(),
            generation,
        }
    }
}

/// Broadcaster bound to one run generation
#[derive(Debug, Clone)]
pub struct RunSink {
    broadcaster: Broadcaster,
    generation: u64,
}

impl RunSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Relay `message` unless the run has been superseded.
    pub fn send(&self, message: RelayMessage) -> bool {
        self.broadcaster
            .send_scoped(self.generation, &message)
            .is_some()
    }

    pub fn is_current(&self) -> bool {
        self.broadcaster.generation() == self.generation
    }
}
