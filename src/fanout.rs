//! Observer connection set and broadcast fan-out.
//!
//! Broadcast is the sole path by which downstream consumers learn of
//! state changes; there is no polling alternative. One bad observer must
//! never abort delivery to the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::ShotRecord;

/// Accept-time handle identifying one observer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Set of live observer channels.
///
/// `get`/`add`/`remove`/`broadcast` are all safe under concurrent callers.
/// The set lock is only held to snapshot or mutate membership — never
/// across a channel write.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<ObserverId, mpsc::Sender<Arc<ShotRecord>>>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new observer with a bounded delivery queue, returning its
    /// handle and the receiving end.
    pub fn subscribe(&self, capacity: usize) -> (ObserverId, mpsc::Receiver<Arc<ShotRecord>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (self.add(tx), rx)
    }

    /// Register an externally created channel.
    pub fn add(&self, sender: mpsc::Sender<Arc<ShotRecord>>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut connections = self.connections.lock().unwrap();
        connections.insert(id, sender);
        debug!(total = connections.len(), "observer connected");
        id
    }

    /// Deregister an observer. Unknown ids are a no-op.
    pub fn remove(&self, id: ObserverId) {
        let mut connections = self.connections.lock().unwrap();
        if connections.remove(&id).is_some() {
            debug!(total = connections.len(), "observer disconnected");
        }
    }

    /// Deliver `record` to every registered observer.
    ///
    /// Delivery never blocks: an observer that hung up or let its queue
    /// fill is removed, and the rest still receive the record. Never
    /// returns an error to the caller.
    pub async fn broadcast(&self, record: &Arc<ShotRecord>) {
        let connections: Vec<(ObserverId, mpsc::Sender<Arc<ShotRecord>>)> = {
            let guard = self.connections.lock().unwrap();
            guard.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut dropped = Vec::new();
        for (id, tx) in connections {
            match tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(?id, "observer queue full, removing slow observer");
                    dropped.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(?id, "failed to deliver to observer, removing");
                    dropped.push(id);
                }
            }
        }
        for id in dropped {
            self.remove(id);
        }
    }

    /// Number of currently registered observers.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
