//! Shared processing path: decoded payload → store → broadcast.
//!
//! Both transport listeners feed [`Inbound`] messages into one bounded
//! ingest queue; a single orchestrator task drains it, so the
//! decode → validate → classify → update → broadcast sequence is
//! serialized per message. Listener tasks never touch the store or the
//! connection set directly.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::decode::{self, WirePayload};
use crate::fanout::ConnectionManager;
use crate::store::ShotStore;

/// A decoded wire payload on its way to the orchestrator.
#[derive(Debug)]
pub struct Inbound {
    pub payload: WirePayload,
    /// Source camera name for multi-source deployments; `None` on the
    /// broker transport.
    pub source: Option<String>,
}

/// Sending half of the ingest queue, handed to each transport listener.
pub type IngestSender = mpsc::Sender<Inbound>;

/// Create the bounded listener → orchestrator hand-off queue.
///
/// `capacity` bounds how far ingestion may run ahead of processing (the
/// pipeline's high-water mark); listeners block on a full queue rather
/// than dropping.
pub fn ingest_channel(capacity: usize) -> (IngestSender, mpsc::Receiver<Inbound>) {
    mpsc::channel(capacity)
}

/// The orchestrator shared by both transport listeners.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<ShotStore>,
    connections: Arc<ConnectionManager>,
}

impl Pipeline {
    pub fn new(store: Arc<ShotStore>, connections: Arc<ConnectionManager>) -> Self {
        Self { store, connections }
    }

    /// Run one message through the full sequence. Per-message failures are
    /// logged and dropped; this never propagates an error.
    pub async fn process_and_broadcast(&self, inbound: Inbound) {
        let decoded = match &inbound.payload {
            WirePayload::Array(fields) => decode::decode_array(fields),
            WirePayload::Map(entries) => decode::decode_map(entries, &self.store.get()),
        };
        let mut record = match decoded {
            Ok(record) => record,
            Err(e) => {
                error!(error = %e, source = ?inbound.source, "invalid data format");
                return;
            }
        };

        if !decode::validate(&record) {
            warn!("shot data failed range validation, applying anyway");
        }

        if record.result.is_status() {
            // Status update: keep the prior physical measurements.
            record = self.store.get().with_status(&record);
        }
        if inbound.source.is_some() {
            record.camera_source = inbound.source;
        }

        let stored = self.store.update(record);
        self.connections.broadcast(&stored).await;

        if stored.result.is_status() {
            info!(
                result = %stored.result,
                message = %stored.message,
                source = stored.camera_source.as_deref().unwrap_or("-"),
                "processed status update"
            );
        } else {
            info!(
                speed_mph = stored.speed,
                launch = stored.launch_angle,
                side = stored.side_angle,
                source = stored.camera_source.as_deref().unwrap_or("-"),
                "processed shot"
            );
        }
    }

    /// Spawn the orchestrator task draining the ingest queue. The task
    /// exits when every [`IngestSender`] has been dropped.
    pub fn spawn(self, mut rx: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                self.process_and_broadcast(inbound).await;
            }
        })
    }

    pub fn store(&self) -> &Arc<ShotStore> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
