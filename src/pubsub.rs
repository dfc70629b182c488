//! Pub/sub transport listener: per-camera ZeroMQ SUB sockets.
//!
//! One independent subscriber loop per source. Each loop filters by
//! topic prefix, classifies the message type, suppresses self-echo and
//! image frames, and hands decoded results payloads to the orchestrator
//! through the ingest queue. A dead socket drives reconnect with
//! exponential backoff; exceeding the attempt budget retires that source
//! without affecting its siblings.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Map;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket, ZmqMessage};

use crate::config::Settings;
use crate::decode;
use crate::error::DecodeError;
use crate::pipeline::{Inbound, IngestSender};

/// Default ports for the fixed local topologies.
const CAMERA1_PORT: u16 = 5556;
const CAMERA2_PORT: u16 = 5557;

/// Configuration keys for distributed-host endpoints.
const CAMERA1_HOST_KEY: &str = "ipc_interface.camera1_host";
const CAMERA2_HOST_KEY: &str = "ipc_interface.camera2_host";

/// Message classification on the pub/sub bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Unknown,
    RequestForImage,
    Image,
    RequestForStill,
    Results,
    Shutdown,
    PreImage,
    Control,
}

impl MessageType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => MessageType::RequestForImage,
            2 => MessageType::Image,
            3 => MessageType::RequestForStill,
            4 => MessageType::Results,
            5 => MessageType::Shutdown,
            6 => MessageType::PreImage,
            7 => MessageType::Control,
            _ => MessageType::Unknown,
        }
    }
}

/// Classify a message from its `Message_Type` property, falling back to
/// substring matching on the topic name.
pub fn classify(topic: &str, properties: &Map<String, serde_json::Value>) -> MessageType {
    if let Some(value) = properties.get("Message_Type") {
        let code = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()));
        if let Some(code) = code {
            return MessageType::from_code(code);
        }
    }

    if topic.contains("Results") {
        MessageType::Results
    } else if topic.contains("Control") {
        MessageType::Control
    } else {
        MessageType::Unknown
    }
}

/// Endpoint topology, selected at construction.
#[derive(Debug, Clone)]
pub enum Topology {
    /// One local sensor process.
    Single { endpoint: String },
    /// Two cameras on this host, fixed ports.
    DualLocal,
    /// Two cameras on hosts resolved from the configuration lookup.
    DualRemote,
}

/// Pub/sub listener settings.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub topology: Topology,
    /// Subscription filter; only topics with this prefix are delivered.
    pub topic_prefix: String,
    /// Bound on each receive call; also bounds shutdown latency.
    pub receive_timeout: Duration,
    /// Binary payloads above this are image frames, rejected by length
    /// alone without inspecting content.
    pub max_binary_bytes: usize,
    /// This listener's identity for self-echo suppression.
    pub system_id: String,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Single {
                endpoint: format!("tcp://localhost:{CAMERA1_PORT}"),
            },
            topic_prefix: "Golf.Sim".into(),
            receive_timeout: Duration::from_secs(1),
            max_binary_bytes: 100_000,
            system_id: "shotrelay".into(),
            max_reconnect_attempts: 5,
            base_reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl PubSubConfig {
    fn mode(&self) -> &'static str {
        match self.topology {
            Topology::Single { .. } => "single",
            Topology::DualLocal => "dual",
            Topology::DualRemote => "dual_remote",
        }
    }
}

/// Per-source counters shared between the loop task and `get_stats`.
#[derive(Debug)]
struct SourceShared {
    name: String,
    endpoint: String,
    connected: AtomicBool,
    messages: AtomicU64,
    errors: AtomicU64,
}

impl SourceShared {
    fn new(name: String, endpoint: String) -> Self {
        Self {
            name,
            endpoint,
            connected: AtomicBool::new(false),
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

/// Point-in-time statistics for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub name: String,
    pub endpoint: String,
    pub connected: bool,
    pub messages_processed: u64,
    pub errors: u64,
}

/// Point-in-time statistics for the whole listener.
#[derive(Debug, Clone, Serialize)]
pub struct PubSubStats {
    pub mode: &'static str,
    pub running: bool,
    /// True while any source is connected.
    pub connected: bool,
    pub total_messages: u64,
    pub total_errors: u64,
    pub topic_prefix: String,
    pub sources: Vec<SourceStats>,
}

/// Listener over one or two camera pub/sub endpoints.
pub struct PubSubListener {
    config: PubSubConfig,
    endpoints: Vec<(String, String)>,
    tx: IngestSender,
    sources: Vec<Arc<SourceShared>>,
    running: bool,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PubSubListener {
    pub fn new(config: PubSubConfig, settings: &Settings, tx: IngestSender) -> Self {
        let endpoints = resolve_endpoints(&config.topology, settings);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            endpoints,
            tx,
            sources: Vec::new(),
            running: false,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Open a subscriber per source and spawn its loop.
    ///
    /// Partial failure is tolerated: returns true when at least one
    /// source connected. Calling while running is a no-op.
    pub async fn start(&mut self) -> bool {
        if self.running {
            warn!("pub/sub listener already running");
            return true;
        }
        self.running = true;
        let _ = self.shutdown.send(false);
        self.sources.clear();

        let mut started = 0usize;
        for (name, endpoint) in self.endpoints.clone() {
            let shared = Arc::new(SourceShared::new(name.clone(), endpoint.clone()));
            self.sources.push(shared.clone());

            info!(source = %name, %endpoint, "starting pub/sub subscriber");
            match open_subscriber(&endpoint, &self.config.topic_prefix).await {
                Ok(socket) => {
                    shared.connected.store(true, Ordering::Relaxed);
                    let worker = SourceWorker {
                        shared: shared.clone(),
                        config: self.config.clone(),
                        tx: self.tx.clone(),
                    };
                    let shutdown = self.shutdown.subscribe();
                    self.tasks.push(tokio::spawn(worker.run(socket, shutdown)));
                    started += 1;
                }
                Err(e) => {
                    error!(source = %name, error = %e, "failed to start subscriber");
                    shared.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if started == 0 {
            error!("failed to start any pub/sub subscribers");
            self.stop().await;
            return false;
        }
        info!(
            started,
            total = self.endpoints.len(),
            "pub/sub listener started"
        );
        true
    }

    /// Stop all source loops and close their sockets. Idempotent; safe on
    /// a partially-initialized listener.
    pub async fn stop(&mut self) {
        if !self.running && self.tasks.is_empty() {
            return;
        }
        info!("stopping pub/sub listener");
        self.running = false;
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for source in &self.sources {
            source.connected.store(false, Ordering::Relaxed);
        }
        let total: u64 = self
            .sources
            .iter()
            .map(|s| s.messages.load(Ordering::Relaxed))
            .sum();
        info!(messages = total, "pub/sub listener stopped");
    }

    /// Replace a source endpoint. Refused while running.
    pub fn set_endpoint(&mut self, source: &str, endpoint: String) {
        if self.running {
            warn!("cannot change endpoint while listener is running");
            return;
        }
        match self.endpoints.iter_mut().find(|(name, _)| name == source) {
            Some(entry) => entry.1 = endpoint,
            None => self.endpoints.push((source.to_owned(), endpoint)),
        }
    }

    /// Replace the topic filter. Refused while running.
    pub fn set_topic_prefix(&mut self, prefix: String) {
        if self.running {
            warn!("cannot change topic prefix while listener is running");
            return;
        }
        self.config.topic_prefix = prefix;
    }

    pub fn get_stats(&self) -> PubSubStats {
        let sources: Vec<SourceStats> = self
            .sources
            .iter()
            .map(|s| SourceStats {
                name: s.name.clone(),
                endpoint: s.endpoint.clone(),
                connected: s.connected.load(Ordering::Relaxed),
                messages_processed: s.messages.load(Ordering::Relaxed),
                errors: s.errors.load(Ordering::Relaxed),
            })
            .collect();
        PubSubStats {
            mode: self.config.mode(),
            running: self.running,
            connected: sources.iter().any(|s| s.connected),
            total_messages: sources.iter().map(|s| s.messages_processed).sum(),
            total_errors: sources.iter().map(|s| s.errors).sum(),
            topic_prefix: self.config.topic_prefix.clone(),
            sources,
        }
    }
}

/// Resolve the per-source endpoints for a topology.
fn resolve_endpoints(topology: &Topology, settings: &Settings) -> Vec<(String, String)> {
    match topology {
        Topology::Single { endpoint } => vec![("camera1".into(), endpoint.clone())],
        Topology::DualLocal => vec![
            ("camera1".into(), format!("tcp://localhost:{CAMERA1_PORT}")),
            ("camera2".into(), format!("tcp://localhost:{CAMERA2_PORT}")),
        ],
        Topology::DualRemote => {
            let host1 = settings
                .get(CAMERA1_HOST_KEY)
                .unwrap_or_else(|| "localhost".into());
            let host2 = settings
                .get(CAMERA2_HOST_KEY)
                .unwrap_or_else(|| "localhost".into());
            vec![
                ("camera1".into(), format!("tcp://{host1}:{CAMERA1_PORT}")),
                ("camera2".into(), format!("tcp://{host2}:{CAMERA2_PORT}")),
            ]
        }
    }
}

async fn open_subscriber(endpoint: &str, topic_prefix: &str) -> Result<SubSocket, zeromq::ZmqError> {
    let mut socket = SubSocket::new();
    socket.connect(endpoint).await?;
    socket.subscribe(topic_prefix).await?;
    Ok(socket)
}

/// Backoff before reconnect attempt `attempt` (0-based): base doubling
/// per attempt plus a small linear jitter term.
fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base * 2u32.saturating_pow(attempt) + Duration::from_millis(100) * attempt
}

struct SourceWorker {
    shared: Arc<SourceShared>,
    config: PubSubConfig,
    tx: IngestSender,
}

impl SourceWorker {
    async fn run(self, socket: SubSocket, mut shutdown: watch::Receiver<bool>) {
        let mut socket = Some(socket);
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(sub) = socket.as_mut() else {
                if attempts >= self.config.max_reconnect_attempts {
                    error!(
                        source = %self.shared.name,
                        attempts,
                        "exhausted reconnect attempts, retiring source"
                    );
                    break;
                }
                let delay = backoff_delay(attempts, self.config.base_reconnect_delay);
                warn!(
                    source = %self.shared.name,
                    attempt = attempts + 1,
                    max = self.config.max_reconnect_attempts,
                    ?delay,
                    "source disconnected, backing off before reconnect"
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(delay) => {}
                }
                match open_subscriber(&self.shared.endpoint, &self.config.topic_prefix).await {
                    Ok(fresh) => {
                        info!(source = %self.shared.name, "reconnected to pub/sub endpoint");
                        socket = Some(fresh);
                        attempts = 0;
                        self.shared.connected.store(true, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(source = %self.shared.name, error = %e, "reconnect failed");
                        attempts += 1;
                        self.shared.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                continue;
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                received = timeout(self.config.receive_timeout, sub.recv()) => match received {
                    // Nothing available inside the window; poll again.
                    Err(_) => {}
                    Ok(Ok(message)) => self.handle_multipart(message).await,
                    Ok(Err(e)) => {
                        warn!(source = %self.shared.name, error = %e, "receive failed, tearing down socket");
                        self.shared.errors.fetch_add(1, Ordering::Relaxed);
                        self.shared.connected.store(false, Ordering::Relaxed);
                        socket = None;
                    }
                },
            }
        }

        self.shared.connected.store(false, Ordering::Relaxed);
    }

    async fn handle_multipart(&self, message: ZmqMessage) {
        let parts: Vec<Bytes> = message.into_vec();
        if parts.len() < 2 {
            warn!(source = %self.shared.name, "received incomplete multipart message");
            return;
        }

        let topic = match std::str::from_utf8(&parts[0]) {
            Ok(topic) => topic.to_owned(),
            Err(_) => {
                self.shared.errors.fetch_add(1, Ordering::Relaxed);
                error!(source = %self.shared.name, "topic frame is not UTF-8");
                return;
            }
        };

        // Three parts: [topic, json properties, payload]. A property frame
        // that fails to parse is non-fatal; the message proceeds with empty
        // properties and the payload stays the second part.
        let mut properties = Map::new();
        let mut data = &parts[1];
        if parts.len() >= 3 {
            match serde_json::from_slice::<serde_json::Value>(&parts[1]) {
                Ok(serde_json::Value::Object(map)) => {
                    properties = map;
                    data = &parts[2];
                }
                Ok(_) | Err(_) => {
                    debug!(source = %self.shared.name, "could not parse property frame");
                }
            }
        }

        let count = self.shared.messages.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(source = %self.shared.name, count, %topic, "received pub/sub message");

        self.process_message(&topic, data, &properties).await;
    }

    async fn process_message(
        &self,
        topic: &str,
        data: &Bytes,
        properties: &Map<String, serde_json::Value>,
    ) {
        let source = self.shared.name.as_str();

        // A source on a shared bus receives its own broadcasts back.
        let sender = properties.get("System_ID").and_then(|v| v.as_str());
        if sender == Some(self.config.system_id.as_str()) {
            debug!(source, "filtering out self-echo message");
            return;
        }

        if data.len() > self.config.max_binary_bytes {
            info!(source, %topic, bytes = data.len(), "skipping large binary message");
            return;
        }

        let message_type = classify(topic, properties);
        if matches!(message_type, MessageType::Image | MessageType::PreImage) {
            info!(source, ?message_type, "skipping camera image message");
            return;
        }
        if message_type != MessageType::Results {
            debug!(source, ?message_type, "skipping non-results message");
            return;
        }

        let value = match decode::unpack(data) {
            Ok(value) => value,
            Err(DecodeError::ExtraData { .. }) => {
                info!(source, "trailing bytes in payload, skipping");
                return;
            }
            Err(e) => {
                error!(source, error = %e, "failed to unpack results payload");
                return;
            }
        };

        let Some(payload) = decode::extract_shot_payload(&value) else {
            debug!(source, "no shot data extracted from results message");
            return;
        };

        if self
            .tx
            .send(Inbound {
                payload,
                source: Some(self.shared.name.clone()),
            })
            .await
            .is_err()
        {
            error!(source, "pipeline ingest queue closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn classify_prefers_property_code() {
        let properties = props(json!({ "Message_Type": 4 }));
        assert_eq!(classify("Golf.Sim.Whatever", &properties), MessageType::Results);

        // Stringly-typed codes are accepted too.
        let properties = props(json!({ "Message_Type": "7" }));
        assert_eq!(classify("Golf.Sim.Results", &properties), MessageType::Control);
    }

    #[test]
    fn classify_falls_back_to_topic_substring() {
        let empty = Map::new();
        assert_eq!(classify("Golf.Sim.Results.Camera1", &empty), MessageType::Results);
        assert_eq!(classify("Golf.Sim.Control", &empty), MessageType::Control);
        assert_eq!(classify("Golf.Sim.Message", &empty), MessageType::Unknown);
    }

    #[test]
    fn classify_unknown_code() {
        let properties = props(json!({ "Message_Type": 42 }));
        assert_eq!(classify("Golf.Sim.Results", &properties), MessageType::Unknown);
    }

    #[test]
    fn backoff_schedule() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base), Duration::from_millis(2100));
        assert_eq!(backoff_delay(2, base), Duration::from_millis(4200));
        assert_eq!(backoff_delay(4, base), Duration::from_millis(16_400));
    }

    fn results_payload() -> Bytes {
        use rmpv::Value;
        let value = Value::Map(vec![
            (Value::from("speed"), Value::F64(150.0)),
            (Value::from("result_type"), Value::from(7)),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        Bytes::from(buf)
    }

    fn multipart(topic: &str, properties: serde_json::Value, data: Bytes) -> ZmqMessage {
        let mut message = ZmqMessage::from(Bytes::copy_from_slice(topic.as_bytes()));
        message.push_back(Bytes::from(serde_json::to_vec(&properties).unwrap()));
        message.push_back(data);
        message
    }

    fn worker(tx: IngestSender) -> (SourceWorker, Arc<SourceShared>) {
        let shared = Arc::new(SourceShared::new(
            "camera1".into(),
            "tcp://localhost:5556".into(),
        ));
        let worker = SourceWorker {
            shared: shared.clone(),
            config: PubSubConfig::default(),
            tx,
        };
        (worker, shared)
    }

    #[tokio::test]
    async fn worker_filters_and_forwards_results() {
        let (tx, mut rx) = crate::pipeline::ingest_channel(4);
        let (worker, shared) = worker(tx);

        // Self-echo: counted but never forwarded.
        worker
            .handle_multipart(multipart(
                "Golf.Sim.Results",
                json!({ "System_ID": "shotrelay", "Message_Type": 4 }),
                results_payload(),
            ))
            .await;

        // Image frame: skipped by type.
        worker
            .handle_multipart(multipart(
                "Golf.Sim.Image",
                json!({ "System_ID": "monitor-1", "Message_Type": 2 }),
                results_payload(),
            ))
            .await;

        // Oversized binary: skipped by length alone.
        worker
            .handle_multipart(multipart(
                "Golf.Sim.Results",
                json!({ "System_ID": "monitor-1", "Message_Type": 4 }),
                Bytes::from(vec![0u8; 100_001]),
            ))
            .await;

        // Results from another system: forwarded with the source tag.
        worker
            .handle_multipart(multipart(
                "Golf.Sim.Results",
                json!({ "System_ID": "monitor-1", "Message_Type": 4 }),
                results_payload(),
            ))
            .await;

        let inbound = rx.try_recv().unwrap();
        assert_eq!(inbound.source.as_deref(), Some("camera1"));
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.messages.load(Ordering::Relaxed), 4);
        assert_eq!(shared.errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn worker_survives_bad_property_frame() {
        let (tx, mut rx) = crate::pipeline::ingest_channel(4);
        let (worker, shared) = worker(tx);

        // Unparseable properties leave the payload on the second part.
        let mut message = ZmqMessage::from(Bytes::from_static(b"Golf.Sim.Results"));
        message.push_back(results_payload());
        message.push_back(Bytes::from_static(b"ignored trailer"));
        worker.handle_multipart(message).await;

        let inbound = rx.try_recv().unwrap();
        assert!(matches!(
            inbound.payload,
            crate::decode::WirePayload::Map(_)
        ));
        assert_eq!(shared.errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn listener_lifecycle_is_idempotent() {
        use zeromq::PubSocket;

        let mut publisher = PubSocket::new();
        let endpoint = publisher.bind("tcp://127.0.0.1:0").await.unwrap();

        let (tx, _rx) = crate::pipeline::ingest_channel(4);
        let mut listener = PubSubListener::new(
            PubSubConfig {
                topology: Topology::Single {
                    endpoint: endpoint.to_string(),
                },
                receive_timeout: Duration::from_millis(50),
                ..PubSubConfig::default()
            },
            &Settings::empty(),
            tx,
        );

        assert!(listener.start().await);
        let stats = listener.get_stats();
        assert!(stats.running);
        assert!(stats.connected);
        assert_eq!(stats.sources.len(), 1);

        // A second start while running is a no-op.
        assert!(listener.start().await);

        listener.stop().await;
        let stats = listener.get_stats();
        assert!(!stats.running);
        assert!(!stats.connected);

        // Stopping again must return promptly.
        listener.stop().await;
        assert!(!listener.get_stats().running);
    }

    #[test]
    fn topology_endpoints() {
        let settings = Settings::from_value(json!({
            "ipc_interface": { "camera1_host": "10.0.0.21", "camera2_host": "10.0.0.22" }
        }));

        let single = resolve_endpoints(
            &Topology::Single { endpoint: "tcp://localhost:9000".into() },
            &settings,
        );
        assert_eq!(single, vec![("camera1".into(), "tcp://localhost:9000".into())]);

        let dual = resolve_endpoints(&Topology::DualLocal, &settings);
        assert_eq!(dual[0].1, "tcp://localhost:5556");
        assert_eq!(dual[1].1, "tcp://localhost:5557");

        let remote = resolve_endpoints(&Topology::DualRemote, &settings);
        assert_eq!(remote[0].1, "tcp://10.0.0.21:5556");
        assert_eq!(remote[1].1, "tcp://10.0.0.22:5557");

        let defaulted = resolve_endpoints(&Topology::DualRemote, &Settings::empty());
        assert_eq!(defaulted[0].1, "tcp://localhost:5556");
    }
}
