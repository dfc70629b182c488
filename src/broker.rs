//! Broker transport listener: a durable STOMP topic subscription.
//!
//! One persistent subscription; every MESSAGE frame is unwrapped
//! (optionally base64 per the `encoding` header), msgpack-decoded, and
//! handed to the orchestrator through the ingest queue. The delivery
//! task never touches the store or the connection set directly.
//!
//! A bad message is logged and dropped; the listener keeps processing.
//! A heartbeat timeout only marks the listener disconnected — reconnect
//! policy belongs to the surrounding system.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::decode::{self, WirePayload};
use crate::error::StompError;
use crate::pipeline::{Inbound, IngestSender};
use crate::stomp::{StompFrame, StompSplitter};

/// Broker subscription settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// STOMP destination, e.g. `/topic/Golf.Sim`.
    pub destination: String,
    /// Optional login/passcode pair.
    pub credentials: Option<(String, String)>,
    /// Window without any broker traffic before the listener is marked
    /// disconnected.
    pub heartbeat_timeout: Duration,
    /// Bound on the CONNECT/CONNECTED exchange.
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 61613,
            destination: "/topic/Golf.Sim".into(),
            credentials: None,
            heartbeat_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Session lifecycle hooks, implemented by external monitoring.
///
/// All methods default to no-ops; the listener composes an implementation
/// rather than exposing raw callbacks.
pub trait BrokerEvents: Send {
    fn on_connected(&mut self) {}
    fn on_disconnected(&mut self) {}
    fn on_error(&mut self, message: &str) {
        let _ = message;
    }
    fn on_heartbeat_timeout(&mut self) {}
}

/// No-op event sink.
impl BrokerEvents for () {}

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    messages: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time listener statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub connected: bool,
    pub messages_processed: u64,
    pub errors: u64,
}

/// Listener over one broker topic subscription.
pub struct BrokerListener {
    config: BrokerConfig,
    tx: IngestSender,
    events: Option<Box<dyn BrokerEvents>>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Box<dyn BrokerEvents>>>,
}

impl BrokerListener {
    pub fn new(config: BrokerConfig, tx: IngestSender) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            tx,
            events: Some(Box::new(())),
            shared: Arc::new(Shared::default()),
            shutdown,
            task: None,
        }
    }

    /// Replace the no-op event sink. The sink is handed to the session
    /// task while running and returned when `stop` completes, so it
    /// survives a stop/start cycle.
    pub fn set_events(&mut self, events: Box<dyn BrokerEvents>) {
        self.events = Some(events);
    }

    /// Connect, subscribe, and spawn the delivery task.
    ///
    /// Counters reset on every successful connect.
    pub async fn start(&mut self) -> Result<(), StompError> {
        if self.task.is_some() {
            warn!("broker listener already running");
            return Ok(());
        }
        let _ = self.shutdown.send(false);

        let (stream, splitter) =
            timeout(self.config.connect_timeout, connect_session(&self.config))
                .await
                .map_err(|_| {
                    StompError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "broker handshake timed out",
                    ))
                })??;

        info!(
            host = %self.config.host,
            port = self.config.port,
            destination = %self.config.destination,
            "connected to broker"
        );
        self.shared.connected.store(true, Ordering::Relaxed);
        self.shared.messages.store(0, Ordering::Relaxed);
        self.shared.errors.store(0, Ordering::Relaxed);

        let mut events = self.events.take().unwrap_or_else(|| Box::new(()));
        events.on_connected();

        let session = Session {
            shared: self.shared.clone(),
            tx: self.tx.clone(),
            events,
            heartbeat_timeout: self.config.heartbeat_timeout,
        };
        let shutdown = self.shutdown.subscribe();
        self.task = Some(tokio::spawn(session.run(stream, splitter, shutdown)));
        Ok(())
    }

    /// Stop the delivery task and close the subscription, reclaiming the
    /// event sink for a later restart. Idempotent; a never-started
    /// listener is a no-op.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Ok(events) = task.await {
                self.events = Some(events);
            }
        }
        self.shared.connected.store(false, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> BrokerStats {
        BrokerStats {
            connected: self.shared.connected.load(Ordering::Relaxed),
            messages_processed: self.shared.messages.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
        }
    }
}

/// Open the TCP stream and complete the CONNECT/SUBSCRIBE exchange.
///
/// Returns the splitter alongside the stream so any frames the broker
/// pipelined behind CONNECTED are not lost.
async fn connect_session(
    config: &BrokerConfig,
) -> Result<(TcpStream, StompSplitter), StompError> {
    let mut stream = TcpStream::connect((config.host.as_str(), config.port)).await?;

    let mut connect = StompFrame::new("CONNECT")
        .header("accept-version", "1.2")
        .header("host", &config.host)
        .header("heart-beat", "0,10000");
    if let Some((login, passcode)) = &config.credentials {
        connect = connect.header("login", login).header("passcode", passcode);
    }
    stream.write_all(&connect.encode()).await?;

    let mut splitter = StompSplitter::new();
    let mut buf = [0u8; 4096];
    'handshake: loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(StompError::Refused(
                "connection closed during handshake".into(),
            ));
        }
        for frame in splitter.feed(&buf[..n]) {
            let frame = frame?;
            match frame.command.as_str() {
                "CONNECTED" => break 'handshake,
                "ERROR" => {
                    return Err(StompError::Refused(
                        String::from_utf8_lossy(&frame.body).into_owned(),
                    ))
                }
                other => return Err(StompError::UnexpectedFrame(other.into())),
            }
        }
    }

    let subscribe = StompFrame::new("SUBSCRIBE")
        .header("id", "0")
        .header("destination", &config.destination)
        .header("ack", "auto");
    stream.write_all(&subscribe.encode()).await?;
    Ok((stream, splitter))
}

struct Session {
    shared: Arc<Shared>,
    tx: IngestSender,
    events: Box<dyn BrokerEvents>,
    heartbeat_timeout: Duration,
}

impl Session {
    /// Drive the delivery loop until shutdown or disconnect, then give
    /// the event sink back to the listener.
    async fn run(
        mut self,
        mut stream: TcpStream,
        mut splitter: StompSplitter,
        mut shutdown: watch::Receiver<bool>,
    ) -> Box<dyn BrokerEvents> {
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                read = timeout(self.heartbeat_timeout, stream.read(&mut buf)) => match read {
                    // No traffic (not even heartbeat EOLs) inside the window.
                    Err(_) => {
                        if self.shared.connected.swap(false, Ordering::Relaxed) {
                            warn!("broker heartbeat timeout detected");
                            self.events.on_heartbeat_timeout();
                        }
                    }
                    Ok(Ok(0)) => {
                        warn!(
                            messages = self.shared.messages.load(Ordering::Relaxed),
                            "disconnected from broker"
                        );
                        self.shared.connected.store(false, Ordering::Relaxed);
                        self.events.on_disconnected();
                        break;
                    }
                    Ok(Ok(n)) => {
                        for frame in splitter.feed(&buf[..n]) {
                            match frame {
                                Ok(frame) => self.handle_frame(frame).await,
                                Err(e) => {
                                    let count =
                                        self.shared.errors.fetch_add(1, Ordering::Relaxed) + 1;
                                    error!(error = %e, count, "bad broker frame");
                                }
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "broker read failed");
                        self.shared.connected.store(false, Ordering::Relaxed);
                        self.events.on_disconnected();
                        break;
                    }
                },
            }
        }

        self.events
    }

    async fn handle_frame(&mut self, frame: StompFrame) {
        match frame.command.as_str() {
            "MESSAGE" => {
                let count = self.shared.messages.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(count, "received broker message");
                if let Err(e) = self.handle_message(&frame).await {
                    self.shared.errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, count, "failed to process broker message");
                }
            }
            "ERROR" => {
                let count = self.shared.errors.fetch_add(1, Ordering::Relaxed) + 1;
                let body = String::from_utf8_lossy(&frame.body).into_owned();
                error!(count, body = %body, "broker error frame");
                self.events.on_error(&body);
            }
            other => debug!(command = other, "ignoring broker frame"),
        }
    }

    async fn handle_message(&mut self, frame: &StompFrame) -> Result<(), ProcessError> {
        let data = extract_payload(frame)?;
        if data.is_empty() {
            return Err(ProcessError::Empty);
        }
        let value = decode::unpack(&data)?;
        let payload = WirePayload::from_value(value)?;
        // Hand off to the orchestrator; never mutate shared state from the
        // delivery task.
        self.tx
            .send(Inbound {
                payload,
                source: None,
            })
            .await
            .map_err(|_| ProcessError::PipelineClosed)
    }
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error("empty payload")]
    Empty,
    #[error("pipeline ingest queue closed")]
    PipelineClosed,
    #[error(transparent)]
    Decode(#[from] crate::error::DecodeError),
    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("base64 body is not text: {0}")]
    Base64Text(#[from] std::str::Utf8Error),
}

/// Extract raw msgpack bytes from a MESSAGE frame body, decoding base64
/// when the frame header flags it.
fn extract_payload(frame: &StompFrame) -> Result<Vec<u8>, ProcessError> {
    if frame.get_header("encoding") == Some("base64") {
        debug!("message is base64 encoded, decoding");
        let text = std::str::from_utf8(&frame.body)?;
        Ok(BASE64.decode(text.trim())?)
    } else {
        Ok(frame.body.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
