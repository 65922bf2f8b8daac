//! Camera mount control channel
//!
//! One persistent WebSocket carries discrete `{command, camera}` frames to
//! the mount controller and structured status frames back. The channel
//! queues outbound commands while disconnected, flushes them strictly FIFO
//! on reconnect, and backs off exponentially between reconnect attempts up
//! to a budget; past the budget the next `send` acts as a manual retry.

use crate::assert_invariant;
use crate::config::ControlConfig;
use crate::errors::CamLinkError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Outbound control frame understood by the mount controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraCommand {
    pub command: String,
    pub camera: String,
}

impl CameraCommand {
    pub fn new(command: impl Into<String>, camera: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            camera: camera.into(),
        }
    }

    /// Raise the camera one motor step.
    pub fn step_up(camera: impl Into<String>) -> Self {
        Self::new("u", camera)
    }

    /// Lower the camera one motor step.
    pub fn step_down(camera: impl Into<String>) -> Self {
        Self::new("d", camera)
    }

    /// Pan the servo counter-clockwise.
    pub fn pan_left(camera: impl Into<String>) -> Self {
        Self::new("l", camera)
    }

    /// Pan the servo clockwise.
    pub fn pan_right(camera: impl Into<String>) -> Self {
        Self::new("r", camera)
    }

    /// Move the lift to a numbered tray preset (1-9).
    pub fn preset(position: u8, camera: impl Into<String>) -> Self {
        Self::new(position.to_string(), camera)
    }

    /// Re-home the lift against its top limit switch.
    pub fn home(camera: impl Into<String>) -> Self {
        Self::new("home", camera)
    }
}

/// Inbound status frame from the mount controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStatus {
    pub status: String,
    pub message: Option<String>,
    pub command: Option<String>,
    pub camera: Option<String>,
    pub servo_position: Option<i64>,
    pub total_steps: Option<i64>,
}

impl ControlStatus {
    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

/// Channel lifecycle and inbound traffic, fanned out to observers.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Open,
    Closed,
    Status {
        status: ControlStatus,
        received_at: DateTime<Utc>,
    },
    /// Payloads that don't parse as a status frame; logged, never fatal.
    Raw {
        text: String,
        received_at: DateTime<Utc>,
    },
}

/// Control connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
}

/// Write half of an established control connection.
#[async_trait]
pub trait ControlSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), CamLinkError>;
    async fn close(&mut self);
}

/// Read half of an established control connection.
#[async_trait]
pub trait ControlSource: Send {
    /// Next text payload; `None` once the connection is gone.
    async fn next(&mut self) -> Option<Result<String, CamLinkError>>;
}

/// Dials the control endpoint. Kept behind a trait so channel tests run
/// against in-memory socket pairs.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn ControlSink>, Box<dyn ControlSource>), CamLinkError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket control transport
pub struct WsControlTransport;

struct WsSink {
    write: futures::stream::SplitSink<WsStream, Message>,
}

struct WsSource {
    read: futures::stream::SplitStream<WsStream>,
}

#[async_trait]
impl ControlTransport for WsControlTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn ControlSink>, Box<dyn ControlSource>), CamLinkError> {
        let (stream, _) = connect_async(url).await.map_err(|e| {
            CamLinkError::ControlError(format!("failed to connect to {}: {}", url, e))
        })?;
        let (write, read) = stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

#[async_trait]
impl ControlSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), CamLinkError> {
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|e| CamLinkError::ControlError(format!("send failed: {}", e)))
    }

    async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}

#[async_trait]
impl ControlSource for WsSource {
    async fn next(&mut self) -> Option<Result<String, CamLinkError>> {
        while let Some(message) = self.read.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                // The controller accepts and emits both; decode binary as text.
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue, // ping/pong
                Err(e) => {
                    return Some(Err(CamLinkError::ControlError(format!(
                        "receive failed: {}",
                        e
                    ))))
                }
            }
        }
        None
    }
}

/// Tunables for the control channel.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// Automatic reconnect attempts before the channel waits for a manual
    /// retry (the next `send`)
    pub max_reconnect_attempts: u32,
    pub retry: RetryPolicy,
    /// Outbound queue bound while disconnected; oldest frames drop first
    pub max_queue_depth: usize,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            retry: RetryPolicy::default(),
            max_queue_depth: 64,
        }
    }
}

impl ControlOptions {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            retry: RetryPolicy::new(config.base_backoff_ms, config.cap_backoff_ms),
            max_queue_depth: config.max_queue_depth,
        }
    }

    /// Delay before reconnect number `attempt` (0-based), per the shared law.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.retry.next_delay(attempt)
    }
}

struct ControlInner {
    state: ChannelState,
    queue: VecDeque<String>,
    attempt: u32,
    outbound: Option<mpsc::UnboundedSender<String>>,
    io_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

/// The persistent mount-control connection. Cloneable handle; all clones
/// share the same channel.
#[derive(Clone)]
pub struct CommandChannel {
    url: String,
    opts: ControlOptions,
    transport: Arc<dyn ControlTransport>,
    inner: Arc<Mutex<ControlInner>>,
    events: broadcast::Sender<ControlEvent>,
}

impl CommandChannel {
    pub fn new(url: impl Into<String>, opts: ControlOptions) -> Self {
        Self::with_transport(url, opts, Arc::new(WsControlTransport))
    }

    /// Wire a channel from file configuration.
    pub fn from_config(config: &ControlConfig) -> Self {
        Self::new(config.endpoint.clone(), ControlOptions::from_config(config))
    }

    pub fn with_transport(
        url: impl Into<String>,
        opts: ControlOptions,
        transport: Arc<dyn ControlTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            url: url.into(),
            opts,
            transport,
            inner: Arc::new(Mutex::new(ControlInner {
                state: ChannelState::Disconnected,
                queue: VecDeque::new(),
                attempt: 0,
                outbound: None,
                io_task: None,
                reconnect_timer: None,
            })),
            events,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.lock().await.state
    }

    /// Frames waiting for the next successful connection.
    pub async fn queued(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Observe channel lifecycle and inbound status frames.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Send a command. Never blocks: transmits in submission order while the
    /// channel is open, otherwise queues the frame and (when disconnected)
    /// kicks off a connection attempt in the background.
    pub async fn send(&self, command: &CameraCommand) -> Result<(), CamLinkError> {
        let frame = serde_json::to_string(command)
            .map_err(|e| CamLinkError::ControlError(format!("serialize failed: {}", e)))?;

        let trigger_connect = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ChannelState::Open => {
                    let delivered = inner
                        .outbound
                        .as_ref()
                        .map(|tx| tx.send(frame.clone()).is_ok())
                        .unwrap_or(false);
                    if !delivered {
                        // io task is tearing down; keep the frame for the
                        // next connection
                        Self::enqueue(&mut inner, frame, self.opts.max_queue_depth);
                    }
                    false
                }
                ChannelState::Connecting => {
                    Self::enqueue(&mut inner, frame, self.opts.max_queue_depth);
                    false
                }
                ChannelState::Disconnected => {
                    Self::enqueue(&mut inner, frame, self.opts.max_queue_depth);
                    true
                }
            }
        };

        if trigger_connect {
            self.spawn_connect();
        }
        Ok(())
    }

    /// Open the control connection. No-op while connecting or open. On
    /// success the queued backlog drains fully, in FIFO order, before any
    /// send submitted after the channel reports `Open`.
    pub async fn connect(&self) -> Result<(), CamLinkError> {
        {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, ChannelState::Connecting | ChannelState::Open) {
                return Ok(());
            }
            inner.state = ChannelState::Connecting;
        }

        log::info!("Control channel: connecting to {}", self.url);
        match self.transport.connect(&self.url).await {
            Ok((sink, source)) => {
                self.on_connected(sink, source).await;
                Ok(())
            }
            Err(e) => {
                log::warn!("Control channel: connect failed: {}", e);
                self.on_closed(Vec::new()).await;
                Err(e)
            }
        }
    }

    /// Tear the channel down for page teardown. Queued frames are kept; a
    /// later `send` re-opens the connection.
    pub async fn shutdown(&self) {
        let (io_task, timer) = {
            let mut inner = self.inner.lock().await;
            inner.state = ChannelState::Disconnected;
            inner.outbound = None;
            (inner.io_task.take(), inner.reconnect_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(io_task) = io_task {
            io_task.abort();
        }
        log::info!("Control channel: shut down");
    }

    /// Type-erased wrapper around `connect()`. The boxed `dyn Future + Send`
    /// return type gives callers a concrete `Send` future so the compiler
    /// does not recurse into `connect()`'s opaque future to decide `Send`
    /// across the reconnect spawn boundary.
    fn connect_boxed(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CamLinkError>> + Send + '_>>
    {
        Box::pin(self.connect())
    }

    fn spawn_connect(&self) {
        let channel = self.clone();
        tokio::spawn(async move {
            let _ = channel.connect().await;
        });
    }

    fn enqueue(inner: &mut ControlInner, frame: String, cap: usize) {
        if inner.queue.len() >= cap {
            inner.queue.pop_front();
            log::warn!("Control channel: queue full ({} frames), dropped oldest command", cap);
        }
        inner.queue.push_back(frame);
    }

    async fn on_connected(&self, mut sink: Box<dyn ControlSink>, source: Box<dyn ControlSource>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.state != ChannelState::Connecting {
                // shutdown() won the race; this connection is stale
                drop(inner);
                sink.close().await;
                return;
            }
            // Drain the backlog into the ordered outbound channel before the
            // state flips to Open, so frames submitted after Open line up
            // strictly behind it.
            let backlog = inner.queue.len();
            while let Some(frame) = inner.queue.pop_front() {
                let _ = outbound_tx.send(frame);
            }
            assert_invariant!(
                inner.queue.is_empty(),
                "Queued frames drain fully before new sends are accepted",
                "control"
            );
            if backlog > 0 {
                log::info!("Control channel: flushing {} queued frames", backlog);
            }
            inner.state = ChannelState::Open;
            inner.attempt = 0;
            inner.outbound = Some(outbound_tx);
            let channel = self.clone();
            inner.io_task = Some(tokio::spawn(channel.io_loop(sink, source, outbound_rx)));
        }
        let _ = self.events.send(ControlEvent::Open);
        log::info!("Control channel: open");
    }

    async fn io_loop(
        self,
        mut sink: Box<dyn ControlSink>,
        mut source: Box<dyn ControlSource>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        let mut unsent: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                maybe_frame = outbound.recv() => {
                    match maybe_frame {
                        Some(frame) => {
                            if let Err(e) = sink.send(frame.clone()).await {
                                log::warn!("Control channel: send failed: {}", e);
                                unsent.push(frame);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = source.next() => {
                    match inbound {
                        Some(Ok(text)) => self.handle_inbound(text),
                        Some(Err(e)) => {
                            log::warn!("Control channel: receive error: {}", e);
                            break;
                        }
                        None => {
                            log::info!("Control channel: connection closed by peer");
                            break;
                        }
                    }
                }
            }
        }
        sink.close().await;

        // Frames handed to the io task but never written go back ahead of
        // anything queued since.
        outbound.close();
        while let Ok(frame) = outbound.try_recv() {
            unsent.push(frame);
        }
        self.on_closed(unsent).await;
    }

    async fn on_closed(&self, unsent: Vec<String>) {
        let reconnect = {
            let mut inner = self.inner.lock().await;
            // A shutdown that already parked the channel owns the state;
            // don't schedule reconnects on its behalf.
            let was_active = matches!(inner.state, ChannelState::Connecting | ChannelState::Open);
            inner.state = ChannelState::Disconnected;
            inner.outbound = None;
            inner.io_task = None;

            for frame in unsent.into_iter().rev() {
                if inner.queue.len() >= self.opts.max_queue_depth {
                    log::warn!("Control channel: queue full, dropping unsent command");
                    continue;
                }
                inner.queue.push_front(frame);
            }

            if !was_active {
                None
            } else if self
                .opts
                .retry
                .should_retry(inner.attempt, self.opts.max_reconnect_attempts)
            {
                inner.attempt += 1;
                Some((self.opts.retry.next_delay(inner.attempt - 1), inner.attempt))
            } else {
                log::warn!(
                    "Control channel: reconnect budget exhausted after {} attempts; next send retries",
                    inner.attempt
                );
                None
            }
        };
        let _ = self.events.send(ControlEvent::Closed);

        if let Some((delay, attempt)) = reconnect {
            log::info!(
                "Control channel: reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt,
                self.opts.max_reconnect_attempts
            );
            let channel = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Route through the type-erased `connect_boxed` boundary so
                // the compiler need not resolve `connect()`'s opaque future
                // `Send`-ness by introspecting it within its own defining
                // scope across this reconnect spawn.
                let _ = channel.connect_boxed().await;
            });
            let mut inner = self.inner.lock().await;
            if let Some(old) = inner.reconnect_timer.replace(handle) {
                old.abort();
            }
        }
    }

    fn handle_inbound(&self, text: String) {
        let received_at = Utc::now();
        match serde_json::from_str::<ControlStatus>(&text) {
            Ok(status) => {
                match status.status.as_str() {
                    "connected" => log::info!(
                        "Control channel: controller ready (servo {:?}, steps {:?})",
                        status.servo_position,
                        status.total_steps
                    ),
                    "executed" => log::debug!(
                        "Control channel: executed {:?} for {:?}",
                        status.command,
                        status.camera
                    ),
                    "error" => log::warn!(
                        "Control channel: controller error: {}",
                        status.message.as_deref().unwrap_or("unknown")
                    ),
                    other => log::debug!("Control channel: status {}", other),
                }
                let _ = self.events.send(ControlEvent::Status {
                    status,
                    received_at,
                });
            }
            Err(_) => {
                log::info!("Control channel: raw message: {}", text);
                let _ = self.events.send(ControlEvent::Raw { text, received_at });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let command = CameraCommand::pan_left("cam1");
        let json = serde_json::to_string(&command).unwrap();
        assert_eq!(json, r#"{"command":"l","camera":"cam1"}"#);

        let preset = CameraCommand::preset(4, "cam2");
        assert_eq!(preset.command, "4");
        assert_eq!(preset.camera, "cam2");
    }

    #[test]
    fn test_status_parsing_tolerates_extra_and_missing_fields() {
        let full: ControlStatus = serde_json::from_str(
            r#"{"status":"executed","command":"u","camera":"cam1","servo_position":1500,"total_steps":230,"extra":true}"#,
        )
        .unwrap();
        assert_eq!(full.status, "executed");
        assert_eq!(full.servo_position, Some(1500));

        let minimal: ControlStatus = serde_json::from_str(r#"{"status":"connected"}"#).unwrap();
        assert_eq!(minimal.status, "connected");
        assert!(minimal.command.is_none());
        assert!(!minimal.is_error());

        let error: ControlStatus =
            serde_json::from_str(r#"{"status":"error","message":"Invalid JSON format"}"#).unwrap();
        assert!(error.is_error());
    }

    #[test]
    fn test_unstructured_payload_is_not_a_status() {
        assert!(serde_json::from_str::<ControlStatus>("not json").is_err());
        assert!(serde_json::from_str::<ControlStatus>(r#"{"kind":"pong"}"#).is_err());
    }

    #[test]
    fn test_reconnect_delay_follows_shared_law() {
        let opts = ControlOptions::default();
        assert_eq!(opts.reconnect_delay(0), Duration::from_millis(1_000));
        assert_eq!(opts.reconnect_delay(4), Duration::from_millis(10_000));
    }
}
