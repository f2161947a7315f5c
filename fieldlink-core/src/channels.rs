//! Transport channel manager
//!
//! Owns one duplex message channel per traffic class (chat, voice signaling,
//! video signaling, legacy fallback). Each channel queues outbound frames
//! while it is not open, reconnects with exponential backoff after abnormal
//! closure, keeps itself alive with a periodic `ping`, and publishes decoded
//! inbound envelopes on a broadcast stream.
//!
//! The manager never holds its lock across an `.await`; every transport
//! write is a non-blocking push into the link's outbound queue.

use crate::identity::IdentityProvider;
use crate::signaling::{
    message_type, Deduplicator, Envelope, MessageClass, SequenceStamper, SignalingError,
    SignalingMessage,
};
use crate::types::CallKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

/// Close code sent by a peer that completed the closing handshake
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported for a close frame without a status
pub const NO_STATUS_CLOSURE: u16 = 1005;

/// Consecutive abnormal closures that mark a channel as degraded
const DEGRADED_THRESHOLD: u32 = 3;

const EVENT_CAPACITY: usize = 256;

/// Transport errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Channel did not reach open in time
    #[error("Channel {0} did not open in time")]
    Timeout(ChannelKind),

    /// Connector could not establish the link
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Channel was closed
    #[error("Channel {0} closed")]
    Closed(ChannelKind),

    /// Reconnect attempts exhausted
    #[error("Connection lost on channel {0}")]
    ConnectionLost(ChannelKind),

    /// Outbound message could not be encoded
    #[error("Encode failed: {0}")]
    Encode(String),

    /// Endpoint address could not be built
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// No authenticated principal to assert
    #[error("No authenticated principal")]
    Unauthenticated,
}

impl From<SignalingError> for TransportError {
    fn from(err: SignalingError) -> Self {
        TransportError::Encode(err.to_string())
    }
}

/// Traffic class of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Chat and session control
    Chat,
    /// Audio call signaling
    Voice,
    /// Video call signaling
    Video,
    /// Fallback for unclassified traffic
    Legacy,
}

impl ChannelKind {
    /// Every channel kind
    pub const ALL: [ChannelKind; 4] = [Self::Chat, Self::Voice, Self::Video, Self::Legacy];

    /// Signaling channel for a call kind
    #[must_use]
    pub fn for_call(kind: CallKind) -> Self {
        match kind {
            CallKind::Audio => Self::Voice,
            CallKind::Video => Self::Video,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Voice => write!(f, "voice"),
            Self::Video => write!(f, "video"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Connect or reconnect in progress
    Connecting,
    /// Link established
    Open,
    /// Orderly shutdown in progress
    Closing,
    /// No link
    Closed,
}

/// How call signaling is spread over channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// One primary channel per message, deduplicated by sequence number
    #[default]
    Sequenced,
    /// Call signaling is copied onto the chat and legacy channels as well
    Mirrored,
}

/// Endpoint paths relative to the base URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPaths {
    /// Chat channel path
    pub chat: String,
    /// Voice signaling path
    pub voice: String,
    /// Video signaling path
    pub video: String,
    /// Legacy fallback path
    pub legacy: String,
}

impl Default for ChannelPaths {
    fn default() -> Self {
        Self {
            chat: "ws/chat".to_string(),
            voice: "ws/voice".to_string(),
            video: "ws/video".to_string(),
            legacy: "ws".to_string(),
        }
    }
}

/// Channel manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base URL the per-kind paths are joined onto
    pub base_url: String,
    /// Per-kind endpoint paths
    pub paths: ChannelPaths,
    /// Time `open()` waits for the channel to reach open
    pub connect_timeout_ms: u64,
    /// First reconnect delay
    pub backoff_base_ms: u64,
    /// Growth factor between reconnect delays
    pub backoff_factor: f64,
    /// Reconnect attempts before `ConnectionLost`
    pub max_reconnect_attempts: u32,
    /// Keep-alive period
    pub heartbeat_interval_ms: u64,
    /// Frames held per channel while not open
    pub queue_capacity: usize,
    /// Call signaling spread
    pub delivery_mode: DeliveryMode,
    /// Sequence numbers remembered per sender for deduplication
    pub dedup_window: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://localhost:8443/".to_string(),
            paths: ChannelPaths::default(),
            connect_timeout_ms: 15_000,
            backoff_base_ms: 1_000,
            backoff_factor: 1.5,
            max_reconnect_attempts: 5,
            heartbeat_interval_ms: 25_000,
            queue_capacity: 256,
            delivery_mode: DeliveryMode::Sequenced,
            dedup_window: 1024,
        }
    }
}

impl ChannelConfig {
    /// Path for a channel kind
    #[must_use]
    pub fn path(&self, kind: ChannelKind) -> &str {
        match kind {
            ChannelKind::Chat => &self.paths.chat,
            ChannelKind::Voice => &self.paths.voice,
            ChannelKind::Video => &self.paths.video,
            ChannelKind::Legacy => &self.paths.legacy,
        }
    }

    /// Connection timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keep-alive period
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Delay before reconnect attempt `attempt` (1-based): `base * factor^(attempt-1)`
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = Duration::from_millis(self.backoff_base_ms).as_secs_f64();
        let secs = base * self.backoff_factor.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// How a link ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code, when one was received or inferred
    pub code: Option<u16>,
    /// Close reason
    pub reason: String,
}

impl CloseInfo {
    /// Dropped without a close frame
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: Some(ABNORMAL_CLOSURE),
            reason: reason.into(),
        }
    }

    /// Explicit close code
    pub fn with_code(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }
}

/// Frame written to a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    /// Text frame
    Text(String),
    /// Start the closing handshake
    Close,
}

/// Event read from a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Text frame
    Text(String),
    /// Link ended
    Closed(CloseInfo),
}

/// An established duplex link, as handed out by a [`ChannelConnector`]
#[derive(Debug)]
pub struct ChannelLink {
    /// Frames to write
    pub outbound: mpsc::UnboundedSender<LinkFrame>,
    /// Frames read, ending with [`LinkEvent::Closed`]
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Establishes links for channels
///
/// Implement this for the transport in use (WebSocket, in-memory, ...).
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connect to `endpoint` for a channel of `kind`
    async fn connect(&self, kind: ChannelKind, endpoint: &Url)
        -> Result<ChannelLink, TransportError>;
}

/// Channel manager events
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Channel state changed
    StateChanged {
        /// Channel
        kind: ChannelKind,
        /// New state
        state: ChannelState,
    },
    /// Decoded inbound message
    Message {
        /// Channel it arrived on
        kind: ChannelKind,
        /// The envelope
        envelope: Envelope,
    },
    /// Reconnect scheduled
    Reconnecting {
        /// Channel
        kind: ChannelKind,
        /// Attempt number, 1-based
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Repeated abnormal closures; a degraded-mode poller should take over
    TransportDegraded {
        /// Channel
        kind: ChannelKind,
    },
    /// Reconnect attempts exhausted
    ConnectionLost {
        /// Channel
        kind: ChannelKind,
    },
}

/// Result of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open link
    Sent,
    /// Held until the channel opens
    Queued,
}

/// Channels a message is written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Primary channel
    pub primary: ChannelKind,
    /// Redundant copies (mirrored delivery only)
    pub mirrors: Vec<ChannelKind>,
}

/// Bounded FIFO of encoded frames; overflow drops the oldest entry
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    frames: VecDeque<String>,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a frame, returning the frame dropped to make room
    pub fn push(&mut self, frame: String) -> Option<String> {
        let dropped = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        dropped
    }

    /// Take the oldest frame
    pub fn pop_front(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    /// Put a frame back at the head
    pub fn push_front(&mut self, frame: String) {
        self.frames.push_front(frame);
    }

    /// Number of queued frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

struct Slot {
    state: ChannelState,
    state_tx: watch::Sender<ChannelState>,
    outbound: Option<mpsc::UnboundedSender<LinkFrame>>,
    queue: OutboundQueue,
    attempts: u32,
    degraded_run: u32,
    generation: u64,
    reassert: bool,
    connecting: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Closed);
        Self {
            state: ChannelState::Closed,
            state_tx,
            outbound: None,
            queue: OutboundQueue::new(capacity),
            attempts: 0,
            degraded_run: 0,
            generation: 0,
            reassert: false,
            connecting: None,
            reconnect: None,
            heartbeat: None,
            reader: None,
        }
    }

    /// Returns `true` if the state changed
    fn set_state(&mut self, state: ChannelState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        self.state_tx.send_replace(state);
        true
    }

    fn abort_tasks(&mut self) {
        for handle in [
            self.connecting.take(),
            self.reconnect.take(),
            self.heartbeat.take(),
            self.reader.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn ChannelConnector>,
    identity: Arc<dyn IdentityProvider>,
    slots: Mutex<HashMap<ChannelKind, Slot>>,
    events: broadcast::Sender<ChannelEvent>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Envelope>>>,
    stamper: SequenceStamper,
    dedup: Mutex<Deduplicator>,
}

impl Inner {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, kind: ChannelKind, state: ChannelState) {
        tracing::debug!(kind = %kind, state = ?state, "Channel state transition");
        self.emit(ChannelEvent::StateChanged { kind, state });
    }

    fn start_attempt(self: &Arc<Self>, kind: ChannelKind, slot: &mut Slot) {
        slot.generation += 1;
        let generation = slot.generation;
        if slot.set_state(ChannelState::Connecting) {
            self.emit_state(kind, ChannelState::Connecting);
        }
        let inner = Arc::clone(self);
        slot.connecting = Some(tokio::spawn(async move {
            inner.connect(kind, generation).await;
        }));
    }

    fn endpoint(&self, kind: ChannelKind) -> Result<Url, TransportError> {
        let principal = self
            .identity
            .principal()
            .ok_or(TransportError::Unauthenticated)?;
        let base = Url::parse(&self.config.base_url)
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let mut url = base
            .join(self.config.path(kind))
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("userId", principal.user_id.as_str())
            .append_pair("token", &principal.token)
            .append_pair("cid", &Uuid::new_v4().to_string());
        Ok(url)
    }

    async fn connect(self: Arc<Self>, kind: ChannelKind, generation: u64) {
        let endpoint = match self.endpoint(kind) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Cannot build channel endpoint");
                self.on_closed(kind, generation, CloseInfo::abnormal(e.to_string()));
                return;
            }
        };

        tracing::debug!(kind = %kind, path = endpoint.path(), "Connecting channel");
        match self.connector.connect(kind, &endpoint).await {
            Ok(link) => self.on_connected(kind, generation, link),
            Err(e) => {
                tracing::warn!(kind = %kind, error = %e, "Channel connect failed");
                self.on_closed(kind, generation, CloseInfo::abnormal(e.to_string()));
            }
        }
    }

    fn auth_frame(&self) -> Option<String> {
        let principal = self.identity.principal()?;
        let message = SignalingMessage::Auth {
            username: principal.username,
            password: None,
            token: Some(principal.token),
            device_info: self.identity.device_info(),
        };
        Envelope::bare(message).encode().ok()
    }

    fn on_connected(self: &Arc<Self>, kind: ChannelKind, generation: u64, link: ChannelLink) {
        let ChannelLink { outbound, inbound } = link;
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&kind) else {
            let _ = outbound.send(LinkFrame::Close);
            return;
        };
        if slot.generation != generation || slot.state != ChannelState::Connecting {
            tracing::debug!(kind = %kind, "Discarding stale channel link");
            let _ = outbound.send(LinkFrame::Close);
            return;
        }

        if slot.reassert {
            if let Some(frame) = self.auth_frame() {
                let _ = outbound.send(LinkFrame::Text(frame));
            }
            slot.reassert = false;
        }

        let mut flushed = 0usize;
        while let Some(frame) = slot.queue.pop_front() {
            if let Err(err) = outbound.send(LinkFrame::Text(frame)) {
                if let LinkFrame::Text(frame) = err.0 {
                    slot.queue.push_front(frame);
                }
                break;
            }
            flushed += 1;
        }

        slot.outbound = Some(outbound);
        slot.attempts = 0;
        slot.degraded_run = 0;
        slot.connecting = None;
        slot.set_state(ChannelState::Open);
        slot.heartbeat = Some(self.spawn_heartbeat(kind, generation));
        slot.reader = Some(self.spawn_reader(kind, generation, inbound));
        drop(slots);

        tracing::info!(kind = %kind, flushed, "Channel open");
        self.emit_state(kind, ChannelState::Open);
    }

    fn spawn_heartbeat(self: &Arc<Self>, kind: ChannelKind, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !inner.send_heartbeat(kind, generation) {
                    break;
                }
            }
        })
    }

    fn send_heartbeat(&self, kind: ChannelKind, generation: u64) -> bool {
        let Ok(frame) = Envelope::bare(SignalingMessage::Ping).encode() else {
            return false;
        };
        let slots = self.slots.lock();
        let Some(slot) = slots.get(&kind) else {
            return false;
        };
        if slot.generation != generation || slot.state != ChannelState::Open {
            return false;
        }
        tracing::trace!(kind = %kind, "Keep-alive");
        slot.outbound
            .as_ref()
            .is_some_and(|out| out.send(LinkFrame::Text(frame)).is_ok())
    }

    fn spawn_reader(
        self: &Arc<Self>,
        kind: ChannelKind,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match event {
                    LinkEvent::Text(frame) => inner.on_frame(kind, &frame),
                    LinkEvent::Closed(info) => {
                        inner.on_closed(kind, generation, info);
                        return;
                    }
                }
            }
            inner.on_closed(kind, generation, CloseInfo::abnormal("link dropped"));
        })
    }

    fn on_frame(&self, kind: ChannelKind, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(kind = %kind, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        if matches!(envelope.message, SignalingMessage::Ping) {
            return;
        }
        if !self.dedup.lock().accept(&envelope) {
            tracing::trace!(kind = %kind, seq = ?envelope.seq, "Duplicate envelope dropped");
            return;
        }
        tracing::trace!(
            kind = %kind,
            message_type = message_type(&envelope.message),
            "Inbound message"
        );
        self.feeds
            .lock()
            .retain(|feed| feed.send(envelope.clone()).is_ok());
        self.emit(ChannelEvent::Message { kind, envelope });
    }

    fn on_closed(self: &Arc<Self>, kind: ChannelKind, generation: u64, info: CloseInfo) {
        let mut events = Vec::new();
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&kind) else {
                return;
            };
            if slot.generation != generation {
                return;
            }

            if let Some(heartbeat) = slot.heartbeat.take() {
                heartbeat.abort();
            }
            // Called from the reader or connect task itself; detach only.
            slot.reader = None;
            slot.connecting = None;
            slot.outbound = None;

            if info.code == Some(NORMAL_CLOSURE) {
                tracing::info!(kind = %kind, reason = %info.reason, "Channel closed by remote");
                slot.degraded_run = 0;
                if slot.set_state(ChannelState::Closed) {
                    events.push(ChannelEvent::StateChanged {
                        kind,
                        state: ChannelState::Closed,
                    });
                }
            } else {
                if info.code == Some(ABNORMAL_CLOSURE) {
                    slot.degraded_run += 1;
                    if slot.degraded_run >= DEGRADED_THRESHOLD {
                        slot.degraded_run = 0;
                        tracing::warn!(kind = %kind, "Transport degraded");
                        events.push(ChannelEvent::TransportDegraded { kind });
                    }
                } else {
                    slot.degraded_run = 0;
                }

                slot.attempts += 1;
                if slot.attempts > self.config.max_reconnect_attempts {
                    tracing::error!(
                        kind = %kind,
                        attempts = slot.attempts - 1,
                        "Reconnect attempts exhausted"
                    );
                    // A later open or lazy send starts a fresh backoff run.
                    slot.attempts = 0;
                    slot.degraded_run = 0;
                    slot.set_state(ChannelState::Closed);
                    events.push(ChannelEvent::StateChanged {
                        kind,
                        state: ChannelState::Closed,
                    });
                    events.push(ChannelEvent::ConnectionLost { kind });
                } else {
                    let attempt = slot.attempts;
                    let delay = self.config.backoff_delay(attempt);
                    slot.generation += 1;
                    let next = slot.generation;
                    slot.reassert = true;
                    if slot.set_state(ChannelState::Connecting) {
                        events.push(ChannelEvent::StateChanged {
                            kind,
                            state: ChannelState::Connecting,
                        });
                    }
                    tracing::warn!(
                        kind = %kind,
                        code = ?info.code,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Channel dropped, reconnecting"
                    );
                    let inner = Arc::clone(self);
                    slot.reconnect = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.connect(kind, next).await;
                    }));
                    events.push(ChannelEvent::Reconnecting {
                        kind,
                        attempt,
                        delay,
                    });
                }
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    fn send_frame(self: &Arc<Self>, kind: ChannelKind, frame: String) -> SendOutcome {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(kind)
            .or_insert_with(|| Slot::new(self.config.queue_capacity));

        let mut frame = frame;
        if slot.state == ChannelState::Open {
            if let Some(out) = &slot.outbound {
                match out.send(LinkFrame::Text(frame)) {
                    Ok(()) => return SendOutcome::Sent,
                    Err(err) => match err.0 {
                        LinkFrame::Text(unsent) => frame = unsent,
                        LinkFrame::Close => return SendOutcome::Queued,
                    },
                }
            }
        }

        if let Some(dropped) = slot.queue.push(frame) {
            tracing::warn!(
                kind = %kind,
                dropped_bytes = dropped.len(),
                capacity = self.config.queue_capacity,
                "Outbound queue full, dropped oldest frame"
            );
        }
        if slot.state == ChannelState::Closed {
            self.start_attempt(kind, slot);
        }
        SendOutcome::Queued
    }

    fn close(&self, kind: ChannelKind) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&kind) else {
            return;
        };
        if slot.state == ChannelState::Closed {
            return;
        }
        slot.set_state(ChannelState::Closing);
        slot.generation += 1;
        slot.abort_tasks();
        if let Some(out) = slot.outbound.take() {
            let _ = out.send(LinkFrame::Close);
        }
        slot.attempts = 0;
        slot.degraded_run = 0;
        slot.reassert = false;
        slot.set_state(ChannelState::Closed);
        drop(slots);

        tracing::info!(kind = %kind, "Channel closed");
        self.emit_state(kind, ChannelState::Closed);
    }
}

async fn wait_until_open(rx: &mut watch::Receiver<ChannelState>) -> bool {
    loop {
        match *rx.borrow_and_update() {
            ChannelState::Open => return true,
            ChannelState::Closed => return false,
            ChannelState::Connecting | ChannelState::Closing => {}
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Transport channel manager
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    /// Create a manager; no channel is opened until `open` or `send`
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn ChannelConnector>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let dedup = Deduplicator::new(config.dedup_window);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                identity,
                slots: Mutex::new(HashMap::new()),
                events,
                feeds: Mutex::new(Vec::new()),
                stamper: SequenceStamper::new(),
                dedup: Mutex::new(dedup),
            }),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Subscribe to channel events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Every accepted inbound envelope, in arrival order and without loss.
    ///
    /// Unlike [`subscribe_events`](Self::subscribe_events) a slow reader
    /// never misses an envelope; the feed is unbounded.
    pub fn inbound_feed(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.feeds.lock().push(tx);
        rx
    }

    /// Open a channel, waiting until it is open.
    ///
    /// Idempotent: a channel already connecting or open is not reconnected,
    /// and concurrent callers wait on the same attempt.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the channel is not open within the configured
    /// timeout, or `Closed` if it was closed or lost while waiting.
    #[tracing::instrument(skip(self), fields(kind = %kind))]
    pub async fn open(&self, kind: ChannelKind) -> Result<(), TransportError> {
        let mut rx = {
            let mut slots = self.inner.slots.lock();
            let slot = slots
                .entry(kind)
                .or_insert_with(|| Slot::new(self.inner.config.queue_capacity));
            if matches!(slot.state, ChannelState::Closed | ChannelState::Closing) {
                self.inner.start_attempt(kind, slot);
            }
            slot.state_tx.subscribe()
        };

        match tokio::time::timeout(self.inner.config.connect_timeout(), wait_until_open(&mut rx))
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::Closed(kind)),
            Err(_) => {
                tracing::warn!(kind = %kind, "Channel open timed out");
                Err(TransportError::Timeout(kind))
            }
        }
    }

    /// Open every channel kind concurrently
    ///
    /// # Errors
    ///
    /// Returns the first error; the other channels keep trying.
    pub async fn open_all(&self) -> Result<(), TransportError> {
        let results = futures::future::join_all(ChannelKind::ALL.iter().map(|k| self.open(*k))).await;
        results.into_iter().collect()
    }

    /// Send an envelope on a channel.
    ///
    /// Written immediately when the channel is open, otherwise queued; a
    /// channel that is closed is opened lazily.
    ///
    /// # Errors
    ///
    /// Returns error if the envelope cannot be encoded
    pub fn send(
        &self,
        kind: ChannelKind,
        envelope: &Envelope,
    ) -> Result<SendOutcome, TransportError> {
        let frame = envelope.encode()?;
        Ok(self.inner.send_frame(kind, frame))
    }

    /// Channels a message goes to under the configured delivery mode
    #[must_use]
    pub fn route(&self, message: &SignalingMessage) -> Route {
        match message.class() {
            MessageClass::CallSignaling(call_kind) => {
                let mirrors = match self.inner.config.delivery_mode {
                    DeliveryMode::Sequenced => Vec::new(),
                    DeliveryMode::Mirrored => vec![ChannelKind::Chat, ChannelKind::Legacy],
                };
                Route {
                    primary: ChannelKind::for_call(call_kind),
                    mirrors,
                }
            }
            MessageClass::Chat | MessageClass::Control => Route {
                primary: ChannelKind::Chat,
                mirrors: Vec::new(),
            },
            MessageClass::Unclassified => Route {
                primary: ChannelKind::Legacy,
                mirrors: Vec::new(),
            },
        }
    }

    /// Stamp, route and send a message
    ///
    /// # Errors
    ///
    /// Returns error if no principal is available or the message cannot be
    /// encoded. Failures on mirror channels are logged only.
    pub fn dispatch(&self, message: SignalingMessage) -> Result<Envelope, TransportError> {
        let principal = self
            .inner
            .identity
            .principal()
            .ok_or(TransportError::Unauthenticated)?;
        let route = self.route(&message);
        let envelope = self.inner.stamper.stamp(&principal.user_id, message);

        let outcome = self.send(route.primary, &envelope)?;
        tracing::debug!(
            kind = %route.primary,
            message_type = message_type(&envelope.message),
            seq = ?envelope.seq,
            outcome = ?outcome,
            "Dispatched signaling message"
        );
        for mirror in route.mirrors {
            if let Err(e) = self.send(mirror, &envelope) {
                tracing::debug!(kind = %mirror, error = %e, "Mirror send failed");
            }
        }
        Ok(envelope)
    }

    /// Close a channel; no reconnect follows
    pub fn close(&self, kind: ChannelKind) {
        self.inner.close(kind);
    }

    /// Close every channel
    pub fn close_all(&self) {
        for kind in ChannelKind::ALL {
            self.inner.close(kind);
        }
    }

    /// Current state of a channel
    #[must_use]
    pub fn state(&self, kind: ChannelKind) -> ChannelState {
        self.inner
            .slots
            .lock()
            .get(&kind)
            .map_or(ChannelState::Closed, |slot| slot.state)
    }

    /// Frames queued on a channel
    #[must_use]
    pub fn queued(&self, kind: ChannelKind) -> usize {
        self.inner
            .slots
            .lock()
            .get(&kind)
            .map_or(0, |slot| slot.queue.len())
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(feature = "ws-connector")]
mod websocket {
    use super::{
        ChannelConnector, ChannelKind, ChannelLink, CloseInfo, LinkEvent, LinkFrame,
        TransportError, NO_STATUS_CLOSURE,
    };
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    /// WebSocket connector built on tokio-tungstenite
    #[derive(Debug, Clone, Default)]
    pub struct WebSocketConnector;

    impl WebSocketConnector {
        /// Create a connector
        #[must_use]
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl ChannelConnector for WebSocketConnector {
        async fn connect(
            &self,
            kind: ChannelKind,
            endpoint: &Url,
        ) -> Result<ChannelLink, TransportError> {
            let (ws_stream, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

            tracing::debug!(kind = %kind, "WebSocket connected");

            let (mut write, mut read) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<LinkFrame>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let result = match frame {
                        LinkFrame::Text(text) => write.send(Message::Text(text)).await,
                        LinkFrame::Close => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    };
                    if let Err(e) = result {
                        tracing::warn!(kind = %kind, error = %e, "WebSocket write failed");
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if in_tx.send(LinkEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            let info = frame.map_or_else(
                                || CloseInfo::with_code(NO_STATUS_CLOSURE, ""),
                                |f| CloseInfo::with_code(u16::from(f.code), f.reason.to_string()),
                            );
                            let _ = in_tx.send(LinkEvent::Closed(info));
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = in_tx.send(LinkEvent::Closed(CloseInfo::abnormal(e.to_string())));
                            return;
                        }
                    }
                }
                let _ = in_tx.send(LinkEvent::Closed(CloseInfo::abnormal("stream ended")));
            });

            Ok(ChannelLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }
}

#[cfg(feature = "ws-connector")]
pub use websocket::WebSocketConnector;
