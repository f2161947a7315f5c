//! Session orchestration
//!
//! A [`Session`] owns one instance of every component, feeds inbound
//! signaling into them and sends their outbound negotiation traffic back out
//! on the channels. Independent sessions never share state.

use crate::call::{CallConfig, CallError, CallManager};
use crate::channels::{ChannelConfig, ChannelConnector, ChannelEvent, ChannelManager, TransportError};
use crate::group::{GroupCallOrchestrator, GroupConfig, GroupError, GroupEvent, GroupRoster, RosterService};
use crate::identity::{conversation_id, GroupId, IdentityProvider, UserId};
use crate::media::{CaptureBackend, MediaConfig, MediaError, MediaEvent, MediaManager, StaticCaptureBackend};
use crate::peer::{NegotiationError, PeerConnectionFactory};
use crate::registry::{PeerEvent, PeerRegistry, RegistryConfig};
use crate::signaling::{message_type, Envelope, SignalingMessage};
use crate::types::{CallEvent, CallId, CallKind, Counterpart, TrackKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No principal available
    #[error("Not authenticated")]
    Unauthenticated,

    /// Call error
    #[error(transparent)]
    Call(#[from] CallError),

    /// Group call error
    #[error(transparent)]
    Group(#[from] GroupError),

    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Negotiation error
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Media error
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Top-level session events
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Channel event
    Channel(ChannelEvent),
    /// Call event
    Call(CallEvent),
    /// Group call event
    Group(GroupEvent),
    /// Media event
    Media(MediaEvent),
    /// Inbound chat message
    Chat {
        /// Conversation
        conversation_id: String,
        /// Sender
        from: Option<UserId>,
        /// Opaque content
        payload: Value,
    },
}

/// Session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Channel manager config
    pub channels: ChannelConfig,
    /// Media config
    pub media: MediaConfig,
    /// Registry config
    pub registry: RegistryConfig,
    /// Call manager config
    pub calls: CallConfig,
    /// Group call config
    pub group: GroupConfig,
    /// Coordination layer base URL; derived from the channel base URL when unset
    pub roster_url: Option<String>,
}

impl SessionConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is invalid
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json).map_err(|e| SessionError::ConfigError(e.to_string()))
    }

    /// Load a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SessionError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Coordination layer base URL
    #[must_use]
    pub fn roster_base_url(&self) -> String {
        if let Some(url) = &self.roster_url {
            return url.clone();
        }
        let base = &self.channels.base_url;
        if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            base.clone()
        }
    }
}

/// Session builder
pub struct SessionBuilder {
    config: SessionConfig,
    identity: Arc<dyn IdentityProvider>,
    connector: Option<Arc<dyn ChannelConnector>>,
    capture: Option<Arc<dyn CaptureBackend>>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
    roster: Option<Arc<dyn RosterService>>,
}

impl SessionBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            config: SessionConfig::default(),
            identity,
            connector: None,
            capture: None,
            peer_factory: None,
            roster: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the channel connector
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the capture backend
    #[must_use]
    pub fn with_capture_backend(mut self, capture: Arc<dyn CaptureBackend>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Set the peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Set the roster service
    #[must_use]
    pub fn with_roster_service(mut self, roster: Arc<dyn RosterService>) -> Self {
        self.roster = Some(roster);
        self
    }

    fn connector(&mut self) -> Result<Arc<dyn ChannelConnector>, SessionError> {
        if let Some(connector) = self.connector.take() {
            return Ok(connector);
        }
        #[cfg(feature = "ws-connector")]
        {
            Ok(Arc::new(crate::channels::WebSocketConnector::new()))
        }
        #[cfg(not(feature = "ws-connector"))]
        {
            Err(SessionError::InitError("no channel connector configured".to_string()))
        }
    }

    fn peer_factory(&mut self) -> Result<Arc<dyn PeerConnectionFactory>, SessionError> {
        if let Some(factory) = self.peer_factory.take() {
            return Ok(factory);
        }
        #[cfg(feature = "webrtc-backend")]
        {
            let factory = crate::webrtc_peer::WebRtcPeerFactory::new(self.config.registry.ice_servers.clone())?;
            Ok(Arc::new(factory))
        }
        #[cfg(not(feature = "webrtc-backend"))]
        {
            Err(SessionError::InitError("no peer connection factory configured".to_string()))
        }
    }

    fn roster(&mut self) -> Result<Arc<dyn RosterService>, SessionError> {
        if let Some(roster) = self.roster.take() {
            return Ok(roster);
        }
        #[cfg(feature = "http-roster")]
        {
            let base = url::Url::parse(&self.config.roster_base_url())
                .map_err(|e| SessionError::ConfigError(format!("roster url: {e}")))?;
            Ok(Arc::new(crate::group::HttpRosterService::new(base, Arc::clone(&self.identity))))
        }
        #[cfg(not(feature = "http-roster"))]
        {
            Err(SessionError::InitError("no roster service configured".to_string()))
        }
    }

    /// Build the session and start its event pumps.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if no principal is available or a default component
    /// cannot be created
    pub async fn build(mut self) -> Result<Session, SessionError> {
        let principal = self.identity.principal().ok_or(SessionError::Unauthenticated)?;
        let connector = self.connector()?;
        let peer_factory = self.peer_factory()?;
        let roster = self.roster()?;
        let capture = self
            .capture
            .take()
            .unwrap_or_else(|| Arc::new(StaticCaptureBackend::with_default_devices()));

        let config = self.config;
        let channels = Arc::new(ChannelManager::new(
            config.channels.clone(),
            connector,
            Arc::clone(&self.identity),
        ));
        let media = Arc::new(MediaManager::new(capture, config.media.clone()));
        let registry = Arc::new(PeerRegistry::new(
            principal.user_id.clone(),
            config.registry.clone(),
            peer_factory,
            Arc::clone(&media),
        ));
        let calls = Arc::new(CallManager::new(
            config.calls.clone(),
            Arc::clone(&channels),
            Arc::clone(&registry),
        ));
        let groups = Arc::new(GroupCallOrchestrator::new(
            config.group.clone(),
            Arc::clone(&channels),
            Arc::clone(&registry),
            Arc::clone(&calls),
            roster,
        ));
        let (event_sender, _) = broadcast::channel(1000);

        let session = Session {
            local_id: principal.user_id,
            config,
            channels,
            media,
            registry,
            calls,
            groups,
            event_sender,
            tasks: parking_lot::Mutex::new(Vec::new()),
        };
        session.spawn_pumps();
        tracing::info!(user_id = %session.local_id, "Session started");
        Ok(session)
    }
}

/// Forward one broadcast stream into the session stream
fn forward<T, F>(mut rx: broadcast::Receiver<T>, events: broadcast::Sender<SessionEvent>, wrap: F) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> SessionEvent + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = events.send(wrap(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Routes inbound signaling to the components
#[derive(Clone)]
struct Inbound {
    local_id: UserId,
    registry: Arc<PeerRegistry>,
    calls: Arc<CallManager>,
    groups: Arc<GroupCallOrchestrator>,
    events: broadcast::Sender<SessionEvent>,
}

impl Inbound {
    fn addressed_to_me(&self, target: &str) -> bool {
        target == self.local_id.as_str()
    }

    async fn handle(&self, envelope: Envelope) {
        let kind = message_type(&envelope.message);
        let Some(from) = envelope.from.clone() else {
            if let SignalingMessage::Chat {
                conversation_id,
                payload,
            } = envelope.message
            {
                let _ = self.events.send(SessionEvent::Chat {
                    conversation_id,
                    from: None,
                    payload,
                });
            } else {
                tracing::debug!(message_type = kind, "Dropping unattributed message");
            }
            return;
        };
        if from == self.local_id {
            tracing::trace!(message_type = kind, "Ignoring own echo");
            return;
        }
        tracing::trace!(message_type = kind, from = %from, seq = ?envelope.seq, "Inbound message");

        let result: Result<(), SessionError> = match envelope.message {
            SignalingMessage::CallOffer {
                target_id,
                is_room,
                call_id,
                sdp,
                call_kind,
            } => {
                if is_room || self.addressed_to_me(&target_id) {
                    self.calls
                        .on_offer(from, call_id, sdp, call_kind)
                        .await
                        .map_err(Into::into)
                } else {
                    Ok(())
                }
            }
            SignalingMessage::CallAnswer {
                call_id,
                target_id,
                sdp,
                call_kind,
            } if self.addressed_to_me(&target_id) => self
                .calls
                .on_answer(from, call_id, sdp, call_kind)
                .await
                .map_err(Into::into),
            SignalingMessage::CallIceCandidate {
                target_id,
                candidate,
                ..
            } if self.addressed_to_me(&target_id) => {
                self.registry.add_remote_candidate(&from, candidate).await;
                Ok(())
            }
            SignalingMessage::CallEnd {
                call_id, target_id, ..
            } if self.addressed_to_me(&target_id) => {
                self.calls.on_remote_end(&from, call_id).await;
                Ok(())
            }
            SignalingMessage::GroupCallOffer {
                room_id,
                peer_id,
                sdp,
                call_kind,
            } if peer_id == self.local_id => self
                .groups
                .on_offer(&room_id, &from, sdp, call_kind)
                .await
                .map_err(Into::into),
            SignalingMessage::GroupCallAnswer {
                room_id,
                peer_id,
                sdp,
                call_kind,
            } if peer_id == self.local_id => self
                .groups
                .on_answer(&room_id, &from, sdp, call_kind)
                .await
                .map_err(Into::into),
            SignalingMessage::GroupCallIceCandidate {
                room_id,
                peer_id,
                candidate,
                ..
            } if peer_id == self.local_id => {
                self.groups.on_candidate(&room_id, &from, candidate).await;
                Ok(())
            }
            SignalingMessage::GroupCallUserJoined { room_id, user_id, .. } => {
                self.groups.on_member_joined(&room_id, &user_id).await;
                Ok(())
            }
            SignalingMessage::GroupCallUserLeft { room_id, user_id, .. } => {
                self.groups.on_member_left(&room_id, &user_id).await;
                Ok(())
            }
            SignalingMessage::GroupCallEnd { room_id, .. } => {
                self.groups.on_group_end(&room_id).await;
                Ok(())
            }
            SignalingMessage::Chat {
                conversation_id,
                payload,
            } => {
                let _ = self.events.send(SessionEvent::Chat {
                    conversation_id,
                    from: Some(from),
                    payload,
                });
                Ok(())
            }
            _ => {
                tracing::trace!(message_type = kind, "Message not handled");
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(message_type = kind, error = %e, "Inbound message failed");
        }
    }

    async fn on_peer_event(&self, channels: &ChannelManager, event: PeerEvent) {
        let outbound = match event {
            PeerEvent::LocalCandidate {
                peer_id,
                call_kind,
                candidate,
            } => match self.groups.group_for_peer(&peer_id).await {
                Some(room_id) => Some(SignalingMessage::GroupCallIceCandidate {
                    room_id,
                    peer_id,
                    candidate,
                    call_kind,
                }),
                None => Some(SignalingMessage::CallIceCandidate {
                    target_id: peer_id.to_string(),
                    call_id: self.calls.call_for_peer(&peer_id).await,
                    candidate,
                    call_kind,
                }),
            },
            PeerEvent::RestartOffer {
                peer_id,
                call_kind,
                offer,
            } => {
                if let Some(room_id) = self.groups.group_for_peer(&peer_id).await {
                    Some(SignalingMessage::GroupCallOffer {
                        room_id,
                        peer_id,
                        sdp: offer.sdp,
                        call_kind,
                    })
                } else if let Some(call_id) = self.calls.call_for_peer(&peer_id).await {
                    Some(SignalingMessage::CallOffer {
                        target_id: peer_id.to_string(),
                        is_room: false,
                        call_id,
                        sdp: offer.sdp,
                        call_kind,
                    })
                } else {
                    tracing::debug!(peer_id = %peer_id, "Restart offer for a peer without a call");
                    None
                }
            }
            PeerEvent::StateChanged { peer_id, state } => {
                self.calls.on_peer_state(&peer_id, state).await;
                self.groups.on_peer_state(&peer_id, state).await;
                None
            }
            PeerEvent::RemoteTrack { .. } | PeerEvent::Destroyed { .. } => None,
        };
        if let Some(message) = outbound {
            if let Err(e) = channels.dispatch(message) {
                tracing::warn!(error = %e, "Failed to send negotiation message");
            }
        }
    }
}

/// A signed-in client session
pub struct Session {
    local_id: UserId,
    config: SessionConfig,
    channels: Arc<ChannelManager>,
    media: Arc<MediaManager>,
    registry: Arc<PeerRegistry>,
    calls: Arc<CallManager>,
    groups: Arc<GroupCallOrchestrator>,
    event_sender: broadcast::Sender<SessionEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a builder
    #[must_use]
    pub fn builder(identity: Arc<dyn IdentityProvider>) -> SessionBuilder {
        SessionBuilder::new(identity)
    }

    fn spawn_pumps(&self) {
        let inbound = Inbound {
            local_id: self.local_id.clone(),
            registry: Arc::clone(&self.registry),
            calls: Arc::clone(&self.calls),
            groups: Arc::clone(&self.groups),
            events: self.event_sender.clone(),
        };

        let mut envelopes = self.channels.inbound_feed();
        let channel_inbound = inbound.clone();
        let channel_pump = tokio::spawn(async move {
            while let Some(envelope) = envelopes.recv().await {
                channel_inbound.handle(envelope).await;
            }
        });

        let mut peer_events = self.registry.event_feed();
        let channels = Arc::clone(&self.channels);
        let peer_pump = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                inbound.on_peer_event(&channels, event).await;
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(channel_pump);
        tasks.push(peer_pump);
        tasks.push(forward(self.channels.subscribe_events(), self.event_sender.clone(), SessionEvent::Channel));
        tasks.push(forward(self.calls.subscribe_events(), self.event_sender.clone(), SessionEvent::Call));
        tasks.push(forward(self.groups.subscribe_events(), self.event_sender.clone(), SessionEvent::Group));
        tasks.push(forward(self.media.subscribe_events(), self.event_sender.clone(), SessionEvent::Media));
    }

    /// Local participant
    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Channel manager
    #[must_use]
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Media manager
    #[must_use]
    pub fn media(&self) -> &Arc<MediaManager> {
        &self.media
    }

    /// Peer connection registry
    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Call manager
    #[must_use]
    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    /// Group call orchestrator
    #[must_use]
    pub fn groups(&self) -> &Arc<GroupCallOrchestrator> {
        &self.groups
    }

    /// Subscribe to events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Open every channel
    ///
    /// # Errors
    ///
    /// Returns error if a channel does not open in time
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.channels.open_all().await?;
        tracing::info!("Channels open");
        Ok(())
    }

    /// Call a peer
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be placed
    pub async fn start_call(&self, peer: UserId, call_kind: CallKind) -> Result<CallId, SessionError> {
        Ok(self.calls.start_call(Counterpart::Peer(peer), call_kind).await?)
    }

    /// Accept an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be accepted
    pub async fn accept_call(&self, call_id: CallId) -> Result<(), SessionError> {
        Ok(self.calls.accept(call_id).await?)
    }

    /// Reject an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be rejected
    pub async fn reject_call(&self, call_id: CallId) -> Result<(), SessionError> {
        Ok(self.calls.reject(call_id).await?)
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be ended
    pub async fn end_call(&self, call_id: CallId) -> Result<(), SessionError> {
        Ok(self.calls.end(call_id).await?)
    }

    /// Start a group call as its creator
    ///
    /// # Errors
    ///
    /// Returns error if presence cannot be announced
    pub async fn create_group_call(&self, group_id: &GroupId, call_kind: CallKind) -> Result<GroupRoster, SessionError> {
        Ok(self.groups.create(group_id, call_kind).await?)
    }

    /// Join a group call
    ///
    /// # Errors
    ///
    /// Returns error if the group has no active call
    pub async fn join_group_call(&self, group_id: &GroupId, call_kind: CallKind) -> Result<GroupRoster, SessionError> {
        Ok(self.groups.join(group_id, call_kind).await?)
    }

    /// Leave a group call
    ///
    /// # Errors
    ///
    /// Returns error if the group is not joined
    pub async fn leave_group_call(&self, group_id: &GroupId) -> Result<(), SessionError> {
        Ok(self.groups.leave(group_id).await?)
    }

    /// Send a chat message to a peer
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be sent
    pub fn send_chat(&self, peer: &UserId, payload: Value) -> Result<Envelope, SessionError> {
        let message = SignalingMessage::Chat {
            conversation_id: conversation_id(&self.local_id, peer),
            payload,
        };
        Ok(self.channels.dispatch(message)?)
    }

    /// Rotate to the next camera on every connection
    ///
    /// # Errors
    ///
    /// Returns error if no other camera can be captured
    pub async fn switch_camera(&self) -> Result<usize, SessionError> {
        Ok(self.registry.switch_video_source().await?)
    }

    /// Enable or disable outbound audio or video
    ///
    /// # Errors
    ///
    /// Returns error if enabling video requires an acquisition that fails
    pub async fn set_media_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), SessionError> {
        Ok(self.registry.set_track_enabled(kind, enabled).await?)
    }

    /// End every call, leave every group and close the channels
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        for group_id in self.groups.groups().await {
            if let Err(e) = self.groups.leave(&group_id).await {
                tracing::debug!(group_id = %group_id, error = %e, "Leave during shutdown failed");
            }
        }
        for call in self.calls.active_calls().await {
            if let Err(e) = self.calls.end(call.id).await {
                tracing::debug!(call_id = %call.id, error = %e, "End during shutdown failed");
            }
        }
        self.registry.destroy_all().await;
        self.media.release();
        self.channels.close_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Session shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
