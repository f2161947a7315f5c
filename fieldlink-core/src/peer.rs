//! Peer connection abstraction
//!
//! A [`PeerLink`] is one negotiated media connection to one remote
//! participant. The registry drives links through the
//! [`PeerConnectionFactory`] seam; the `webrtc-backend` feature provides an
//! implementation on the `webrtc` crate.

use crate::identity::UserId;
use crate::media::{MediaError, MediaTrack};
use crate::types::{IceCandidate, SessionDescription, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Negotiation errors
#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    /// No record for the peer
    #[error("Peer not found: {0}")]
    PeerNotFound(UserId),

    /// Peer connection backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Description rejected
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Operation not valid in the record's current state
    #[error("Peer {peer_id} is in state {state:?}")]
    InvalidState {
        /// Peer
        peer_id: UserId,
        /// Current negotiation state
        state: NegotiationState,
    },

    /// Record was replaced or destroyed while the operation was in flight
    #[error("Stale negotiation for peer {0}")]
    Stale(UserId),

    /// Both sides offered; the remote offer lost the tie-break
    #[error("Offer collision with peer {0}")]
    Glare(UserId),

    /// Local media could not be acquired
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Negotiation state of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Created, nothing exchanged
    New,
    /// Local offer applied, awaiting answer
    OfferCreated,
    /// Remote offer applied
    OfferReceived,
    /// Offer and answer both applied
    AnswerExchanged,
    /// Transport connecting
    Connecting,
    /// Transport connected
    Connected,
    /// Transport lost, recovering
    Reconnecting,
    /// Transport failed
    Failed,
    /// Closed
    Closed,
}

impl NegotiationState {
    /// Terminal states destroy the record
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Transport has been brought up at least once
    #[must_use]
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

/// Offerer or answerer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Created the offer
    Offerer,
    /// Answered a remote offer
    Answerer,
}

/// Aggregate connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    /// Created
    New,
    /// Connecting
    Connecting,
    /// Connected
    Connected,
    /// Temporarily unreachable
    Disconnected,
    /// Failed
    Failed,
    /// Closed
    Closed,
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    /// Gathering not started
    New,
    /// Checking candidate pairs
    Checking,
    /// A usable pair was found
    Connected,
    /// Checking finished
    Completed,
    /// Connectivity lost
    Disconnected,
    /// No usable pair
    Failed,
    /// Shut down
    Closed,
}

/// Offer/answer signaling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied
    HaveLocalOffer,
    /// Remote offer applied
    HaveRemoteOffer,
    /// Closed
    Closed,
}

/// A remote track that arrived on a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    /// Track identifier
    pub id: String,
    /// Remote stream identifier
    pub stream_id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// Observations published by a link
#[derive(Debug, Clone)]
pub enum PeerLinkEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrackInfo),
    /// Aggregate state changed
    ConnectionState(PeerConnectionState),
    /// ICE state changed
    IceState(IceConnectionState),
    /// Signaling state changed
    SignalingState(SignalingState),
}

/// Handle to an outbound sender on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId {
    /// Link-local identifier
    pub id: u64,
    /// Kind of track it sends
    pub kind: TrackKind,
}

/// Offer construction options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    /// Request an audio section even without a local audio track
    pub offer_audio: bool,
    /// Request a video section even without a local video track
    pub offer_video: bool,
    /// Regenerate ICE credentials
    pub ice_restart: bool,
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// STUN/TURN URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// One negotiated media connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track on a new send/receive sender
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId, NegotiationError>;

    /// Swap the track on an existing sender without renegotiation
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<MediaTrack>,
    ) -> Result<(), NegotiationError>;

    /// Make sure a bidirectional pathway of `kind` exists, carrying `track`
    /// when given. Returns the sender added, if any.
    async fn ensure_bidirectional(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<Option<SenderId>, NegotiationError>;

    /// Build an offer
    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError>;

    /// Build an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a local description
    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply a remote description
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    /// Close the connection
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates links
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a link to `peer_id` publishing observations on `events`
    async fn create(
        &self,
        peer_id: &UserId,
        events: mpsc::UnboundedSender<PeerLinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
