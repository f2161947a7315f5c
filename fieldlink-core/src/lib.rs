//! Fieldlink - real-time signaling and peer-connection orchestration
//!
//! This library lets distributed operators chat and hold live audio/video
//! calls over an unreliable network. It features:
//!
//! - **Multiplexed Channels**: Chat, voice, video and legacy signaling
//!   channels with lazy open, ordered queues and backoff reconnects
//! - **Sequenced Delivery**: Every envelope carries a sender id and sequence
//!   number; receivers drop duplicates
//! - **Peer Registry**: One negotiated connection per participant with
//!   candidate buffering and ICE restarts
//! - **Media Fallback**: Capture degrades step by step, down to a synthetic
//!   placeholder video track
//! - **Group Calls**: Server-managed or mesh strategies over a roster
//!
//! # Examples
//!
//! ```rust,no_run
//! use fieldlink_core::{CallKind, Session, StaticIdentity, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let identity = Arc::new(StaticIdentity::new("alice", "session-token"));
//! let session = Session::builder(identity).build().await?;
//!
//! // Open the signaling channels
//! session.connect().await?;
//!
//! // Place a video call
//! let call_id = session
//!     .start_call(UserId::new("bob"), CallKind::Video)
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core types and data structures
pub mod types;

/// Principals, participant ids and conversation ids
pub mod identity;

/// Signaling protocol, envelopes and deduplication
pub mod signaling;

/// Multiplexed transport channels
pub mod channels;

/// Local media acquisition with fallback
pub mod media;

/// Peer connection abstraction
pub mod peer;

/// Peer connections on the `webrtc` crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_peer;

/// Peer connection registry
pub mod registry;

/// Call session state machine
pub mod call;

/// Group call orchestration
pub mod group;

/// Session orchestration
pub mod session;

// Re-export main types at crate root
pub use call::{CallConfig, CallError, CallManager};
#[cfg(feature = "ws-connector")]
pub use channels::WebSocketConnector;
pub use channels::{
    ChannelConfig, ChannelConnector, ChannelEvent, ChannelKind, ChannelManager, ChannelState,
    DeliveryMode, TransportError,
};
#[cfg(feature = "http-roster")]
pub use group::HttpRosterService;
pub use group::{
    GroupCallOrchestrator, GroupConfig, GroupError, GroupEvent, GroupRoster, GroupStrategy,
    RosterError, RosterService, RosterSnapshot,
};
pub use identity::{conversation_id, GroupId, IdentityProvider, Principal, StaticIdentity, UserId};
pub use media::{
    AcquireConfig, CaptureBackend, MediaBundle, MediaConfig, MediaError, MediaEvent, MediaManager,
    MediaTrack, Orientation, StaticCaptureBackend,
};
pub use peer::{NegotiationError, NegotiationState, PeerConnectionFactory, PeerLink};
pub use registry::{PeerEvent, PeerRecord, PeerRegistry, RegistryConfig};
pub use session::{Session, SessionBuilder, SessionConfig, SessionError, SessionEvent};
pub use signaling::{Envelope, SignalingMessage};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_peer::WebRtcPeerFactory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallConfig, CallManager};
    pub use crate::channels::{ChannelConfig, ChannelEvent, ChannelKind, ChannelManager};
    pub use crate::group::{GroupCallOrchestrator, GroupConfig, GroupEvent, GroupStrategy};
    pub use crate::identity::{GroupId, IdentityProvider, StaticIdentity, UserId};
    pub use crate::media::{MediaConfig, MediaEvent, MediaManager};
    pub use crate::registry::{PeerEvent, PeerRegistry};
    pub use crate::session::{Session, SessionConfig, SessionEvent};
    pub use crate::signaling::SignalingMessage;
    pub use crate::types::{CallEvent, CallId, CallKind, CallStatus, TrackKind};
}
