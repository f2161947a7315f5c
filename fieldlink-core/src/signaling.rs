//! Signaling protocol
//!
//! Wire messages exchanged over the transport channels, the envelope that
//! stamps them with a sender id and sequence number, message classification
//! for channel routing, and receiver-side deduplication.

use crate::identity::{DeviceInfo, GroupId, UserId};
use crate::types::{CallId, CallKind, IceCandidate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Signaling encode/decode errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Message could not be encoded
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Identity assertion, sent first after every reconnect
    #[serde(rename_all = "camelCase")]
    Auth {
        /// Login name
        username: String,
        /// Password, when the deployment uses one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// Session token
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Client description
        device_info: DeviceInfo,
    },

    /// Keep-alive
    Ping,

    /// Direct (or room-addressed) call offer
    #[serde(rename_all = "camelCase")]
    CallOffer {
        /// Callee user id, or room id when `is_room`
        target_id: String,
        /// Whether `target_id` names a room
        #[serde(default)]
        is_room: bool,
        /// Call identifier
        call_id: CallId,
        /// Offer SDP
        sdp: String,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Answer to a call offer
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        /// Call identifier
        call_id: CallId,
        /// Caller user id
        target_id: String,
        /// Answer SDP
        sdp: String,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Trickled ICE candidate for a direct call
    #[serde(rename_all = "camelCase")]
    CallIceCandidate {
        /// Recipient user id
        target_id: String,
        /// Call identifier, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        /// The candidate
        candidate: IceCandidate,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Call hang-up or rejection
    #[serde(rename_all = "camelCase")]
    CallEnd {
        /// Call identifier
        call_id: CallId,
        /// Recipient user id
        target_id: String,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Group call offer addressed to one member
    #[serde(rename_all = "camelCase")]
    GroupCallOffer {
        /// Room
        room_id: GroupId,
        /// Recipient member
        peer_id: UserId,
        /// Offer SDP
        sdp: String,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Group call answer addressed to one member
    #[serde(rename_all = "camelCase")]
    GroupCallAnswer {
        /// Room
        room_id: GroupId,
        /// Recipient member
        peer_id: UserId,
        /// Answer SDP
        sdp: String,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Group call ICE candidate addressed to one member
    #[serde(rename_all = "camelCase")]
    GroupCallIceCandidate {
        /// Room
        room_id: GroupId,
        /// Recipient member
        peer_id: UserId,
        /// The candidate
        candidate: IceCandidate,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Member presence announcement
    #[serde(rename_all = "camelCase")]
    GroupCallUserJoined {
        /// Room
        room_id: GroupId,
        /// Member who joined
        user_id: UserId,
        /// Room call identifier, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Member departure announcement
    #[serde(rename_all = "camelCase")]
    GroupCallUserLeft {
        /// Room
        room_id: GroupId,
        /// Member who left
        user_id: UserId,
        /// Room call identifier, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Group call ended for every member
    #[serde(rename_all = "camelCase")]
    GroupCallEnd {
        /// Room
        room_id: GroupId,
        /// Audio or video
        call_kind: CallKind,
    },

    /// Chat message with an opaque payload
    #[serde(rename_all = "camelCase")]
    Chat {
        /// Conversation id, see [`crate::identity::conversation_id`]
        conversation_id: String,
        /// Opaque chat content
        payload: Value,
    },

    /// Opaque message for older peers
    Legacy {
        /// Opaque content
        payload: Value,
    },

    /// Any message type this client does not know
    #[serde(other)]
    Unknown,
}

/// Traffic class of a message, used for channel routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Negotiation or presence traffic of a call of the given kind
    CallSignaling(CallKind),
    /// Chat content
    Chat,
    /// Session control (auth, keep-alive)
    Control,
    /// Anything else
    Unclassified,
}

impl SignalingMessage {
    /// Classify for routing
    #[must_use]
    pub fn class(&self) -> MessageClass {
        match self {
            Self::CallOffer { call_kind, .. }
            | Self::CallAnswer { call_kind, .. }
            | Self::CallIceCandidate { call_kind, .. }
            | Self::CallEnd { call_kind, .. }
            | Self::GroupCallOffer { call_kind, .. }
            | Self::GroupCallAnswer { call_kind, .. }
            | Self::GroupCallIceCandidate { call_kind, .. }
            | Self::GroupCallUserJoined { call_kind, .. }
            | Self::GroupCallUserLeft { call_kind, .. }
            | Self::GroupCallEnd { call_kind, .. } => MessageClass::CallSignaling(*call_kind),
            Self::Chat { .. } => MessageClass::Chat,
            Self::Auth { .. } | Self::Ping => MessageClass::Control,
            Self::Legacy { .. } | Self::Unknown => MessageClass::Unclassified,
        }
    }

    /// Check if this message belongs to a group call
    #[must_use]
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            Self::GroupCallOffer { .. }
                | Self::GroupCallAnswer { .. }
                | Self::GroupCallIceCandidate { .. }
                | Self::GroupCallUserJoined { .. }
                | Self::GroupCallUserLeft { .. }
                | Self::GroupCallEnd { .. }
        )
    }
}

/// Helper function to extract message type for tracing
#[must_use]
pub fn message_type(msg: &SignalingMessage) -> &'static str {
    match msg {
        SignalingMessage::Auth { .. } => "auth",
        SignalingMessage::Ping => "ping",
        SignalingMessage::CallOffer { .. } => "call_offer",
        SignalingMessage::CallAnswer { .. } => "call_answer",
        SignalingMessage::CallIceCandidate { .. } => "call_ice_candidate",
        SignalingMessage::CallEnd { .. } => "call_end",
        SignalingMessage::GroupCallOffer { .. } => "group_call_offer",
        SignalingMessage::GroupCallAnswer { .. } => "group_call_answer",
        SignalingMessage::GroupCallIceCandidate { .. } => "group_call_ice_candidate",
        SignalingMessage::GroupCallUserJoined { .. } => "group_call_user_joined",
        SignalingMessage::GroupCallUserLeft { .. } => "group_call_user_left",
        SignalingMessage::GroupCallEnd { .. } => "group_call_end",
        SignalingMessage::Chat { .. } => "chat",
        SignalingMessage::Legacy { .. } => "legacy",
        SignalingMessage::Unknown => "unknown",
    }
}

/// A message as it travels on a channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Per-sender sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Sender user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<UserId>,
    /// The message itself
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl Envelope {
    /// Wrap a message without stamping it
    pub fn bare(message: SignalingMessage) -> Self {
        Self {
            seq: None,
            from: None,
            message,
        }
    }

    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized
    pub fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Encode(e.to_string()))
    }

    /// Decode a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a signaling envelope
    pub fn decode(frame: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(frame).map_err(|e| SignalingError::InvalidFrame(e.to_string()))
    }
}

/// Stamps outbound envelopes with a strictly increasing sequence number.
///
/// Numbering starts at the current wall clock in microseconds so a restarted
/// client never reuses numbers a receiver still remembers.
#[derive(Debug)]
pub struct SequenceStamper {
    next: AtomicU64,
}

impl SequenceStamper {
    /// Start numbering from the current time
    #[must_use]
    pub fn new() -> Self {
        let start = u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(1);
        Self::starting_at(start)
    }

    /// Start numbering from `start`
    #[must_use]
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Wrap and stamp `message`
    pub fn stamp(&self, from: &UserId, message: SignalingMessage) -> Envelope {
        Envelope {
            seq: Some(self.next.fetch_add(1, Ordering::Relaxed)),
            from: Some(from.clone()),
            message,
        }
    }
}

impl Default for SequenceStamper {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct SenderWindow {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

/// Receiver-side deduplication on (sender, seq) over a bounded window
#[derive(Debug)]
pub struct Deduplicator {
    window: usize,
    senders: HashMap<UserId, SenderWindow>,
}

impl Deduplicator {
    /// Remember up to `window` sequence numbers per sender
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            senders: HashMap::new(),
        }
    }

    /// Returns `true` the first time an envelope is seen.
    ///
    /// Unstamped envelopes are always accepted.
    pub fn accept(&mut self, envelope: &Envelope) -> bool {
        let (Some(from), Some(seq)) = (&envelope.from, envelope.seq) else {
            return true;
        };
        let entry = self.senders.entry(from.clone()).or_default();
        if !entry.seen.insert(seq) {
            return false;
        }
        entry.order.push_back(seq);
        while entry.order.len() > self.window {
            if let Some(old) = entry.order.pop_front() {
                entry.seen.remove(&old);
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn offer() -> SignalingMessage {
        SignalingMessage::CallOffer {
            target_id: "bob".to_string(),
            is_room: false,
            call_id: CallId::new(),
            sdp: "v=0\r\n".to_string(),
            call_kind: CallKind::Video,
        }
    }

    #[test]
    fn test_call_offer_wire_format() {
        let stamper = SequenceStamper::starting_at(7);
        let envelope = stamper.stamp(&UserId::new("alice"), offer());
        let json: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "call_offer");
        assert_eq!(json["targetId"], "bob");
        assert_eq!(json["isRoom"], false);
        assert_eq!(json["callKind"], "video");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["from"], "alice");
    }

    #[test]
    fn test_envelope_decode_roundtrip() {
        let stamper = SequenceStamper::starting_at(1);
        let envelope = stamper.stamp(&UserId::new("alice"), offer());
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_unstamped_frame() {
        let frame = r#"{"type":"group_call_user_joined","roomId":"ops","userId":"carol","callKind":"audio"}"#;
        let envelope = Envelope::decode(frame).unwrap();
        assert_eq!(envelope.seq, None);
        assert_eq!(
            envelope.message,
            SignalingMessage::GroupCallUserJoined {
                room_id: GroupId::new("ops"),
                user_id: UserId::new("carol"),
                call_id: None,
                call_kind: CallKind::Audio,
            }
        );
    }

    #[test]
    fn test_unknown_type_decodes_as_unknown() {
        let envelope = Envelope::decode(r#"{"type":"typing","who":"x"}"#).unwrap();
        assert_eq!(envelope.message, SignalingMessage::Unknown);
        assert_eq!(envelope.message.class(), MessageClass::Unclassified);
    }

    #[test]
    fn test_invalid_frame() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(SignalingError::InvalidFrame(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"seq":1}"#),
            Err(SignalingError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(offer().class(), MessageClass::CallSignaling(CallKind::Video));
        assert_eq!(SignalingMessage::Ping.class(), MessageClass::Control);
        let chat = SignalingMessage::Chat {
            conversation_id: "dm:a:b".to_string(),
            payload: serde_json::json!({"text": "hi"}),
        };
        assert_eq!(chat.class(), MessageClass::Chat);
        let end = SignalingMessage::GroupCallEnd {
            room_id: GroupId::new("ops"),
            call_kind: CallKind::Audio,
        };
        assert_eq!(end.class(), MessageClass::CallSignaling(CallKind::Audio));
        assert!(end.is_group());
        assert!(!offer().is_group());
        assert_eq!(message_type(&end), "group_call_end");
    }

    #[test]
    fn test_ping_serialization() {
        let frame = Envelope::bare(SignalingMessage::Ping).encode().unwrap();
        assert_eq!(frame, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let stamper = SequenceStamper::new();
        let from = UserId::new("alice");
        let first = stamper.stamp(&from, SignalingMessage::Ping).seq.unwrap();
        let second = stamper.stamp(&from, SignalingMessage::Ping).seq.unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_deduplicator_drops_repeats() {
        let mut dedup = Deduplicator::new(4);
        let stamper = SequenceStamper::starting_at(1);
        let envelope = stamper.stamp(&UserId::new("alice"), offer());

        assert!(dedup.accept(&envelope));
        assert!(!dedup.accept(&envelope));

        let mut other_sender = envelope.clone();
        other_sender.from = Some(UserId::new("bob"));
        assert!(dedup.accept(&other_sender));

        assert!(dedup.accept(&Envelope::bare(SignalingMessage::Ping)));
        assert!(dedup.accept(&Envelope::bare(SignalingMessage::Ping)));
    }

    #[test]
    fn test_deduplicator_window_is_bounded() {
        let mut dedup = Deduplicator::new(2);
        let stamper = SequenceStamper::starting_at(1);
        let from = UserId::new("alice");
        let first = stamper.stamp(&from, SignalingMessage::Ping);
        assert!(dedup.accept(&first));
        assert!(dedup.accept(&stamper.stamp(&from, SignalingMessage::Ping)));
        assert!(dedup.accept(&stamper.stamp(&from, SignalingMessage::Ping)));
        // Evicted from the window, so accepted again
        assert!(dedup.accept(&first));
    }
}
