//! Shared call and negotiation types

use crate::identity::{GroupId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Audio or video: decides which local tracks a negotiation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl CallKind {
    /// Whether the call carries video
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Track kinds a negotiation of this kind must carry
    #[must_use]
    pub fn track_kinds(self) -> &'static [TrackKind] {
        match self {
            Self::Audio => &[TrackKind::Audio],
            Self::Video => &[TrackKind::Audio, TrackKind::Video],
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Kind of a single media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone or other audio source
    Audio,
    /// Camera or synthetic video source
    Video,
}

impl TrackKind {
    /// SDP media section name (`m=audio` / `m=video`)
    #[must_use]
    pub fn sdp_media(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Whether a call is one-to-one or attached to a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallScope {
    /// One-to-one call
    Direct,
    /// Multi-party room call
    Room,
}

/// The other side of a call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Counterpart {
    /// Remote participant of a direct call
    Peer(UserId),
    /// Room of a group call
    Room(GroupId),
}

impl std::fmt::Display for Counterpart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer(id) => write!(f, "peer:{id}"),
            Self::Room(id) => write!(f, "room:{id}"),
        }
    }
}

/// Call session status
///
/// Transitions are monotone except `Reconnecting <-> Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Negotiating
    Connecting,
    /// Media is flowing
    Connected,
    /// Transport degraded, recovering
    Reconnecting,
    /// Ended normally
    Ended,
    /// Negotiation or connection failed
    Failed,
}

impl CallStatus {
    /// Terminal statuses accept no further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Negotiation offer
    Offer,
    /// Negotiation answer
    Answer,
}

/// A session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Whether the body declares a media section of the given kind
    #[must_use]
    pub fn has_media(&self, kind: TrackKind) -> bool {
        let needle = format!("m={} ", kind.sdp_media());
        self.sdp.lines().any(|line| line.trim_start().starts_with(&needle))
    }

    /// Track kinds expected for `call_kind` but missing from the body
    #[must_use]
    pub fn missing_media(&self, call_kind: CallKind) -> Vec<TrackKind> {
        call_kind
            .track_kinds()
            .iter()
            .copied()
            .filter(|kind| !self.has_media(*kind))
            .collect()
    }
}

/// ICE candidate exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute value
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Create a candidate without media line hints
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    /// Cheap syntactic check used to drop garbage before it reaches the backend.
    ///
    /// Accepts `candidate:<foundation> <component> <transport> <priority> <ip> <port> typ <type> ...`
    /// with or without a leading `a=`.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let value = self.candidate.trim();
        let value = value.strip_prefix("a=").unwrap_or(value);
        let Some(rest) = value.strip_prefix("candidate:") else {
            return false;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        fields.len() >= 8
            && fields[1].parse::<u8>().is_ok()
            && fields[3].parse::<u32>().is_ok()
            && fields[5].parse::<u16>().is_ok()
            && fields[6] == "typ"
    }
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Incoming call received
    Incoming {
        /// Call identifier
        call_id: CallId,
        /// Caller
        from: UserId,
        /// Audio or video
        call_kind: CallKind,
    },
    /// Call initiated locally
    Initiated {
        /// Call identifier
        call_id: CallId,
        /// Who is being called
        counterpart: Counterpart,
        /// Audio or video
        call_kind: CallKind,
    },
    /// Call answered (locally or remotely)
    Answered {
        /// Call identifier
        call_id: CallId,
    },
    /// Media connected
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// Connection degraded, recovering
    Reconnecting {
        /// Call identifier
        call_id: CallId,
    },
    /// Call ended
    Ended {
        /// Call identifier
        call_id: CallId,
    },
    /// Call failed
    Failed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        error: String,
    },
}

/// Call session information
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Call identifier
    pub id: CallId,
    /// Remote peer or room
    pub counterpart: Counterpart,
    /// Direct or room
    pub scope: CallScope,
    /// Audio or video
    pub call_kind: CallKind,
    /// Current status
    pub status: CallStatus,
    /// Whether the call was placed locally
    pub outgoing: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Start time (first time connected)
    pub start_time: Option<DateTime<Utc>>,
    /// End time
    pub end_time: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create a new call session in `Connecting`
    pub fn new(id: CallId, counterpart: Counterpart, call_kind: CallKind, outgoing: bool) -> Self {
        let scope = match counterpart {
            Counterpart::Peer(_) => CallScope::Direct,
            Counterpart::Room(_) => CallScope::Room,
        };
        Self {
            id,
            counterpart,
            scope,
            call_kind,
            status: CallStatus::Connecting,
            outgoing,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        }
    }

    /// Get call duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            Some(end - start)
        } else {
            self.start_time.map(|start| Utc::now() - start)
        }
    }

    /// Remote peer of a direct call
    #[must_use]
    pub fn peer(&self) -> Option<&UserId> {
        match &self.counterpart {
            Counterpart::Peer(id) => Some(id),
            Counterpart::Room(_) => None,
        }
    }

    /// Room of a group call
    #[must_use]
    pub fn room(&self) -> Option<&GroupId> {
        match &self.counterpart {
            Counterpart::Room(id) => Some(id),
            Counterpart::Peer(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_call_kind_tracks() {
        assert_eq!(CallKind::Audio.track_kinds(), &[TrackKind::Audio]);
        assert_eq!(
            CallKind::Video.track_kinds(),
            &[TrackKind::Audio, TrackKind::Video]
        );
        assert!(CallKind::Video.has_video());
        assert!(!CallKind::Audio.has_video());
    }

    #[test]
    fn test_session_description_media_sections() {
        let sdp = "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        let offer = SessionDescription::offer(sdp);
        assert!(offer.has_media(TrackKind::Audio));
        assert!(!offer.has_media(TrackKind::Video));
        assert_eq!(offer.missing_media(CallKind::Video), vec![TrackKind::Video]);
        assert!(offer.missing_media(CallKind::Audio).is_empty());
    }

    #[test]
    fn test_candidate_validation() {
        let good = IceCandidate::new("candidate:1 1 UDP 2122260223 192.168.1.1 12345 typ host");
        assert!(good.is_well_formed());

        let prefixed =
            IceCandidate::new("a=candidate:842163049 1 udp 1677729535 203.0.113.7 51000 typ srflx");
        assert!(prefixed.is_well_formed());

        assert!(!IceCandidate::new("").is_well_formed());
        assert!(!IceCandidate::new("candidate:").is_well_formed());
        assert!(!IceCandidate::new("candidate:1 x UDP 1 1.2.3.4 99 typ host").is_well_formed());
        assert!(!IceCandidate::new("garbage").is_well_formed());
    }

    #[test]
    fn test_candidate_wire_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 1 1.2.3.4 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_call_session_scope() {
        let session = CallSession::new(
            CallId::new(),
            Counterpart::Room(GroupId::new("ops")),
            CallKind::Audio,
            true,
        );
        assert_eq!(session.scope, CallScope::Room);
        assert_eq!(session.status, CallStatus::Connecting);
        assert!(session.peer().is_none());
        assert_eq!(session.room().map(GroupId::as_str), Some("ops"));
        assert!(session.duration().is_none());
    }
}
