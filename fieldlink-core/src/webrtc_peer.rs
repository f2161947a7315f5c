//! Peer links on the `webrtc` crate

use crate::identity::UserId;
use crate::media::MediaTrack;
use crate::peer::{
    IceConnectionState, IceServer, NegotiationError, OfferOptions, PeerConnectionFactory,
    PeerConnectionState, PeerLink, PeerLinkEvent, RemoteTrackInfo, SenderId, SignalingState,
};
use crate::types::{IceCandidate, SdpKind, SessionDescription, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn backend(err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Backend(err.to_string())
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn track_kind(codec: RTPCodecType) -> Option<TrackKind> {
    match codec {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

/// Local tracks shared by every connection, one sample track per media track
#[derive(Default)]
struct LocalTracks {
    entries: Mutex<HashMap<String, (Weak<MediaTrack>, Arc<TrackLocalStaticSample>)>>,
}

impl LocalTracks {
    fn bind(&self, track: &Arc<MediaTrack>) -> Arc<TrackLocalStaticSample> {
        let mut entries = self.entries.lock();
        entries.retain(|_, (media, _)| media.upgrade().is_some_and(|t| t.is_live()));
        let (_, sample) = entries.entry(track.id().to_string()).or_insert_with(|| {
            tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Binding local sample track");
            (
                Arc::downgrade(track),
                Arc::new(TrackLocalStaticSample::new(
                    codec_for(track.kind()),
                    track.id().to_string(),
                    "fieldlink".to_string(),
                )),
            )
        });
        Arc::clone(sample)
    }

    fn get(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.entries.lock().get(track_id).map(|(_, sample)| Arc::clone(sample))
    }
}

/// Factory for `webrtc` crate peer connections
pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<IceServer>,
    local_tracks: Arc<LocalTracks>,
}

impl WebRtcPeerFactory {
    /// Build the media engine with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(ice_servers: Vec<IceServer>) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            local_tracks: Arc::new(LocalTracks::default()),
        })
    }

    /// Sample track bound to a media track, for the capture pipeline to feed
    #[must_use]
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.get(track_id)
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    #[tracing::instrument(skip(self, events), fields(peer_id = %peer_id))]
    async fn create(
        &self,
        peer_id: &UserId,
        events: mpsc::UnboundedSender<PeerLinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(backend)?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerLinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::debug!(error = %e, "Cannot serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Some(kind) = track_kind(track.kind()) {
                        let _ = tx.send(PeerLinkEvent::RemoteTrack(RemoteTrackInfo {
                            id: track.id(),
                            stream_id: track.stream_id(),
                            kind,
                        }));
                    }
                })
            },
        ));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
                RTCPeerConnectionState::New => Some(PeerConnectionState::New),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = tx.send(PeerLinkEvent::ConnectionState(mapped));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let mapped = match state {
                RTCIceConnectionState::New => Some(IceConnectionState::New),
                RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = tx.send(PeerLinkEvent::IceState(mapped));
            }
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let mapped = match state {
                RTCSignalingState::Stable => Some(SignalingState::Stable),
                RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
                RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
                RTCSignalingState::Closed => Some(SignalingState::Closed),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = tx.send(PeerLinkEvent::SignalingState(mapped));
            }
            Box::pin(async {})
        }));

        tracing::debug!("Peer connection created");
        Ok(Arc::new(WebRtcPeerLink {
            pc,
            local_tracks: Arc::clone(&self.local_tracks),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        }))
    }
}

/// A `webrtc` crate peer connection
pub struct WebRtcPeerLink {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Arc<LocalTracks>,
    senders: Mutex<HashMap<u64, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl WebRtcPeerLink {
    fn register_sender(&self, kind: TrackKind, sender: Arc<RTCRtpSender>) -> SenderId {
        let id = self.next_sender.fetch_add(1, Ordering::Relaxed);
        self.senders.lock().insert(id, sender);
        SenderId { id, kind }
    }

    async fn has_transceiver(&self, kind: TrackKind) -> bool {
        let wanted = codec_type(kind);
        self.pc
            .get_transceivers()
            .await
            .iter()
            .any(|t| t.kind() == wanted)
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        let sdp = description.sdp.clone();
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        };
        parsed.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId, NegotiationError> {
        let sample = self.local_tracks.bind(&track);
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                sample as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(backend)?;
        let sender = transceiver.sender().await;
        Ok(self.register_sender(track.kind(), sender))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<MediaTrack>,
    ) -> Result<(), NegotiationError> {
        let rtp_sender = self
            .senders
            .lock()
            .get(&sender.id)
            .cloned()
            .ok_or_else(|| NegotiationError::Backend(format!("unknown sender {}", sender.id)))?;
        let sample = self.local_tracks.bind(&track);
        rtp_sender
            .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(backend)
    }

    async fn ensure_bidirectional(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<Option<SenderId>, NegotiationError> {
        if self.has_transceiver(kind).await {
            return Ok(None);
        }
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendrecv,
            send_encodings: vec![],
        };
        match track {
            Some(track) => {
                let sample = self.local_tracks.bind(&track);
                let transceiver = self
                    .pc
                    .add_transceiver_from_track(sample as Arc<dyn TrackLocal + Send + Sync>, Some(init))
                    .await
                    .map_err(backend)?;
                let sender = transceiver.sender().await;
                Ok(Some(self.register_sender(kind, sender)))
            }
            None => {
                self.pc
                    .add_transceiver_from_kind(codec_type(kind), Some(init))
                    .await
                    .map_err(backend)?;
                Ok(None)
            }
        }
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, NegotiationError> {
        let wanted = [
            (TrackKind::Audio, options.offer_audio),
            (TrackKind::Video, options.offer_video),
        ];
        for (kind, requested) in wanted {
            if requested && !self.has_transceiver(kind).await {
                self.pc
                    .add_transceiver_from_kind(
                        codec_type(kind),
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(backend)?;
            }
        }
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc = Self::to_rtc(description)?;
        self.pc.set_local_description(rtc).await.map_err(backend)
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let rtc = Self::to_rtc(description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(backend)
    }
}
