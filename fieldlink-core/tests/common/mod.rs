//! Shared test doubles: an in-memory relay for channels, scripted peer
//! links and a fixed roster service.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use fieldlink_core::channels::{ChannelLink, LinkEvent, LinkFrame};
use fieldlink_core::group::RosterError;
use fieldlink_core::media::CaptureDevice;
use fieldlink_core::peer::{OfferOptions, PeerLinkEvent, SenderId};
use fieldlink_core::types::SdpKind;
use fieldlink_core::{
    CallKind, ChannelConnector, ChannelKind, Envelope, GroupId, IceCandidate, MediaTrack,
    NegotiationError, PeerConnectionFactory, PeerLink, RosterService, RosterSnapshot,
    SessionDescription, SignalingMessage, StaticCaptureBackend, TrackKind, TransportError, UserId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use url::Url;

pub const CANDIDATE_A: &str = "candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host";
pub const CANDIDATE_B: &str = "candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx";

/// Wait for the first event matching `f`
pub async fn next_event<T, F>(rx: &mut broadcast::Receiver<T>, mut f: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if f(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

/// Poll a synchronous condition until it holds
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

/// Give spawned tasks a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

struct HubClient {
    id: u64,
    user: String,
    kind: ChannelKind,
    inbound: mpsc::UnboundedSender<LinkEvent>,
}

/// In-memory relay: every frame written on a channel of one kind is
/// delivered to every other client connected on that kind.
#[derive(Default)]
pub struct Hub {
    clients: Mutex<Vec<HubClient>>,
    next_id: AtomicU64,
    log: Mutex<Vec<(ChannelKind, Envelope)>>,
    connects: AtomicUsize,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<HubConnector> {
        Arc::new(HubConnector {
            hub: Arc::clone(self),
        })
    }

    fn relay(&self, from: u64, kind: ChannelKind, frame: String) {
        if let Ok(envelope) = Envelope::decode(&frame) {
            if !matches!(envelope.message, SignalingMessage::Ping) {
                self.log.lock().push((kind, envelope));
            }
        }
        for client in self.clients.lock().iter() {
            if client.id != from && client.kind == kind {
                let _ = client.inbound.send(LinkEvent::Text(frame.clone()));
            }
        }
    }

    fn remove(&self, id: u64) {
        self.clients.lock().retain(|c| c.id != id);
    }

    /// Drop every link of `user` without a close frame
    pub fn sever(&self, user: &str) {
        let mut clients = self.clients.lock();
        for client in clients.iter().filter(|c| c.user == user) {
            let _ = client
                .inbound
                .send(LinkEvent::Closed(fieldlink_core::channels::CloseInfo::abnormal("severed")));
        }
        clients.retain(|c| c.user != user);
    }

    /// Messages relayed so far that were sent by `user`
    pub fn sent_by(&self, user: &str) -> Vec<SignalingMessage> {
        self.log
            .lock()
            .iter()
            .filter(|(_, e)| e.from.as_ref().is_some_and(|f| f.as_str() == user))
            .map(|(_, e)| e.message.clone())
            .collect()
    }

    /// Count relayed messages matching `f`
    pub fn count<F: Fn(&SignalingMessage) -> bool>(&self, f: F) -> usize {
        self.log.lock().iter().filter(|(_, e)| f(&e.message)).count()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub struct HubConnector {
    hub: Arc<Hub>,
}

#[async_trait]
impl ChannelConnector for HubConnector {
    async fn connect(&self, kind: ChannelKind, endpoint: &Url) -> Result<ChannelLink, TransportError> {
        let user = endpoint
            .query_pairs()
            .find(|(k, _)| k == "userId")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| TransportError::ConnectFailed("no userId".to_string()))?;
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        self.hub.connects.fetch_add(1, Ordering::SeqCst);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.hub.clients.lock().push(HubClient {
            id,
            user,
            kind,
            inbound: in_tx,
        });

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    LinkFrame::Text(text) => hub.relay(id, kind, text),
                    LinkFrame::Close => break,
                }
            }
            hub.remove(id);
        });

        Ok(ChannelLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Failures injected into every link a factory hands out
#[derive(Default)]
pub struct LinkFaults {
    /// Remote answers are refused as if no local offer existed
    pub reject_answers: AtomicBool,
    /// Offer creations left to fail
    pub failing_offers: AtomicUsize,
}

/// Peer link recording every negotiation step
pub struct ScriptedLink {
    peer: UserId,
    events: mpsc::UnboundedSender<PeerLinkEvent>,
    gather: bool,
    faults: Arc<LinkFaults>,
    pub offers: AtomicUsize,
    pub ice_restarts: AtomicUsize,
    pub answers: AtomicUsize,
    pub replaced: AtomicUsize,
    pub closed: AtomicUsize,
    pub applied: Mutex<Vec<String>>,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub tracks: Mutex<Vec<TrackKind>>,
    next_sender: AtomicU64,
    locals: AtomicU64,
}

impl ScriptedLink {
    pub fn emit(&self, event: PeerLinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn ice_restarts(&self) -> usize {
        self.ice_restarts.load(Ordering::SeqCst)
    }
}

fn sdp(origin: &str, n: usize, video: bool) -> String {
    let video = if video { "m=video 9 UDP/TLS/RTP/SAVPF 96\r\n" } else { "" };
    format!("v=0\r\no={origin} {n} IN IP4 0.0.0.0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n{video}")
}

#[async_trait]
impl PeerLink for ScriptedLink {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId, NegotiationError> {
        self.tracks.lock().push(track.kind());
        Ok(SenderId {
            id: self.next_sender.fetch_add(1, Ordering::SeqCst),
            kind: track.kind(),
        })
    }

    async fn replace_track(&self, _sender: SenderId, _track: Arc<MediaTrack>) -> Result<(), NegotiationError> {
        self.replaced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_bidirectional(
        &self,
        _kind: TrackKind,
        _track: Option<Arc<MediaTrack>>,
    ) -> Result<Option<SenderId>, NegotiationError> {
        Ok(None)
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, NegotiationError> {
        let failing = &self.faults.failing_offers;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NegotiationError::Backend("offer creation failed".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        if options.ice_restart {
            self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(sdp(self.peer.as_str(), n, options.offer_video)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst);
        let video = self
            .remote
            .lock()
            .last()
            .is_some_and(|offer| offer.has_media(TrackKind::Video));
        Ok(SessionDescription::answer(sdp(self.peer.as_str(), n, video)))
    }

    async fn set_local_description(&self, _d: &SessionDescription) -> Result<(), NegotiationError> {
        if self.gather {
            let n = self.locals.fetch_add(1, Ordering::SeqCst) + 1;
            self.emit(PeerLinkEvent::LocalCandidate(IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"
            ))));
        }
        Ok(())
    }

    async fn set_remote_description(&self, d: &SessionDescription) -> Result<(), NegotiationError> {
        if d.kind == SdpKind::Answer && self.faults.reject_answers.load(Ordering::SeqCst) {
            return Err(NegotiationError::InvalidDescription("no local offer".to_string()));
        }
        self.remote.lock().push(d.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.applied.lock().push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`ScriptedLink`]s, keyed by peer
#[derive(Default)]
pub struct ScriptedFactory {
    links: Mutex<HashMap<UserId, Arc<ScriptedLink>>>,
    created: AtomicUsize,
    gather: bool,
    pub faults: Arc<LinkFaults>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links emit one local candidate per applied local description
    pub fn gathering() -> Arc<Self> {
        Arc::new(Self {
            gather: true,
            ..Self::default()
        })
    }

    pub fn link(&self, peer: &str) -> Arc<ScriptedLink> {
        Arc::clone(&self.links.lock()[&UserId::new(peer)])
    }

    pub fn has_link(&self, peer: &str) -> bool {
        self.links.lock().contains_key(&UserId::new(peer))
    }

    pub fn emit(&self, peer: &str, event: PeerLinkEvent) {
        self.link(peer).emit(event);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn total_offers(&self) -> usize {
        self.links.lock().values().map(|l| l.offers()).sum()
    }
}

#[async_trait]
impl PeerConnectionFactory for ScriptedFactory {
    async fn create(
        &self,
        peer_id: &UserId,
        events: mpsc::UnboundedSender<PeerLinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(ScriptedLink {
            peer: peer_id.clone(),
            events,
            gather: self.gather,
            faults: Arc::clone(&self.faults),
            offers: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            replaced: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            next_sender: AtomicU64::new(0),
            locals: AtomicU64::new(0),
        });
        self.links.lock().insert(peer_id.clone(), Arc::clone(&link));
        Ok(link)
    }
}

/// Roster service over a fixed table
#[derive(Default)]
pub struct StaticRoster {
    rosters: Mutex<HashMap<GroupId, RosterSnapshot>>,
    queries: AtomicUsize,
}

impl StaticRoster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, group: &str, creator: &str, participants: &[&str], call_kind: CallKind) {
        self.rosters.lock().insert(
            GroupId::new(group),
            RosterSnapshot {
                group_id: GroupId::new(group),
                creator_id: UserId::new(creator),
                call_kind,
                participants: participants.iter().map(|p| UserId::new(*p)).collect(),
            },
        );
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RosterService for StaticRoster {
    async fn active_roster(
        &self,
        group_id: &GroupId,
        _call_kind: CallKind,
        _allow_create: bool,
    ) -> Result<Option<RosterSnapshot>, RosterError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.rosters.lock().get(group_id).cloned())
    }
}

/// Microphone, no camera
pub fn microphone_only() -> StaticCaptureBackend {
    StaticCaptureBackend::new(vec![CaptureDevice::new(
        "mic-0",
        "Built-in Microphone",
        TrackKind::Audio,
    )])
}

/// Two cameras and a microphone
pub fn two_cameras() -> StaticCaptureBackend {
    StaticCaptureBackend::new(vec![
        CaptureDevice::new("mic-0", "Built-in Microphone", TrackKind::Audio),
        CaptureDevice::new("cam-front", "Front Camera", TrackKind::Video),
        CaptureDevice::new("cam-back", "Back Camera", TrackKind::Video),
    ])
}

/// A session wired to the hub with scripted peer links
pub struct TestPeer {
    pub session: fieldlink_core::Session,
    pub factory: Arc<ScriptedFactory>,
    pub events: broadcast::Receiver<fieldlink_core::SessionEvent>,
}

impl TestPeer {
    pub fn id(&self) -> UserId {
        self.session.local_id().clone()
    }
}

/// Build and connect a session for `user`
pub async fn join_hub(
    hub: &Arc<Hub>,
    user: &str,
    roster: Arc<StaticRoster>,
    config: fieldlink_core::SessionConfig,
) -> TestPeer {
    let factory = ScriptedFactory::gathering();
    let session = fieldlink_core::Session::builder(Arc::new(fieldlink_core::StaticIdentity::new(
        user,
        format!("{user}-token"),
    )))
    .with_config(config)
    .with_connector(hub.connector())
    .with_peer_factory(factory.clone())
    .with_roster_service(roster)
    .with_capture_backend(Arc::new(StaticCaptureBackend::with_default_devices()))
    .build()
    .await
    .unwrap();
    let events = session.subscribe_events();
    session.connect().await.unwrap();
    TestPeer {
        session,
        factory,
        events,
    }
}

/// Poll a peer's negotiation state until it matches
pub async fn wait_for_state(
    registry: &fieldlink_core::PeerRegistry,
    peer: &str,
    state: fieldlink_core::NegotiationState,
) {
    let peer = UserId::new(peer);
    for _ in 0..500 {
        if registry.state(&peer).await == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{peer} never reached {state:?}, last {:?}",
        registry.state(&peer).await
    );
}

/// Poll until a peer has no record
pub async fn wait_for_no_record(registry: &fieldlink_core::PeerRegistry, peer: &str) {
    let peer = UserId::new(peer);
    for _ in 0..500 {
        if registry.get(&peer).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{peer} still has a record");
}
