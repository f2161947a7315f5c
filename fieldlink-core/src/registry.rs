//! Peer connection registry
//!
//! One [`PeerRecord`] per remote participant. Every path that can bring a
//! record into existence (`create`, `handle_offer`, `handle_answer`) goes
//! through a single admission step keyed by peer id, and every mutation after
//! a suspension point re-checks that the record is still the registered one.

use crate::identity::UserId;
use crate::media::{AcquireConfig, MediaManager, MediaTrack, ToggleOutcome};
use crate::peer::{
    IceConnectionState, IceServer, NegotiationError, NegotiationState, OfferOptions,
    PeerConnectionFactory, PeerConnectionState, PeerLink, PeerLinkEvent, PeerRole,
    RemoteTrackInfo, SenderId, SignalingState,
};
use crate::types::{CallKind, IceCandidate, SessionDescription, TrackKind};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// ICE servers handed to new connections
    pub ice_servers: Vec<IceServer>,
    /// Delay before an offerer restarts ICE after failure
    pub ice_restart_delay_ms: u64,
    /// Candidates buffered per peer that has no record yet; the oldest is
    /// dropped on overflow
    pub max_orphan_candidates_per_peer: usize,
    /// Peers without a record that may buffer candidates at once
    pub max_orphan_peers: usize,
    /// Age after which a candidate buffered for an unknown peer is discarded
    pub orphan_candidate_ttl_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ice_restart_delay_ms: 1000,
            max_orphan_candidates_per_peer: 64,
            max_orphan_peers: 256,
            orphan_candidate_ttl_ms: 30_000,
        }
    }
}

impl RegistryConfig {
    /// ICE restart delay
    #[must_use]
    pub fn ice_restart_delay(&self) -> Duration {
        Duration::from_millis(self.ice_restart_delay_ms)
    }

    /// Orphan candidate lifetime
    #[must_use]
    pub fn orphan_candidate_ttl(&self) -> Duration {
        Duration::from_millis(self.orphan_candidate_ttl_ms)
    }
}

/// Registry events
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate must be conveyed to the peer
    LocalCandidate {
        /// Peer
        peer_id: UserId,
        /// Kind of the call the record serves
        call_kind: CallKind,
        /// Candidate
        candidate: IceCandidate,
    },
    /// Remote media arrived
    RemoteTrack {
        /// Peer
        peer_id: UserId,
        /// Track
        track: RemoteTrackInfo,
    },
    /// Negotiation state changed
    StateChanged {
        /// Peer
        peer_id: UserId,
        /// New state
        state: NegotiationState,
    },
    /// An ICE-restart offer was applied locally and must be sent
    RestartOffer {
        /// Peer
        peer_id: UserId,
        /// Kind of the call the record serves
        call_kind: CallKind,
        /// Offer
        offer: SessionDescription,
    },
    /// Record removed
    Destroyed {
        /// Peer
        peer_id: UserId,
    },
}

#[derive(Debug)]
struct RecordState {
    state: NegotiationState,
    role: PeerRole,
    connection_state: PeerConnectionState,
    ice_state: IceConnectionState,
    signaling_state: SignalingState,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrackInfo>,
    senders: Vec<SenderId>,
    last_remote_offer: Option<String>,
    last_answer: Option<SessionDescription>,
}

#[derive(Default)]
struct RecordTasks {
    observer: Option<JoinHandle<()>>,
    ice_restart: Option<JoinHandle<()>>,
}

/// One negotiated connection to one peer
pub struct PeerRecord {
    uid: u64,
    peer_id: UserId,
    call_kind: CallKind,
    link: Arc<dyn PeerLink>,
    state: parking_lot::Mutex<RecordState>,
    negotiation: Arc<Mutex<()>>,
    candidates: Mutex<()>,
    tasks: parking_lot::Mutex<RecordTasks>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("uid", &self.uid)
            .field("peer_id", &self.peer_id)
            .field("call_kind", &self.call_kind)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl PeerRecord {
    fn new(
        uid: u64,
        peer_id: UserId,
        call_kind: CallKind,
        role: PeerRole,
        link: Arc<dyn PeerLink>,
        pending_candidates: Vec<IceCandidate>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            uid,
            peer_id,
            call_kind,
            link,
            state: parking_lot::Mutex::new(RecordState {
                state: NegotiationState::New,
                role,
                connection_state: PeerConnectionState::New,
                ice_state: IceConnectionState::New,
                signaling_state: SignalingState::Stable,
                remote_applied: false,
                pending_candidates,
                remote_tracks: Vec::new(),
                senders: Vec::new(),
                last_remote_offer: None,
                last_answer: None,
            }),
            negotiation: Arc::new(Mutex::new(())),
            candidates: Mutex::new(()),
            tasks: parking_lot::Mutex::new(RecordTasks::default()),
            shutdown,
        }
    }

    /// Remote participant
    #[must_use]
    pub fn peer_id(&self) -> &UserId {
        &self.peer_id
    }

    /// Call kind the record was created for
    #[must_use]
    pub fn call_kind(&self) -> CallKind {
        self.call_kind
    }

    /// Underlying connection
    #[must_use]
    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// Negotiation state
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state.lock().state
    }

    /// Offerer or answerer
    #[must_use]
    pub fn role(&self) -> PeerRole {
        self.state.lock().role
    }

    /// Aggregate connection state
    #[must_use]
    pub fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection_state
    }

    /// ICE state
    #[must_use]
    pub fn ice_state(&self) -> IceConnectionState {
        self.state.lock().ice_state
    }

    /// Signaling state
    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling_state
    }

    /// Candidates waiting for the remote description
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending_candidates.len()
    }

    /// Remote tracks received so far
    #[must_use]
    pub fn remote_tracks(&self) -> Vec<RemoteTrackInfo> {
        self.state.lock().remote_tracks.clone()
    }

    /// Local senders
    #[must_use]
    pub fn senders(&self) -> Vec<SenderId> {
        self.state.lock().senders.clone()
    }

    fn has_sender(&self, kind: TrackKind) -> bool {
        self.state.lock().senders.iter().any(|s| s.kind == kind)
    }

    fn cached_answer(&self, offer_sdp: &str) -> Option<SessionDescription> {
        let state = self.state.lock();
        match (&state.last_remote_offer, &state.last_answer) {
            (Some(sdp), Some(answer)) if sdp == offer_sdp => Some(answer.clone()),
            _ => None,
        }
    }
}

/// Result of admission: the record, plus the negotiation guard when this
/// caller created it
struct Admission {
    record: Arc<PeerRecord>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Admission {
    async fn negotiate(self) -> (Arc<PeerRecord>, OwnedMutexGuard<()>) {
        let guard = match self.guard {
            Some(guard) => guard,
            None => Arc::clone(&self.record.negotiation).lock_owned().await,
        };
        (self.record, guard)
    }
}

/// Candidates that arrived before their peer had a record, oldest first
type OrphanCandidates = HashMap<UserId, VecDeque<(Instant, IceCandidate)>>;

struct RegistryInner {
    local_id: UserId,
    config: RegistryConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    media: Arc<MediaManager>,
    records: Mutex<HashMap<UserId, Arc<PeerRecord>>>,
    admitting: parking_lot::Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    orphans: parking_lot::Mutex<OrphanCandidates>,
    event_sender: broadcast::Sender<PeerEvent>,
    feeds: parking_lot::Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    next_uid: AtomicU64,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for record in self.records.get_mut().values() {
            let _ = record.shutdown.send(true);
            if let Some(handle) = record.tasks.lock().ice_restart.take() {
                handle.abort();
            }
        }
    }
}

impl RegistryInner {
    fn emit(&self, event: PeerEvent) {
        self.feeds.lock().retain(|feed| feed.send(event.clone()).is_ok());
        let _ = self.event_sender.send(event);
    }

    fn set_state(&self, record: &PeerRecord, state: NegotiationState) {
        let changed = {
            let mut s = record.state.lock();
            let changed = s.state != state;
            s.state = state;
            changed
        };
        if changed {
            tracing::debug!(peer_id = %record.peer_id, state = ?state, "Negotiation state changed");
            self.emit(PeerEvent::StateChanged {
                peer_id: record.peer_id.clone(),
                state,
            });
        }
    }

    async fn get(&self, peer_id: &UserId) -> Option<Arc<PeerRecord>> {
        self.records.lock().await.get(peer_id).cloned()
    }

    async fn is_current(&self, record: &Arc<PeerRecord>) -> bool {
        self.records
            .lock()
            .await
            .get(&record.peer_id)
            .is_some_and(|r| Arc::ptr_eq(r, record))
    }

    async fn ensure_current(&self, record: &Arc<PeerRecord>) -> Result<(), NegotiationError> {
        if self.is_current(record).await {
            Ok(())
        } else {
            tracing::debug!(peer_id = %record.peer_id, uid = record.uid, "Discarding stale negotiation result");
            Err(NegotiationError::Stale(record.peer_id.clone()))
        }
    }

    /// Serializes admission per peer; the connection is created outside the
    /// records lock so a slow factory only delays its own peer.
    async fn admit(
        self: &Arc<Self>,
        peer_id: &UserId,
        call_kind: CallKind,
        role: PeerRole,
    ) -> Result<Admission, NegotiationError> {
        if let Some(existing) = self.get(peer_id).await {
            return Ok(Admission {
                record: existing,
                guard: None,
            });
        }

        let cell = Arc::clone(self.admitting.lock().entry(peer_id.clone()).or_default());
        let admission = {
            let _turn = cell.lock().await;
            self.admit_exclusive(peer_id, call_kind, role).await
        };
        self.release_cell(peer_id, &cell);
        admission
    }

    /// Wait for an admission in flight for the peer to finish
    async fn admission_settled(&self, peer_id: &UserId) {
        let cell = self.admitting.lock().get(peer_id).cloned();
        if let Some(cell) = cell {
            drop(cell.lock().await);
            self.release_cell(peer_id, &cell);
        }
    }

    fn release_cell(&self, peer_id: &UserId, cell: &Arc<Mutex<()>>) {
        let mut admitting = self.admitting.lock();
        // Held by the map and this caller only: nobody else is waiting.
        if Arc::strong_count(cell) == 2 && admitting.get(peer_id).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            admitting.remove(peer_id);
        }
    }

    async fn admit_exclusive(
        self: &Arc<Self>,
        peer_id: &UserId,
        call_kind: CallKind,
        role: PeerRole,
    ) -> Result<Admission, NegotiationError> {
        if let Some(existing) = self.get(peer_id).await {
            return Ok(Admission {
                record: existing,
                guard: None,
            });
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = self.factory.create(peer_id, event_tx).await?;
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);

        let mut records = self.records.lock().await;
        let pending = self.take_orphans(peer_id);
        let record = Arc::new(PeerRecord::new(
            uid,
            peer_id.clone(),
            call_kind,
            role,
            link,
            pending,
        ));
        let guard = Arc::clone(&record.negotiation).lock_owned().await;
        records.insert(peer_id.clone(), Arc::clone(&record));
        drop(records);

        self.spawn_observer(&record, event_rx);
        tracing::info!(peer_id = %peer_id, call_kind = %call_kind, role = ?role, "Peer record created");
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: NegotiationState::New,
        });
        Ok(Admission {
            record,
            guard: Some(guard),
        })
    }

    /// Removes a record created by this caller when the step after
    /// admission failed
    async fn release_on_error<T>(
        &self,
        record: &Arc<PeerRecord>,
        admitted: bool,
        result: Result<T, NegotiationError>,
    ) -> Result<T, NegotiationError> {
        if let Err(e) = &result {
            if admitted {
                tracing::debug!(peer_id = %record.peer_id, error = %e, "Negotiation failed on a new record, removing it");
                self.destroy_record(record).await;
            }
        }
        result
    }

    fn prune_orphans(&self, orphans: &mut OrphanCandidates) {
        let ttl = self.config.orphan_candidate_ttl();
        orphans.retain(|_, buffered| {
            buffered.retain(|(at, _)| at.elapsed() < ttl);
            !buffered.is_empty()
        });
    }

    fn take_orphans(&self, peer_id: &UserId) -> Vec<IceCandidate> {
        let mut orphans = self.orphans.lock();
        self.prune_orphans(&mut orphans);
        orphans
            .remove(peer_id)
            .map(|buffered| buffered.into_iter().map(|(_, c)| c).collect())
            .unwrap_or_default()
    }

    fn buffer_orphan(&self, peer_id: &UserId, candidate: IceCandidate) {
        let mut orphans = self.orphans.lock();
        self.prune_orphans(&mut orphans);
        if !orphans.contains_key(peer_id) && orphans.len() >= self.config.max_orphan_peers {
            tracing::warn!(
                peer_id = %peer_id,
                peers = orphans.len(),
                "Too many unknown peers buffering candidates, dropping candidate"
            );
            return;
        }
        let buffered = orphans.entry(peer_id.clone()).or_default();
        if buffered.len() >= self.config.max_orphan_candidates_per_peer.max(1) {
            buffered.pop_front();
            tracing::debug!(peer_id = %peer_id, "Candidate buffer for unknown peer full, dropped oldest");
        }
        buffered.push_back((Instant::now(), candidate));
        tracing::trace!(peer_id = %peer_id, buffered = buffered.len(), "Buffering candidate for unknown peer");
    }

    async fn ensure_local_tracks(&self, record: &Arc<PeerRecord>) -> Result<(), NegotiationError> {
        let Some(bundle) = self.media.bundle() else {
            return Ok(());
        };
        for kind in record.call_kind.track_kinds() {
            if record.has_sender(*kind) {
                continue;
            }
            if let Some(track) = bundle.track(*kind) {
                let sender = record.link.add_track(Arc::clone(track)).await?;
                record.state.lock().senders.push(sender);
                tracing::debug!(peer_id = %record.peer_id, kind = ?kind, "Local track attached");
            }
        }
        Ok(())
    }

    async fn acquire_for(&self, call_kind: CallKind) -> Result<(), NegotiationError> {
        if self.media.has_media_for(call_kind) {
            return Ok(());
        }
        let config = AcquireConfig::for_call(call_kind, self.media.config().orientation);
        self.media.acquire(config).await?;
        Ok(())
    }

    async fn flush_candidates(&self, record: &Arc<PeerRecord>) {
        let _lane = record.candidates.lock().await;
        let pending = {
            let mut s = record.state.lock();
            s.remote_applied = true;
            std::mem::take(&mut s.pending_candidates)
        };
        if !pending.is_empty() {
            tracing::debug!(peer_id = %record.peer_id, count = pending.len(), "Flushing buffered candidates");
        }
        for candidate in pending {
            if let Err(e) = record.link.add_ice_candidate(&candidate).await {
                tracing::debug!(peer_id = %record.peer_id, error = %e, "Buffered candidate rejected");
            }
        }
    }

    fn spawn_observer(
        self: &Arc<Self>,
        record: &Arc<PeerRecord>,
        mut events: mpsc::UnboundedReceiver<PeerLinkEvent>,
    ) {
        let registry = Arc::downgrade(self);
        let observed = Arc::clone(record);
        let mut shutdown = record.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if registry.on_link_event(&observed, event).await {
                    break;
                }
            }
        });
        record.tasks.lock().observer = Some(handle);
    }

    /// Returns true once the record has been torn down
    async fn on_link_event(self: &Arc<Self>, record: &Arc<PeerRecord>, event: PeerLinkEvent) -> bool {
        match event {
            PeerLinkEvent::LocalCandidate(candidate) => {
                tracing::trace!(peer_id = %record.peer_id, "Local candidate gathered");
                self.emit(PeerEvent::LocalCandidate {
                    peer_id: record.peer_id.clone(),
                    call_kind: record.call_kind,
                    candidate,
                });
            }
            PeerLinkEvent::RemoteTrack(track) => {
                tracing::info!(peer_id = %record.peer_id, kind = ?track.kind, "Remote track arrived");
                record.state.lock().remote_tracks.push(track.clone());
                self.emit(PeerEvent::RemoteTrack {
                    peer_id: record.peer_id.clone(),
                    track,
                });
            }
            PeerLinkEvent::SignalingState(state) => {
                tracing::debug!(peer_id = %record.peer_id, state = ?state, "Signaling state");
                record.state.lock().signaling_state = state;
            }
            PeerLinkEvent::IceState(state) => {
                tracing::debug!(peer_id = %record.peer_id, state = ?state, "ICE state");
                let role = {
                    let mut s = record.state.lock();
                    s.ice_state = state;
                    s.role
                };
                match state {
                    IceConnectionState::Failed if role == PeerRole::Offerer => {
                        self.schedule_ice_restart(record);
                    }
                    IceConnectionState::Failed => {
                        tracing::debug!(peer_id = %record.peer_id, "ICE failed, awaiting restart offer from peer");
                    }
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        if let Some(handle) = record.tasks.lock().ice_restart.take() {
                            handle.abort();
                        }
                    }
                    _ => {}
                }
            }
            PeerLinkEvent::ConnectionState(state) => {
                record.state.lock().connection_state = state;
                let next = match state {
                    PeerConnectionState::New => None,
                    PeerConnectionState::Connecting => Some(NegotiationState::Connecting),
                    PeerConnectionState::Connected => Some(NegotiationState::Connected),
                    PeerConnectionState::Disconnected => Some(NegotiationState::Reconnecting),
                    PeerConnectionState::Failed => Some(NegotiationState::Failed),
                    PeerConnectionState::Closed => Some(NegotiationState::Closed),
                };
                if let Some(next) = next {
                    self.set_state(record, next);
                    if next.is_terminal() {
                        tracing::info!(peer_id = %record.peer_id, state = ?next, "Connection ended, destroying record");
                        self.destroy_record(record).await;
                        return true;
                    }
                }
            }
        }
        false
    }

    fn schedule_ice_restart(self: &Arc<Self>, record: &Arc<PeerRecord>) {
        let mut tasks = record.tasks.lock();
        if tasks.ice_restart.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let registry: Weak<Self> = Arc::downgrade(self);
        let target = Arc::clone(record);
        let delay = self.config.ice_restart_delay();
        tracing::info!(peer_id = %record.peer_id, delay_ms = self.config.ice_restart_delay_ms, "Scheduling ICE restart");
        tasks.ice_restart = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if let Err(e) = registry.restart_ice(&target).await {
                tracing::warn!(peer_id = %target.peer_id, error = %e, "ICE restart failed");
            }
        }));
    }

    async fn restart_ice(&self, record: &Arc<PeerRecord>) -> Result<(), NegotiationError> {
        self.ensure_current(record).await?;
        let _negotiation = record.negotiation.lock().await;
        let offer = record
            .link
            .create_offer(OfferOptions {
                offer_audio: true,
                offer_video: record.call_kind.has_video(),
                ice_restart: true,
            })
            .await?;
        record.link.set_local_description(&offer).await?;
        self.ensure_current(record).await?;
        {
            let mut s = record.state.lock();
            s.remote_applied = false;
            s.last_answer = None;
        }
        self.set_state(record, NegotiationState::OfferCreated);
        tracing::info!(peer_id = %record.peer_id, "ICE restart offer created");
        self.emit(PeerEvent::RestartOffer {
            peer_id: record.peer_id.clone(),
            call_kind: record.call_kind,
            offer,
        });
        Ok(())
    }

    async fn destroy_record(&self, record: &Arc<PeerRecord>) {
        let removed = {
            let mut records = self.records.lock().await;
            if records
                .get(&record.peer_id)
                .is_some_and(|r| Arc::ptr_eq(r, record))
            {
                records.remove(&record.peer_id);
                true
            } else {
                false
            }
        };
        if removed {
            self.teardown(record).await;
        }
    }

    async fn teardown(&self, record: &Arc<PeerRecord>) {
        let _ = record.shutdown.send(true);
        self.orphans.lock().remove(&record.peer_id);
        {
            let mut tasks = record.tasks.lock();
            if let Some(handle) = tasks.ice_restart.take() {
                handle.abort();
            }
            tasks.observer.take();
        }
        {
            let mut s = record.state.lock();
            s.senders.clear();
            s.remote_tracks.clear();
            s.pending_candidates.clear();
            if !s.state.is_terminal() {
                s.state = NegotiationState::Closed;
            }
        }
        if let Err(e) = record.link.close().await {
            tracing::debug!(peer_id = %record.peer_id, error = %e, "Close failed");
        }
        tracing::info!(peer_id = %record.peer_id, "Peer record destroyed");
        self.emit(PeerEvent::Destroyed {
            peer_id: record.peer_id.clone(),
        });
    }
}

/// Peer connection registry
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

impl PeerRegistry {
    /// Create a registry for the local participant
    pub fn new(
        local_id: UserId,
        config: RegistryConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        media: Arc<MediaManager>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(RegistryInner {
                local_id,
                config,
                factory,
                media,
                records: Mutex::new(HashMap::new()),
                admitting: parking_lot::Mutex::new(HashMap::new()),
                orphans: parking_lot::Mutex::new(HashMap::new()),
                event_sender,
                feeds: parking_lot::Mutex::new(Vec::new()),
                next_uid: AtomicU64::new(1),
            }),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Local participant id
    #[must_use]
    pub fn local_id(&self) -> &UserId {
        &self.inner.local_id
    }

    /// Media manager shared with the records
    #[must_use]
    pub fn media(&self) -> &Arc<MediaManager> {
        &self.inner.media
    }

    /// Subscribe to registry events
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Registry events in emission order and without loss, for consumers
    /// that must see every candidate and restart offer
    pub fn event_feed(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.feeds.lock().push(tx);
        rx
    }

    /// Create the record for a peer, or return the existing one untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created or tracks attached
    #[tracing::instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn create(
        &self,
        peer_id: &UserId,
        call_kind: CallKind,
        is_offerer: bool,
    ) -> Result<Arc<PeerRecord>, NegotiationError> {
        let role = if is_offerer {
            PeerRole::Offerer
        } else {
            PeerRole::Answerer
        };
        let admission = self.inner.admit(peer_id, call_kind, role).await?;
        if admission.guard.is_some() {
            let attached = self.inner.ensure_local_tracks(&admission.record).await;
            self.inner.release_on_error(&admission.record, true, attached).await?;
        }
        Ok(admission.record)
    }

    /// Build and apply a local offer, acquiring media first when absent.
    ///
    /// # Errors
    ///
    /// Returns error if media acquisition or offer creation fails
    #[tracing::instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn create_offer(
        &self,
        peer_id: &UserId,
        call_kind: CallKind,
    ) -> Result<SessionDescription, NegotiationError> {
        self.inner.acquire_for(call_kind).await?;
        let admission = self.inner.admit(peer_id, call_kind, PeerRole::Offerer).await?;
        let admitted = admission.guard.is_some();
        let (record, _negotiation) = admission.negotiate().await;
        let result = self.local_offer(&record, call_kind).await;
        self.inner.release_on_error(&record, admitted, result).await
    }

    async fn local_offer(
        &self,
        record: &Arc<PeerRecord>,
        call_kind: CallKind,
    ) -> Result<SessionDescription, NegotiationError> {
        self.inner.ensure_local_tracks(record).await?;
        let offer = record
            .link
            .create_offer(OfferOptions {
                offer_audio: true,
                offer_video: call_kind.has_video(),
                ice_restart: false,
            })
            .await?;
        let missing = offer.missing_media(call_kind);
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "Offer lacks expected media sections");
        }
        record.link.set_local_description(&offer).await?;
        self.inner.ensure_current(record).await?;

        {
            let mut s = record.state.lock();
            s.role = PeerRole::Offerer;
            s.remote_applied = false;
            s.last_answer = None;
        }
        self.inner.set_state(record, NegotiationState::OfferCreated);
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer.
    ///
    /// A repeated offer with identical SDP yields the answer produced the
    /// first time. When both sides offered at once, the side with the
    /// lexicographically smaller id keeps its offer and rejects the remote
    /// one with [`NegotiationError::Glare`]; the other side yields. A
    /// renegotiation on an established connection keeps its state.
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be applied or answered
    #[tracing::instrument(skip(self, offer), fields(peer_id = %peer_id))]
    pub async fn handle_offer(
        &self,
        peer_id: &UserId,
        offer: &SessionDescription,
        call_kind: CallKind,
    ) -> Result<SessionDescription, NegotiationError> {
        if let Err(e) = self.inner.acquire_for(call_kind).await {
            tracing::warn!(error = %e, "Emergency media acquisition failed, answering without local media");
        }

        if let Some(existing) = self.inner.get(peer_id).await {
            if existing.state() == NegotiationState::OfferCreated {
                if self.inner.local_id < *peer_id {
                    tracing::info!("Offer collision, keeping local offer");
                    return Err(NegotiationError::Glare(peer_id.clone()));
                }
                tracing::info!("Offer collision, yielding to remote offer");
                self.destroy(peer_id).await;
            }
        }

        let admission = self.inner.admit(peer_id, call_kind, PeerRole::Answerer).await?;
        let admitted = admission.guard.is_some();
        let (record, _negotiation) = admission.negotiate().await;
        if let Some(answer) = record.cached_answer(&offer.sdp) {
            tracing::debug!("Duplicate offer, returning previous answer");
            return Ok(answer);
        }
        let result = self.answer_offer(&record, offer, call_kind).await;
        self.inner.release_on_error(&record, admitted, result).await
    }

    async fn answer_offer(
        &self,
        record: &Arc<PeerRecord>,
        offer: &SessionDescription,
        call_kind: CallKind,
    ) -> Result<SessionDescription, NegotiationError> {
        let established = record.state().is_established();
        self.inner.ensure_local_tracks(record).await?;
        record.link.set_remote_description(offer).await?;
        self.inner.ensure_current(record).await?;

        if call_kind.has_video() && !offer.has_media(TrackKind::Video) {
            tracing::debug!("Offer omits video, forcing a bidirectional video pathway");
            let video = self.inner.media.bundle().and_then(|b| b.video);
            if let Some(sender) = record
                .link
                .ensure_bidirectional(TrackKind::Video, video)
                .await?
            {
                record.state.lock().senders.push(sender);
            }
        }

        record.state.lock().role = PeerRole::Answerer;
        if !established {
            self.inner.set_state(record, NegotiationState::OfferReceived);
        }
        self.inner.flush_candidates(record).await;

        let answer = record.link.create_answer().await?;
        record.link.set_local_description(&answer).await?;
        self.inner.ensure_current(record).await?;

        {
            let mut s = record.state.lock();
            s.last_remote_offer = Some(offer.sdp.clone());
            s.last_answer = Some(answer.clone());
        }
        if established {
            tracing::debug!(state = ?record.state(), "Renegotiated established connection");
        } else {
            self.inner.set_state(record, NegotiationState::AnswerExchanged);
        }
        Ok(answer)
    }

    /// Apply a remote answer.
    ///
    /// An answer from a peer with no record admits one as an offerer
    /// awaiting its answer. Repeated answers are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the record is not awaiting an answer or the answer
    /// cannot be applied
    #[tracing::instrument(skip(self, answer), fields(peer_id = %peer_id))]
    pub async fn handle_answer(
        &self,
        peer_id: &UserId,
        answer: &SessionDescription,
        call_kind: CallKind,
    ) -> Result<(), NegotiationError> {
        let admission = self.inner.admit(peer_id, call_kind, PeerRole::Offerer).await?;
        let synthesized = admission.guard.is_some();
        let (record, _negotiation) = admission.negotiate().await;
        if synthesized {
            tracing::warn!("Answer from a peer without a record, admitted as offerer");
            self.inner.set_state(&record, NegotiationState::OfferCreated);
        }
        let result = self.apply_answer(&record, answer).await;
        self.inner.release_on_error(&record, synthesized, result).await
    }

    async fn apply_answer(&self, record: &Arc<PeerRecord>, answer: &SessionDescription) -> Result<(), NegotiationError> {
        match record.state() {
            NegotiationState::OfferCreated => {}
            NegotiationState::AnswerExchanged
            | NegotiationState::Connecting
            | NegotiationState::Connected
            | NegotiationState::Reconnecting => {
                tracing::debug!("Duplicate answer ignored");
                return Ok(());
            }
            state => {
                return Err(NegotiationError::InvalidState {
                    peer_id: record.peer_id.clone(),
                    state,
                })
            }
        }

        record.link.set_remote_description(answer).await?;
        self.inner.ensure_current(record).await?;
        self.inner.set_state(record, NegotiationState::AnswerExchanged);
        self.inner.flush_candidates(record).await;
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// is applied. Malformed candidates are dropped.
    pub async fn add_remote_candidate(&self, peer_id: &UserId, candidate: IceCandidate) {
        if !candidate.is_well_formed() {
            tracing::debug!(peer_id = %peer_id, "Dropping malformed candidate");
            return;
        }

        let record = {
            let records = self.inner.records.lock().await;
            match records.get(peer_id) {
                Some(record) => Arc::clone(record),
                None => {
                    self.inner.buffer_orphan(peer_id, candidate);
                    return;
                }
            }
        };

        let _lane = record.candidates.lock().await;
        let apply_now = {
            let mut s = record.state.lock();
            if s.remote_applied {
                true
            } else {
                s.pending_candidates.push(candidate.clone());
                false
            }
        };
        if apply_now {
            if let Err(e) = record.link.add_ice_candidate(&candidate).await {
                tracing::debug!(peer_id = %peer_id, error = %e, "Candidate rejected");
            }
        } else {
            tracing::trace!(peer_id = %peer_id, "Candidate buffered until remote description");
        }
    }

    /// Candidates held for a peer that has no record yet
    #[must_use]
    pub fn orphaned_candidates(&self, peer_id: &UserId) -> usize {
        let mut orphans = self.inner.orphans.lock();
        self.inner.prune_orphans(&mut orphans);
        orphans.get(peer_id).map_or(0, VecDeque::len)
    }

    /// Tear down and remove a record. Returns whether one existed.
    #[tracing::instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn destroy(&self, peer_id: &UserId) -> bool {
        self.inner.admission_settled(peer_id).await;
        let removed = self.inner.records.lock().await.remove(peer_id);
        self.inner.orphans.lock().remove(peer_id);
        match removed {
            Some(record) => {
                self.inner.teardown(&record).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every record
    pub async fn destroy_all(&self) {
        let admitting: Vec<UserId> = self.inner.admitting.lock().keys().cloned().collect();
        for peer_id in &admitting {
            self.inner.admission_settled(peer_id).await;
        }
        let records: Vec<Arc<PeerRecord>> = self.inner.records.lock().await.drain().map(|(_, r)| r).collect();
        self.inner.orphans.lock().clear();
        for record in records {
            self.inner.teardown(&record).await;
        }
    }

    /// Replace the outbound video on every record's video sender.
    ///
    /// Returns the number of senders replaced.
    pub async fn replace_video_track(&self, track: Arc<MediaTrack>) -> usize {
        let records = self.inner.records.lock().await;
        let targets: Vec<(Arc<PeerRecord>, SenderId)> = records
            .values()
            .flat_map(|record| {
                record
                    .senders()
                    .into_iter()
                    .filter(|s| s.kind == TrackKind::Video)
                    .map(|s| (Arc::clone(record), s))
                    .collect::<Vec<_>>()
            })
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|(record, sender)| record.link.replace_track(*sender, Arc::clone(&track))),
        )
        .await;
        drop(records);

        let mut replaced = 0;
        for ((record, _), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => replaced += 1,
                Err(e) => {
                    tracing::warn!(peer_id = %record.peer_id, error = %e, "Video replacement failed");
                }
            }
        }
        tracing::debug!(replaced, "Outbound video replaced");
        replaced
    }

    /// Rotate to the next camera and replace every outbound video sender;
    /// the previous track is stopped afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the switch cannot acquire a new track
    #[tracing::instrument(skip(self))]
    pub async fn switch_video_source(&self) -> Result<usize, NegotiationError> {
        let switch = self.inner.media.switch_source().await?;
        let replaced = self.replace_video_track(Arc::clone(&switch.current)).await;
        if let Some(previous) = &switch.previous {
            self.inner.media.retire(previous);
        }
        Ok(replaced)
    }

    /// Enable or disable outbound media of a kind without renegotiation.
    /// Video acquired on demand is attached to live senders.
    ///
    /// # Errors
    ///
    /// Returns error if on-demand acquisition fails
    #[tracing::instrument(skip(self))]
    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), NegotiationError> {
        if let ToggleOutcome::Acquired(track) = self.inner.media.toggle(kind, enabled).await? {
            self.replace_video_track(track).await;
        }
        Ok(())
    }

    /// Record for a peer
    pub async fn get(&self, peer_id: &UserId) -> Option<Arc<PeerRecord>> {
        self.inner.get(peer_id).await
    }

    /// Peers with a record
    pub async fn peer_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.inner.records.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Negotiation state of a peer's record
    pub async fn state(&self, peer_id: &UserId) -> Option<NegotiationState> {
        self.inner.get(peer_id).await.map(|r| r.state())
    }

    /// Whether a peer has a record that is not failed or closed
    pub async fn is_live(&self, peer_id: &UserId) -> bool {
        self.state(peer_id).await.is_some_and(|s| !s.is_terminal())
    }

    /// Whether `record` is still the one registered for its peer
    pub async fn is_current(&self, record: &Arc<PeerRecord>) -> bool {
        self.inner.is_current(record).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{MediaConfig, StaticCaptureBackend};
    use crate::types::SdpKind;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Semaphore;

    const CANDIDATE_A: &str = "candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host";
    const CANDIDATE_B: &str = "candidate:2 1 udp 1686052607 203.0.113.7 50001 typ srflx";

    #[derive(Default)]
    struct MockLink {
        applied: parking_lot::Mutex<Vec<String>>,
        remote: parking_lot::Mutex<Option<SessionDescription>>,
        offers: AtomicU64,
        next_sender: AtomicU64,
        reject_answers: bool,
    }

    #[async_trait]
    impl PeerLink for MockLink {
        async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId, NegotiationError> {
            Ok(SenderId {
                id: self.next_sender.fetch_add(1, Ordering::Relaxed),
                kind: track.kind(),
            })
        }

        async fn replace_track(&self, _sender: SenderId, _track: Arc<MediaTrack>) -> Result<(), NegotiationError> {
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
            let n = self.offers.fetch_add(1, Ordering::Relaxed);
            let video = if options.offer_video { "m=video 9 UDP/TLS/RTP/SAVPF 96\r\n" } else { "" };
            Ok(SessionDescription::offer(format!(
                "v=0\r\no=mock {n} IN IP4 0.0.0.0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n{video}"
            )))
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"))
        }

        async fn set_local_description(&self, _d: &SessionDescription) -> Result<(), NegotiationError> {
            Ok(())
        }

        async fn set_remote_description(&self, d: &SessionDescription) -> Result<(), NegotiationError> {
            if self.reject_answers && d.kind == SdpKind::Answer {
                return Err(NegotiationError::InvalidDescription("no local offer".to_string()));
            }
            *self.remote.lock() = Some(d.clone());
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
            self.applied.lock().push(candidate.candidate.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), NegotiationError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        links: parking_lot::Mutex<HashMap<UserId, (Arc<MockLink>, mpsc::UnboundedSender<PeerLinkEvent>)>>,
        created: AtomicU64,
        reject_answers: AtomicBool,
        stalled: parking_lot::Mutex<HashMap<UserId, Arc<Semaphore>>>,
    }

    impl MockFactory {
        fn link(&self, peer: &str) -> Arc<MockLink> {
            Arc::clone(&self.links.lock()[&UserId::new(peer)].0)
        }

        fn emit(&self, peer: &str, event: PeerLinkEvent) {
            self.links.lock()[&UserId::new(peer)].1.send(event).unwrap();
        }
    }

    #[async_trait]
    impl PeerConnectionFactory for MockFactory {
        async fn create(
            &self,
            peer_id: &UserId,
            events: mpsc::UnboundedSender<PeerLinkEvent>,
        ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
            let stall = self.stalled.lock().get(peer_id).cloned();
            if let Some(stall) = stall {
                stall.acquire().await.unwrap().forget();
            }
            self.created.fetch_add(1, Ordering::Relaxed);
            let link = Arc::new(MockLink {
                reject_answers: self.reject_answers.load(Ordering::Relaxed),
                ..MockLink::default()
            });
            self.links.lock().insert(peer_id.clone(), (Arc::clone(&link), events));
            Ok(link)
        }
    }

    fn registry(local: &str) -> (PeerRegistry, Arc<MockFactory>) {
        registry_with(local, RegistryConfig::default())
    }

    fn registry_with(local: &str, config: RegistryConfig) -> (PeerRegistry, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::default());
        let media = Arc::new(MediaManager::new(
            Arc::new(StaticCaptureBackend::with_default_devices()),
            MediaConfig::default(),
        ));
        let registry = PeerRegistry::new(
            UserId::new(local),
            config,
            factory.clone(),
            media,
        );
        (registry, factory)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");

        let first = registry.create(&peer, CallKind::Video, true).await.unwrap();
        registry.create_offer(&peer, CallKind::Video).await.unwrap();
        let second = registry.create(&peer, CallKind::Video, true).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), NegotiationState::OfferCreated);
        assert_eq!(factory.created.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_offer_attaches_tracks_for_call_kind() {
        let (registry, _) = registry("alice");
        let audio_peer = UserId::new("bob");
        let video_peer = UserId::new("carol");

        registry.create_offer(&audio_peer, CallKind::Audio).await.unwrap();
        registry.create_offer(&video_peer, CallKind::Video).await.unwrap();

        let audio = registry.get(&audio_peer).await.unwrap().senders();
        let video = registry.get(&video_peer).await.unwrap().senders();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].kind, TrackKind::Audio);
        assert_eq!(video.len(), 2);
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");

        registry.add_remote_candidate(&peer, IceCandidate::new(CANDIDATE_A)).await;
        registry.create(&peer, CallKind::Audio, false).await.unwrap();
        registry.add_remote_candidate(&peer, IceCandidate::new(CANDIDATE_B)).await;
        registry.add_remote_candidate(&peer, IceCandidate::new("garbage")).await;

        let record = registry.get(&peer).await.unwrap();
        assert_eq!(record.pending_candidates(), 2);
        assert!(factory.link("bob").applied.lock().is_empty());

        let offer = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        registry.handle_offer(&peer, &offer, CallKind::Audio).await.unwrap();

        assert_eq!(
            *factory.link("bob").applied.lock(),
            vec![CANDIDATE_A.to_string(), CANDIDATE_B.to_string()]
        );
        assert_eq!(record.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_answer_without_record_is_admitted() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");
        let answer = SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");

        registry.handle_answer(&peer, &answer, CallKind::Audio).await.unwrap();
        let record = registry.get(&peer).await.unwrap();
        assert_eq!(record.role(), PeerRole::Offerer);
        assert_eq!(record.state(), NegotiationState::AnswerExchanged);
        assert!(factory.link("bob").remote.lock().is_some());

        registry.handle_answer(&peer, &answer, CallKind::Audio).await.unwrap();
        assert_eq!(record.state(), NegotiationState::AnswerExchanged);
    }

    #[tokio::test]
    async fn test_glare_smaller_id_keeps_offer() {
        let (registry, _) = registry("alice");
        let peer = UserId::new("bob");
        registry.create_offer(&peer, CallKind::Audio).await.unwrap();

        let remote = SessionDescription::offer("v=0\r\no=remote\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        match registry.handle_offer(&peer, &remote, CallKind::Audio).await {
            Err(NegotiationError::Glare(id)) => assert_eq!(id, peer),
            other => unreachable!("Expected Glare, got: {:?}", other),
        }
        assert_eq!(registry.state(&peer).await, Some(NegotiationState::OfferCreated));
    }

    #[tokio::test]
    async fn test_glare_larger_id_yields() {
        let (registry, factory) = registry("zed");
        let peer = UserId::new("bob");
        let before = registry.create(&peer, CallKind::Audio, true).await.unwrap();
        registry.create_offer(&peer, CallKind::Audio).await.unwrap();

        let remote = SessionDescription::offer("v=0\r\no=remote\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        registry.handle_offer(&peer, &remote, CallKind::Audio).await.unwrap();

        let after = registry.get(&peer).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.role(), PeerRole::Answerer);
        assert_eq!(factory.created.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_terminal_state_destroys_record() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");
        let mut events = registry.subscribe_events();
        registry.create(&peer, CallKind::Audio, true).await.unwrap();

        factory.emit("bob", PeerLinkEvent::ConnectionState(PeerConnectionState::Failed));
        loop {
            match events.recv().await.unwrap() {
                PeerEvent::Destroyed { peer_id } => {
                    assert_eq!(peer_id, peer);
                    break;
                }
                _ => continue,
            }
        }
        assert!(registry.get(&peer).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answerer_does_not_restart_ice() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");
        let offer = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        registry.handle_offer(&peer, &offer, CallKind::Audio).await.unwrap();

        factory.emit("bob", PeerLinkEvent::IceState(IceConnectionState::Failed));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(factory.link("bob").offers.load(Ordering::Relaxed), 0);
        assert_eq!(registry.state(&peer).await, Some(NegotiationState::AnswerExchanged));
    }

    #[tokio::test]
    async fn test_rejected_answer_removes_admitted_record() {
        let (registry, factory) = registry("alice");
        factory.reject_answers.store(true, Ordering::Relaxed);
        let peer = UserId::new("bob");
        let answer = SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");

        match registry.handle_answer(&peer, &answer, CallKind::Audio).await {
            Err(NegotiationError::InvalidDescription(_)) => {}
            other => unreachable!("Expected InvalidDescription, got: {:?}", other),
        }
        assert!(registry.get(&peer).await.is_none());

        let offer = SessionDescription::offer("v=0\r\no=bob\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        registry.handle_offer(&peer, &offer, CallKind::Audio).await.unwrap();
        assert_eq!(registry.state(&peer).await, Some(NegotiationState::AnswerExchanged));
    }

    #[tokio::test]
    async fn test_rejected_answer_keeps_existing_offer() {
        let (registry, factory) = registry("alice");
        factory.reject_answers.store(true, Ordering::Relaxed);
        let peer = UserId::new("bob");
        registry.create_offer(&peer, CallKind::Audio).await.unwrap();

        let answer = SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        assert!(registry.handle_answer(&peer, &answer, CallKind::Audio).await.is_err());
        assert_eq!(registry.state(&peer).await, Some(NegotiationState::OfferCreated));
    }

    #[tokio::test]
    async fn test_renegotiation_keeps_connected_state() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");
        let mut events = registry.subscribe_events();
        let offer = SessionDescription::offer("v=0\r\no=bob 1\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        registry.handle_offer(&peer, &offer, CallKind::Audio).await.unwrap();

        factory.emit("bob", PeerLinkEvent::ConnectionState(PeerConnectionState::Connected));
        loop {
            match events.recv().await.unwrap() {
                PeerEvent::StateChanged {
                    state: NegotiationState::Connected,
                    ..
                } => break,
                _ => continue,
            }
        }

        let renegotiation = SessionDescription::offer("v=0\r\no=bob 2\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        registry.handle_offer(&peer, &renegotiation, CallKind::Audio).await.unwrap();

        assert_eq!(registry.state(&peer).await, Some(NegotiationState::Connected));
        assert_eq!(factory.link("bob").remote.lock().as_ref(), Some(&renegotiation));
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::StateChanged { state, .. } = event {
                unreachable!("Expected no state change, got: {:?}", state);
            }
        }
    }

    #[tokio::test]
    async fn test_orphan_candidates_are_capped() {
        let config = RegistryConfig {
            max_orphan_candidates_per_peer: 2,
            max_orphan_peers: 1,
            ..RegistryConfig::default()
        };
        let (registry, factory) = registry_with("alice", config);
        let bob = UserId::new("bob");
        let carol = UserId::new("carol");

        for port in 50000..50003 {
            let candidate = format!("candidate:1 1 udp 2122260223 192.168.1.2 {port} typ host");
            registry.add_remote_candidate(&bob, IceCandidate::new(candidate)).await;
        }
        registry.add_remote_candidate(&carol, IceCandidate::new(CANDIDATE_A)).await;

        assert_eq!(registry.orphaned_candidates(&bob), 2);
        assert_eq!(registry.orphaned_candidates(&carol), 0);

        let offer = SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        registry.handle_offer(&bob, &offer, CallKind::Audio).await.unwrap();
        assert_eq!(
            *factory.link("bob").applied.lock(),
            vec![
                "candidate:1 1 udp 2122260223 192.168.1.2 50001 typ host".to_string(),
                "candidate:1 1 udp 2122260223 192.168.1.2 50002 typ host".to_string(),
            ]
        );
        assert_eq!(registry.orphaned_candidates(&bob), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_candidates_for_destroyed_peer_expire() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");
        let mut events = registry.subscribe_events();
        registry.create(&peer, CallKind::Audio, true).await.unwrap();

        factory.emit("bob", PeerLinkEvent::ConnectionState(PeerConnectionState::Failed));
        loop {
            if let PeerEvent::Destroyed { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        registry.add_remote_candidate(&peer, IceCandidate::new(CANDIDATE_A)).await;
        assert_eq!(registry.orphaned_candidates(&peer), 1);

        tokio::time::sleep(registry.config().orphan_candidate_ttl()).await;
        assert_eq!(registry.orphaned_candidates(&peer), 0);
        let record = registry.create(&peer, CallKind::Audio, true).await.unwrap();
        assert_eq!(record.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_event_feed_keeps_every_candidate() {
        let (registry, factory) = registry("alice");
        let peer = UserId::new("bob");
        let mut feed = registry.event_feed();
        registry.create(&peer, CallKind::Audio, true).await.unwrap();

        for port in 0..300u32 {
            let candidate = format!("candidate:1 1 udp 2122260223 10.0.0.1 {} typ host", 40000 + port);
            factory.emit("bob", PeerLinkEvent::LocalCandidate(IceCandidate::new(candidate)));
        }

        let mut ports = Vec::new();
        while ports.len() < 300 {
            match tokio::time::timeout(Duration::from_secs(5), feed.recv()).await.unwrap().unwrap() {
                PeerEvent::LocalCandidate { candidate, .. } => ports.push(candidate.candidate),
                _ => continue,
            }
        }
        assert!(ports[0].ends_with("40000 typ host"));
        assert!(ports[299].ends_with("40299 typ host"));
    }

    #[tokio::test]
    async fn test_slow_connection_does_not_block_other_peers() {
        let (registry, factory) = registry("alice");
        let registry = Arc::new(registry);
        let gate = Arc::new(Semaphore::new(0));
        factory.stalled.lock().insert(UserId::new("slow"), Arc::clone(&gate));

        let stalled = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.create(&UserId::new("slow"), CallKind::Audio, true).await })
        };
        tokio::task::yield_now().await;

        let quick = tokio::time::timeout(
            Duration::from_secs(1),
            registry.create(&UserId::new("bob"), CallKind::Audio, true),
        )
        .await;
        assert!(matches!(quick, Ok(Ok(_))));
        assert!(registry.get(&UserId::new("slow")).await.is_none());

        gate.add_permits(1);
        stalled.await.unwrap().unwrap();
        assert_eq!(
            registry.peer_ids().await,
            vec![UserId::new("bob"), UserId::new("slow")]
        );
    }

    #[tokio::test]
    async fn test_concurrent_admission_creates_one_record() {
        let (registry, factory) = registry("alice");
        let registry = Arc::new(registry);
        let gate = Arc::new(Semaphore::new(0));
        let peer = UserId::new("bob");
        factory.stalled.lock().insert(peer.clone(), Arc::clone(&gate));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let peer = peer.clone();
                tokio::spawn(async move { registry.create(&peer, CallKind::Audio, true).await })
            })
            .collect();
        tokio::task::yield_now().await;
        gate.add_permits(3);

        let records: Vec<Arc<PeerRecord>> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));
        assert_eq!(factory.created.load(Ordering::Relaxed), 1);
        assert!(registry.inner.admitting.lock().is_empty());
    }
}
