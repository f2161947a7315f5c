//! Call session state machine
//!
//! Tracks the lifecycle of direct and room calls and drives the registry
//! and channels for the direct ones.
//!
//! ```text
//!   Connecting ──► Connected ◄──► Reconnecting
//!       │              │               │
//!       └──────────────┴───────┬───────┘
//!                              ▼
//!                       Ended | Failed
//! ```

use crate::channels::{ChannelManager, TransportError};
use crate::identity::{GroupId, UserId};
use crate::media::MediaError;
use crate::peer::{NegotiationError, NegotiationState};
use crate::registry::PeerRegistry;
use crate::signaling::SignalingMessage;
use crate::types::{
    CallEvent, CallId, CallKind, CallScope, CallSession, CallStatus, Counterpart,
    SessionDescription,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Call not found
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// Invalid state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallStatus),

    /// Too many concurrent calls
    #[error("Maximum concurrent calls limit reached: {0}")]
    LimitReached(usize),

    /// Negotiation failed
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Signaling could not be sent
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local media unavailable
    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

/// Call manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Maximum concurrent calls
    pub max_concurrent_calls: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
        }
    }
}

#[derive(Debug)]
struct CallEntry {
    session: CallSession,
    /// Remote offer of an incoming call not yet accepted
    pending_offer: Option<SessionDescription>,
    answered: bool,
}

impl CallEntry {
    fn negotiation_peer(&self) -> Option<UserId> {
        match &self.session.counterpart {
            Counterpart::Peer(id) => Some(id.clone()),
            Counterpart::Room(room) if self.session.scope == CallScope::Direct => {
                Some(UserId::new(room.as_str()))
            }
            Counterpart::Room(_) => None,
        }
    }
}

/// Call manager
///
/// Direct calls negotiate one peer record each; room calls are tracked here
/// for status only while the group orchestrator negotiates the members.
/// A `start_call` with a room counterpart negotiates with the room endpoint
/// itself, keyed by the room id.
pub struct CallManager {
    config: CallConfig,
    channels: Arc<ChannelManager>,
    registry: Arc<PeerRegistry>,
    calls: RwLock<HashMap<CallId, CallEntry>>,
    event_sender: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Create a call manager
    pub fn new(config: CallConfig, channels: Arc<ChannelManager>, registry: Arc<PeerRegistry>) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            config,
            channels,
            registry,
            calls: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// Check whether a status transition is allowed
    #[must_use]
    pub fn is_valid_transition(from: CallStatus, to: CallStatus) -> bool {
        matches!(
            (from, to),
            (CallStatus::Connecting, CallStatus::Connected)
                | (CallStatus::Connecting, CallStatus::Reconnecting)
                | (CallStatus::Connected, CallStatus::Reconnecting)
                | (CallStatus::Reconnecting, CallStatus::Connected)
                | (
                    CallStatus::Connecting | CallStatus::Connected | CallStatus::Reconnecting,
                    CallStatus::Ended | CallStatus::Failed
                )
        )
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }

    async fn admit(&self, entry: CallEntry) -> Result<(), CallError> {
        let mut calls = self.calls.write().await;
        let active = calls.values().filter(|c| !c.session.status.is_terminal()).count();
        if active >= self.config.max_concurrent_calls {
            tracing::warn!(limit = self.config.max_concurrent_calls, "Call limit reached");
            return Err(CallError::LimitReached(self.config.max_concurrent_calls));
        }
        calls.insert(entry.session.id, entry);
        Ok(())
    }

    /// Apply a status transition. Returns the previous status when it
    /// changed; invalid and repeated transitions are ignored.
    async fn transition(&self, call_id: CallId, to: CallStatus) -> Option<CallStatus> {
        let mut calls = self.calls.write().await;
        let entry = calls.get_mut(&call_id)?;
        let from = entry.session.status;
        if !Self::is_valid_transition(from, to) {
            tracing::debug!(call_id = %call_id, from = ?from, to = ?to, "Ignoring call transition");
            return None;
        }
        entry.session.status = to;
        match to {
            CallStatus::Connected if entry.session.start_time.is_none() => {
                entry.session.start_time = Some(Utc::now());
            }
            CallStatus::Ended | CallStatus::Failed => {
                entry.session.end_time = Some(Utc::now());
                entry.pending_offer = None;
            }
            _ => {}
        }
        tracing::debug!(call_id = %call_id, old_state = ?from, new_state = ?to, "Call state transition");
        Some(from)
    }

    async fn release_media_if_idle(&self) {
        let idle = self
            .calls
            .read()
            .await
            .values()
            .all(|c| c.session.status.is_terminal());
        if idle {
            self.registry.media().release();
        }
    }

    /// Place a call.
    ///
    /// # Errors
    ///
    /// Returns error if the limit is reached, negotiation fails, or the
    /// offer cannot be sent; a failed call is marked `Failed`.
    #[tracing::instrument(skip(self))]
    pub async fn start_call(
        &self,
        counterpart: Counterpart,
        call_kind: CallKind,
    ) -> Result<CallId, CallError> {
        let call_id = CallId::new();
        let mut session = CallSession::new(call_id, counterpart.clone(), call_kind, true);
        session.scope = CallScope::Direct;
        let (target, is_room) = match &counterpart {
            Counterpart::Peer(id) => (id.clone(), false),
            Counterpart::Room(room) => (UserId::new(room.as_str()), true),
        };
        self.admit(CallEntry {
            session,
            pending_offer: None,
            answered: false,
        })
        .await?;
        tracing::info!(call_id = %call_id, counterpart = %counterpart, "Initiating call");

        let offer = match self.negotiate_offer(&target, call_kind).await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(call_id, &e.to_string()).await;
                return Err(e);
            }
        };
        let sent = self.channels.dispatch(SignalingMessage::CallOffer {
            target_id: target.to_string(),
            is_room,
            call_id,
            sdp: offer.sdp,
            call_kind,
        });
        if let Err(e) = sent {
            self.fail(call_id, &e.to_string()).await;
            return Err(e.into());
        }

        self.emit(CallEvent::Initiated {
            call_id,
            counterpart,
            call_kind,
        });
        Ok(call_id)
    }

    async fn negotiate_offer(
        &self,
        target: &UserId,
        call_kind: CallKind,
    ) -> Result<SessionDescription, CallError> {
        self.registry.create(target, call_kind, true).await?;
        Ok(self.registry.create_offer(target, call_kind).await?)
    }

    /// Record an inbound offer.
    ///
    /// A new call is held in `Connecting` until [`Self::accept`]. An offer
    /// for a call already accepted (renegotiation or ICE restart) is
    /// answered right away; a repeated offer for a pending call replaces
    /// the held one.
    ///
    /// # Errors
    ///
    /// Returns error if the limit is reached or a renegotiation fails
    #[tracing::instrument(skip(self, sdp))]
    pub async fn on_offer(
        &self,
        from: UserId,
        call_id: CallId,
        sdp: String,
        call_kind: CallKind,
    ) -> Result<(), CallError> {
        let offer = SessionDescription::offer(sdp);
        let answered = {
            let mut calls = self.calls.write().await;
            match calls.get_mut(&call_id) {
                Some(entry) if entry.session.status.is_terminal() => {
                    tracing::debug!(call_id = %call_id, "Offer for finished call ignored");
                    return Ok(());
                }
                Some(entry) if entry.answered => true,
                Some(entry) => {
                    tracing::debug!(call_id = %call_id, "Repeated offer for pending call");
                    entry.pending_offer = Some(offer.clone());
                    return Ok(());
                }
                None => false,
            }
        };

        if answered {
            tracing::info!(call_id = %call_id, "Renegotiation offer received");
            return self.answer(call_id, &from, &offer, call_kind).await;
        }

        if let Some(existing) = self.call_for_peer(&from).await {
            if *self.registry.local_id() < from {
                tracing::info!(call_id = %call_id, existing = %existing, "Crossed calls, keeping local call");
                return Ok(());
            }
            tracing::info!(call_id = %call_id, existing = %existing, "Crossed calls, yielding to remote call");
            if self.transition(existing, CallStatus::Ended).await.is_some() {
                self.emit(CallEvent::Ended { call_id: existing });
            }
        }

        self.admit(CallEntry {
            session: CallSession::new(call_id, Counterpart::Peer(from.clone()), call_kind, false),
            pending_offer: Some(offer),
            answered: false,
        })
        .await?;
        tracing::info!(call_id = %call_id, from = %from, "Incoming call");
        self.emit(CallEvent::Incoming {
            call_id,
            from,
            call_kind,
        });
        Ok(())
    }

    async fn answer(
        &self,
        call_id: CallId,
        peer: &UserId,
        offer: &SessionDescription,
        call_kind: CallKind,
    ) -> Result<(), CallError> {
        let answer = self.registry.handle_offer(peer, offer, call_kind).await?;
        self.channels.dispatch(SignalingMessage::CallAnswer {
            call_id,
            target_id: peer.to_string(),
            sdp: answer.sdp,
            call_kind,
        })?;
        Ok(())
    }

    /// Accept an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown, not pending, or answering fails
    #[tracing::instrument(skip(self))]
    pub async fn accept(&self, call_id: CallId) -> Result<(), CallError> {
        let (peer, offer, call_kind) = {
            let mut calls = self.calls.write().await;
            let entry = calls.get_mut(&call_id).ok_or(CallError::CallNotFound(call_id))?;
            let status = entry.session.status;
            let Some(peer) = entry.session.peer().cloned() else {
                return Err(CallError::InvalidState(status));
            };
            if entry.answered || status.is_terminal() {
                return Err(CallError::InvalidState(status));
            }
            let Some(offer) = entry.pending_offer.take() else {
                return Err(CallError::InvalidState(status));
            };
            entry.answered = true;
            (peer, offer, entry.session.call_kind)
        };

        if let Err(e) = self.answer(call_id, &peer, &offer, call_kind).await {
            self.fail(call_id, &e.to_string()).await;
            return Err(e);
        }
        tracing::info!(call_id = %call_id, "Call accepted");
        self.emit(CallEvent::Answered { call_id });
        Ok(())
    }

    /// Reject an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown or already answered
    #[tracing::instrument(skip(self))]
    pub async fn reject(&self, call_id: CallId) -> Result<(), CallError> {
        let (peer, call_kind) = {
            let calls = self.calls.read().await;
            let entry = calls.get(&call_id).ok_or(CallError::CallNotFound(call_id))?;
            let status = entry.session.status;
            match entry.session.peer() {
                Some(peer) if !entry.answered && !status.is_terminal() => {
                    (peer.clone(), entry.session.call_kind)
                }
                _ => return Err(CallError::InvalidState(status)),
            }
        };
        self.send_end(call_id, &peer, call_kind);
        self.registry.destroy(&peer).await;
        if self.transition(call_id, CallStatus::Ended).await.is_some() {
            tracing::info!(call_id = %call_id, "Call rejected");
            self.emit(CallEvent::Ended { call_id });
        }
        self.release_media_if_idle().await;
        Ok(())
    }

    /// Apply the remote answer to an outgoing call
    ///
    /// # Errors
    ///
    /// Returns error if the answer cannot be applied
    #[tracing::instrument(skip(self, sdp))]
    pub async fn on_answer(
        &self,
        from: UserId,
        call_id: CallId,
        sdp: String,
        call_kind: CallKind,
    ) -> Result<(), CallError> {
        let known = {
            let calls = self.calls.read().await;
            match calls.get(&call_id) {
                Some(entry) if entry.session.status.is_terminal() => {
                    tracing::debug!(call_id = %call_id, "Answer for finished call ignored");
                    return Ok(());
                }
                Some(_) => true,
                None => false,
            }
        };
        if !known {
            tracing::warn!(call_id = %call_id, from = %from, "Answer for unknown call");
        }

        let answer = SessionDescription::answer(sdp);
        if let Err(e) = self.registry.handle_answer(&from, &answer, call_kind).await {
            if known {
                self.fail(call_id, &e.to_string()).await;
            }
            return Err(e.into());
        }

        if known {
            let first = {
                let mut calls = self.calls.write().await;
                calls.get_mut(&call_id).is_some_and(|entry| !std::mem::replace(&mut entry.answered, true))
            };
            if first {
                self.emit(CallEvent::Answered { call_id });
            }
        }
        Ok(())
    }

    /// Follow the negotiation state of a peer's record
    pub async fn on_peer_state(&self, peer_id: &UserId, state: NegotiationState) {
        let target = match state {
            NegotiationState::Connected => CallStatus::Connected,
            NegotiationState::Reconnecting => CallStatus::Reconnecting,
            NegotiationState::Failed => CallStatus::Failed,
            NegotiationState::Closed => CallStatus::Ended,
            _ => return,
        };
        let Some(call_id) = self.call_for_peer(peer_id).await else {
            return;
        };

        match target {
            CallStatus::Failed => self.fail(call_id, "peer connection failed").await,
            CallStatus::Ended => {
                if self.transition(call_id, CallStatus::Ended).await.is_some() {
                    tracing::info!(call_id = %call_id, "Call ended by connection close");
                    self.emit(CallEvent::Ended { call_id });
                    self.release_media_if_idle().await;
                }
            }
            CallStatus::Connected => {
                if self.transition(call_id, CallStatus::Connected).await.is_some() {
                    tracing::info!(call_id = %call_id, "Call connected");
                    self.emit(CallEvent::Connected { call_id });
                }
            }
            CallStatus::Reconnecting | CallStatus::Connecting => {
                if self.transition(call_id, CallStatus::Reconnecting).await.is_some() {
                    tracing::warn!(call_id = %call_id, "Call reconnecting");
                    self.emit(CallEvent::Reconnecting { call_id });
                }
            }
        }
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns error if the call is unknown or already finished
    #[tracing::instrument(skip(self))]
    pub async fn end(&self, call_id: CallId) -> Result<(), CallError> {
        let (peer, call_kind, status) = {
            let calls = self.calls.read().await;
            let entry = calls.get(&call_id).ok_or(CallError::CallNotFound(call_id))?;
            (entry.negotiation_peer(), entry.session.call_kind, entry.session.status)
        };
        if status.is_terminal() {
            return Err(CallError::InvalidState(status));
        }
        if let Some(peer) = &peer {
            self.send_end(call_id, peer, call_kind);
            self.registry.destroy(peer).await;
        }
        if self.transition(call_id, CallStatus::Ended).await.is_some() {
            tracing::info!(call_id = %call_id, "Call ended");
            self.emit(CallEvent::Ended { call_id });
        }
        self.release_media_if_idle().await;
        Ok(())
    }

    /// The remote side hung up or rejected; repeated notices are ignored
    pub async fn on_remote_end(&self, from: &UserId, call_id: CallId) {
        let peer = {
            let calls = self.calls.read().await;
            match calls.get(&call_id) {
                Some(entry) if !entry.session.status.is_terminal() => entry.negotiation_peer(),
                _ => return,
            }
        };
        if peer.as_ref() != Some(from) {
            tracing::debug!(call_id = %call_id, from = %from, "End notice from a non-participant ignored");
            return;
        }
        if let Some(peer) = &peer {
            self.registry.destroy(peer).await;
        }
        if self.transition(call_id, CallStatus::Ended).await.is_some() {
            tracing::info!(call_id = %call_id, "Call ended by remote");
            self.emit(CallEvent::Ended { call_id });
        }
        self.release_media_if_idle().await;
    }

    /// Mark a call failed and release its resources
    #[tracing::instrument(skip(self))]
    pub async fn fail(&self, call_id: CallId, reason: &str) {
        let (peer, call_kind) = {
            let calls = self.calls.read().await;
            match calls.get(&call_id) {
                Some(entry) => (entry.negotiation_peer(), entry.session.call_kind),
                None => return,
            }
        };
        if self.transition(call_id, CallStatus::Failed).await.is_none() {
            return;
        }
        tracing::warn!(call_id = %call_id, reason, "Call failed");
        if let Some(peer) = &peer {
            self.send_end(call_id, peer, call_kind);
            self.registry.destroy(peer).await;
        }
        self.emit(CallEvent::Failed {
            call_id,
            error: reason.to_string(),
        });
        self.release_media_if_idle().await;
    }

    fn send_end(&self, call_id: CallId, peer: &UserId, call_kind: CallKind) {
        if let Err(e) = self.channels.dispatch(SignalingMessage::CallEnd {
            call_id,
            target_id: peer.to_string(),
            call_kind,
        }) {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to send call end");
        }
    }

    /// Track a room call run by the group orchestrator
    ///
    /// # Errors
    ///
    /// Returns error if the limit is reached
    pub async fn begin_room(
        &self,
        group_id: &GroupId,
        call_kind: CallKind,
        outgoing: bool,
    ) -> Result<CallId, CallError> {
        if let Some(existing) = self.call_for_room(group_id).await {
            return Ok(existing);
        }
        let call_id = CallId::new();
        let counterpart = Counterpart::Room(group_id.clone());
        self.admit(CallEntry {
            session: CallSession::new(call_id, counterpart.clone(), call_kind, outgoing),
            pending_offer: None,
            answered: true,
        })
        .await?;
        self.emit(CallEvent::Initiated {
            call_id,
            counterpart,
            call_kind,
        });
        Ok(call_id)
    }

    /// Mark the room call connected once any member's media flows
    pub async fn room_connected(&self, group_id: &GroupId) {
        if let Some(call_id) = self.call_for_room(group_id).await {
            if self.transition(call_id, CallStatus::Connected).await.is_some() {
                self.emit(CallEvent::Connected { call_id });
            }
        }
    }

    /// Close the room call
    pub async fn finish_room(&self, group_id: &GroupId) {
        if let Some(call_id) = self.call_for_room(group_id).await {
            if self.transition(call_id, CallStatus::Ended).await.is_some() {
                tracing::info!(call_id = %call_id, group_id = %group_id, "Room call ended");
                self.emit(CallEvent::Ended { call_id });
            }
        }
        self.release_media_if_idle().await;
    }

    /// Active direct call negotiated with a peer
    pub async fn call_for_peer(&self, peer_id: &UserId) -> Option<CallId> {
        self.calls
            .read()
            .await
            .values()
            .find(|c| !c.session.status.is_terminal() && c.negotiation_peer().as_ref() == Some(peer_id))
            .map(|c| c.session.id)
    }

    /// Active room call of a group
    pub async fn call_for_room(&self, group_id: &GroupId) -> Option<CallId> {
        self.calls
            .read()
            .await
            .values()
            .find(|c| {
                !c.session.status.is_terminal()
                    && c.session.scope == CallScope::Room
                    && c.session.room() == Some(group_id)
            })
            .map(|c| c.session.id)
    }

    /// Session snapshot
    pub async fn get_call(&self, call_id: CallId) -> Option<CallSession> {
        self.calls.read().await.get(&call_id).map(|c| c.session.clone())
    }

    /// Current status
    pub async fn status(&self, call_id: CallId) -> Option<CallStatus> {
        self.calls.read().await.get(&call_id).map(|c| c.session.status)
    }

    /// Calls not yet ended or failed
    pub async fn active_calls(&self) -> Vec<CallSession> {
        self.calls
            .read()
            .await
            .values()
            .filter(|c| !c.session.status.is_terminal())
            .map(|c| c.session.clone())
            .collect()
    }

    /// Drop finished sessions
    pub async fn clear_finished(&self) -> usize {
        let mut calls = self.calls.write().await;
        let before = calls.len();
        calls.retain(|_, c| !c.session.status.is_terminal());
        before - calls.len()
    }
}
