//! Group call orchestration
//!
//! Keeps a roster per group call and drives one registry record per member.
//! Under [`GroupStrategy::ServerManaged`] a joiner only answers; the room's
//! creator offers to each arrival. Under [`GroupStrategy::Mesh`] a joiner
//! offers to every member it is not yet connected to.

use crate::call::{CallError, CallManager};
use crate::channels::{ChannelManager, TransportError};
use crate::identity::{GroupId, UserId};
use crate::media::AcquireConfig;
use crate::peer::{NegotiationError, NegotiationState};
use crate::registry::PeerRegistry;
use crate::signaling::SignalingMessage;
use crate::types::{CallId, CallKind, IceCandidate, SessionDescription, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Roster errors
#[derive(Error, Debug, Clone)]
pub enum RosterError {
    /// No active call for the group
    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    /// User is not on the roster
    #[error("Member {user_id} not found in group {group_id}")]
    MemberNotFound {
        /// Group
        group_id: GroupId,
        /// Missing member
        user_id: UserId,
    },

    /// Coordination layer query failed
    #[error("Roster query failed: {0}")]
    Query(String),
}

/// Group orchestration errors
#[derive(Error, Debug)]
pub enum GroupError {
    /// Roster problem
    #[error(transparent)]
    Roster(#[from] RosterError),

    /// Negotiation with a member failed
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Signaling could not be sent
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Room call could not be tracked
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// How members of a group call connect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategy {
    /// Joiners wait for offers from the creator
    #[default]
    ServerManaged,
    /// Joiners offer to every member
    Mesh,
}

/// Group call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Connection strategy
    pub strategy: GroupStrategy,
    /// Ask the coordination layer to create a roster when none is active
    pub allow_create: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            strategy: GroupStrategy::ServerManaged,
            allow_create: true,
        }
    }
}

/// Active roster as reported by the coordination layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterSnapshot {
    /// Group
    pub group_id: GroupId,
    /// Member who started the call
    pub creator_id: UserId,
    /// Audio or video
    pub call_kind: CallKind,
    /// Members currently in the call
    #[serde(default)]
    pub participants: Vec<UserId>,
}

/// Coordination layer holding active group call rosters
#[async_trait]
pub trait RosterService: Send + Sync {
    /// Active roster of a group call, `None` when there is none
    async fn active_roster(
        &self,
        group_id: &GroupId,
        call_kind: CallKind,
        allow_create: bool,
    ) -> Result<Option<RosterSnapshot>, RosterError>;
}

/// One roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterMember {
    /// Member
    pub user_id: UserId,
    /// Joined the call at least once
    pub has_joined: bool,
    /// Currently in the call
    pub is_active: bool,
    /// Audio muted
    pub is_muted: bool,
}

impl RosterMember {
    fn joined(user_id: UserId) -> Self {
        Self {
            user_id,
            has_joined: true,
            is_active: true,
            is_muted: false,
        }
    }
}

/// Participants of a group call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRoster {
    /// Group
    pub group_id: GroupId,
    /// Audio or video
    pub call_kind: CallKind,
    /// Member who started the call
    pub creator_id: UserId,
    /// Members in arrival order
    pub members: Vec<RosterMember>,
    /// Room call tracked by the call manager
    #[serde(skip)]
    pub call_id: Option<CallId>,
}

impl GroupRoster {
    /// Empty roster
    pub fn new(group_id: GroupId, call_kind: CallKind, creator_id: UserId) -> Self {
        Self {
            group_id,
            call_kind,
            creator_id,
            members: Vec::new(),
            call_id: None,
        }
    }

    /// Build from a coordination layer snapshot
    pub fn from_snapshot(snapshot: RosterSnapshot) -> Self {
        let mut roster = Self::new(snapshot.group_id, snapshot.call_kind, snapshot.creator_id);
        for user_id in snapshot.participants {
            roster.upsert_active(&user_id);
        }
        roster
    }

    /// Find a member
    #[must_use]
    pub fn member(&self, user_id: &UserId) -> Option<&RosterMember> {
        self.members.iter().find(|m| &m.user_id == user_id)
    }

    /// Mark a member joined and active. Returns false if it already was.
    pub fn upsert_active(&mut self, user_id: &UserId) -> bool {
        match self.members.iter_mut().find(|m| &m.user_id == user_id) {
            Some(member) if member.is_active => false,
            Some(member) => {
                member.has_joined = true;
                member.is_active = true;
                true
            }
            None => {
                self.members.push(RosterMember::joined(user_id.clone()));
                true
            }
        }
    }

    /// Mark a member inactive. Returns false if it already was, or is absent.
    pub fn deactivate(&mut self, user_id: &UserId) -> bool {
        match self.members.iter_mut().find(|m| &m.user_id == user_id) {
            Some(member) if member.is_active => {
                member.is_active = false;
                true
            }
            _ => false,
        }
    }

    /// Active members other than `except`
    #[must_use]
    pub fn active_except(&self, except: &UserId) -> Vec<UserId> {
        self.members
            .iter()
            .filter(|m| m.is_active && &m.user_id != except)
            .map(|m| m.user_id.clone())
            .collect()
    }

    /// Every member other than `except`, active or not
    #[must_use]
    pub fn others(&self, except: &UserId) -> Vec<UserId> {
        self.members
            .iter()
            .filter(|m| &m.user_id != except)
            .map(|m| m.user_id.clone())
            .collect()
    }
}

/// Group call events
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// Local participant joined
    Joined {
        /// Group
        group_id: GroupId,
        /// Roster at join time
        roster: GroupRoster,
    },
    /// Remote member joined
    MemberJoined {
        /// Group
        group_id: GroupId,
        /// Member
        user_id: UserId,
    },
    /// Remote member left
    MemberLeft {
        /// Group
        group_id: GroupId,
        /// Member
        user_id: UserId,
    },
    /// Offer sent to a member
    OfferSent {
        /// Group
        group_id: GroupId,
        /// Member
        peer_id: UserId,
    },
    /// Local participant left
    Left {
        /// Group
        group_id: GroupId,
    },
    /// Call ended for every member
    Ended {
        /// Group
        group_id: GroupId,
    },
    /// A user-initiated group operation failed
    Error {
        /// Group
        group_id: GroupId,
        /// Error description
        error: String,
    },
}

/// Group call orchestrator
pub struct GroupCallOrchestrator {
    config: GroupConfig,
    channels: Arc<ChannelManager>,
    registry: Arc<PeerRegistry>,
    calls: Arc<CallManager>,
    roster_service: Arc<dyn RosterService>,
    rosters: RwLock<HashMap<GroupId, GroupRoster>>,
    event_sender: broadcast::Sender<GroupEvent>,
}

impl GroupCallOrchestrator {
    /// Create an orchestrator
    pub fn new(
        config: GroupConfig,
        channels: Arc<ChannelManager>,
        registry: Arc<PeerRegistry>,
        calls: Arc<CallManager>,
        roster_service: Arc<dyn RosterService>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            config,
            channels,
            registry,
            calls,
            roster_service,
            rosters: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Subscribe to group events
    pub fn subscribe_events(&self) -> broadcast::Receiver<GroupEvent> {
        self.event_sender.subscribe()
    }

    fn local_id(&self) -> &UserId {
        self.registry.local_id()
    }

    fn emit(&self, event: GroupEvent) {
        let _ = self.event_sender.send(event);
    }

    fn report<T, E: Into<GroupError>>(&self, group_id: &GroupId, result: Result<T, E>) -> Result<T, GroupError> {
        result.map_err(|e| {
            let err = e.into();
            tracing::warn!(group_id = %group_id, error = %err, "Group operation failed");
            self.emit(GroupEvent::Error {
                group_id: group_id.clone(),
                error: err.to_string(),
            });
            err
        })
    }

    async fn joined_roster(&self, group_id: &GroupId) -> Option<GroupRoster> {
        self.rosters.read().await.get(group_id).cloned()
    }

    async fn acquire_media(&self, call_kind: CallKind) {
        let media = self.registry.media();
        let config = AcquireConfig::for_call(call_kind, media.config().orientation);
        if let Err(e) = media.acquire(config).await {
            tracing::warn!(error = %e, "Media acquisition for group call failed, continuing receive-only");
        }
    }

    /// Start a new group call with the local participant as creator
    ///
    /// # Errors
    ///
    /// Returns error if presence cannot be announced
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, group_id: &GroupId, call_kind: CallKind) -> Result<GroupRoster, GroupError> {
        if let Some(roster) = self.joined_roster(group_id).await {
            return Ok(roster);
        }
        let mut roster = GroupRoster::new(group_id.clone(), call_kind, self.local_id().clone());
        roster.upsert_active(self.local_id());
        self.enter(roster).await
    }

    /// Join the active call of a group
    ///
    /// # Errors
    ///
    /// Returns [`RosterError::GroupNotFound`] when the group has no active
    /// call, or an error if presence cannot be announced
    #[tracing::instrument(skip(self))]
    pub async fn join(&self, group_id: &GroupId, call_kind: CallKind) -> Result<GroupRoster, GroupError> {
        if let Some(roster) = self.joined_roster(group_id).await {
            tracing::debug!("Already joined");
            return Ok(roster);
        }

        let snapshot = self
            .roster_service
            .active_roster(group_id, call_kind, self.config.allow_create)
            .await
            .and_then(|s| s.ok_or_else(|| RosterError::GroupNotFound(group_id.clone())));
        let snapshot = self.report(group_id, snapshot)?;

        let mut roster = GroupRoster::from_snapshot(snapshot);
        roster.group_id = group_id.clone();
        roster.call_kind = call_kind;
        roster.upsert_active(self.local_id());
        self.enter(roster).await
    }

    async fn enter(&self, mut roster: GroupRoster) -> Result<GroupRoster, GroupError> {
        let group_id = roster.group_id.clone();
        let call_kind = roster.call_kind;
        let outgoing = &roster.creator_id == self.local_id();

        let call_id = self.calls.begin_room(&group_id, call_kind, outgoing).await;
        let call_id = self.report(&group_id, call_id)?;
        roster.call_id = Some(call_id);

        // Replies to the announcement must find the roster.
        self.rosters.write().await.insert(group_id.clone(), roster.clone());
        let announced = self.channels.dispatch(SignalingMessage::GroupCallUserJoined {
            room_id: group_id.clone(),
            user_id: self.local_id().clone(),
            call_id: Some(call_id),
            call_kind,
        });
        if let Err(e) = self.report(&group_id, announced) {
            self.rosters.write().await.remove(&group_id);
            self.calls.finish_room(&group_id).await;
            return Err(e);
        }

        tracing::info!(
            group_id = %group_id,
            members = roster.members.len(),
            strategy = ?self.config.strategy,
            "Joined group call"
        );
        self.acquire_media(call_kind).await;
        self.emit(GroupEvent::Joined {
            group_id: group_id.clone(),
            roster: roster.clone(),
        });

        if self.config.strategy == GroupStrategy::Mesh {
            self.offer_to_roster(&group_id).await;
        }
        Ok(roster)
    }

    /// Offer to every active member without a live record
    async fn offer_to_roster(&self, group_id: &GroupId) {
        let Some(roster) = self.joined_roster(group_id).await else {
            return;
        };
        for member in roster.active_except(self.local_id()) {
            if self.registry.is_live(&member).await {
                tracing::trace!(peer_id = %member, "Member already connected");
                continue;
            }
            if let Err(e) = self.offer_to(group_id, &member, roster.call_kind).await {
                tracing::warn!(group_id = %group_id, peer_id = %member, error = %e, "Offer to member failed");
            }
        }
    }

    async fn offer_to(&self, group_id: &GroupId, member: &UserId, call_kind: CallKind) -> Result<(), GroupError> {
        let offer = self.registry.create_offer(member, call_kind).await?;
        let sent = self.channels.dispatch(SignalingMessage::GroupCallOffer {
            room_id: group_id.clone(),
            peer_id: member.clone(),
            sdp: offer.sdp,
            call_kind,
        });
        if let Err(e) = sent {
            // A member whose offer was never sent must not count as live.
            self.registry.destroy(member).await;
            return Err(e.into());
        }
        tracing::debug!(group_id = %group_id, peer_id = %member, "Offer sent to member");
        self.emit(GroupEvent::OfferSent {
            group_id: group_id.clone(),
            peer_id: member.clone(),
        });
        Ok(())
    }

    /// A member announced itself
    #[tracing::instrument(skip(self))]
    pub async fn on_member_joined(&self, group_id: &GroupId, user_id: &UserId) {
        if user_id == self.local_id() {
            return;
        }
        let is_creator = {
            let mut rosters = self.rosters.write().await;
            let Some(roster) = rosters.get_mut(group_id) else {
                tracing::trace!("Join for a group not joined locally");
                return;
            };
            if roster.upsert_active(user_id) {
                self.emit(GroupEvent::MemberJoined {
                    group_id: group_id.clone(),
                    user_id: user_id.clone(),
                });
            }
            &roster.creator_id == self.local_id()
        };
        if is_creator {
            self.offer_to_roster(group_id).await;
        }
    }

    /// A member left; idempotent
    #[tracing::instrument(skip(self))]
    pub async fn on_member_left(&self, group_id: &GroupId, user_id: &UserId) {
        let changed = {
            let mut rosters = self.rosters.write().await;
            let Some(roster) = rosters.get_mut(group_id) else {
                tracing::trace!("Leave for a group not joined locally");
                return;
            };
            roster.deactivate(user_id)
        };
        if !changed {
            return;
        }
        self.registry.destroy(user_id).await;
        tracing::info!(group_id = %group_id, user_id = %user_id, "Member left");
        self.emit(GroupEvent::MemberLeft {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
        });
    }

    /// Answer a member's offer
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be answered
    #[tracing::instrument(skip(self, sdp))]
    pub async fn on_offer(
        &self,
        group_id: &GroupId,
        from: &UserId,
        sdp: String,
        call_kind: CallKind,
    ) -> Result<(), GroupError> {
        {
            let mut rosters = self.rosters.write().await;
            let Some(roster) = rosters.get_mut(group_id) else {
                tracing::trace!("Offer for a group not joined locally");
                return Ok(());
            };
            if roster.upsert_active(from) {
                self.emit(GroupEvent::MemberJoined {
                    group_id: group_id.clone(),
                    user_id: from.clone(),
                });
            }
        }

        let offer = SessionDescription::offer(sdp);
        let answer = match self.registry.handle_offer(from, &offer, call_kind).await {
            Ok(answer) => answer,
            Err(NegotiationError::Glare(_)) => {
                tracing::debug!(peer_id = %from, "Member offer lost the collision");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.channels.dispatch(SignalingMessage::GroupCallAnswer {
            room_id: group_id.clone(),
            peer_id: from.clone(),
            sdp: answer.sdp,
            call_kind,
        })?;
        Ok(())
    }

    /// Apply a member's answer
    ///
    /// # Errors
    ///
    /// Returns error if the answer cannot be applied
    #[tracing::instrument(skip(self, sdp))]
    pub async fn on_answer(
        &self,
        group_id: &GroupId,
        from: &UserId,
        sdp: String,
        call_kind: CallKind,
    ) -> Result<(), GroupError> {
        if !self.rosters.read().await.contains_key(group_id) {
            tracing::trace!("Answer for a group not joined locally");
            return Ok(());
        }
        let answer = SessionDescription::answer(sdp);
        self.registry.handle_answer(from, &answer, call_kind).await?;
        Ok(())
    }

    /// Route a member's candidate to the registry
    pub async fn on_candidate(&self, group_id: &GroupId, from: &UserId, candidate: IceCandidate) {
        if !self.rosters.read().await.contains_key(group_id) {
            tracing::trace!(group_id = %group_id, "Candidate for a group not joined locally");
            return;
        }
        self.registry.add_remote_candidate(from, candidate).await;
    }

    /// Follow member connection states
    pub async fn on_peer_state(&self, peer_id: &UserId, state: NegotiationState) {
        if state != NegotiationState::Connected {
            return;
        }
        if let Some(group_id) = self.group_for_peer(peer_id).await {
            self.calls.room_connected(&group_id).await;
        }
    }

    /// The call was ended for everyone by another member
    pub async fn on_group_end(&self, group_id: &GroupId) {
        let Some(roster) = self.rosters.write().await.remove(group_id) else {
            return;
        };
        self.teardown(&roster).await;
        tracing::info!(group_id = %group_id, "Group call ended remotely");
        self.emit(GroupEvent::Ended {
            group_id: group_id.clone(),
        });
    }

    async fn teardown(&self, roster: &GroupRoster) {
        for member in roster.others(self.local_id()) {
            self.registry.destroy(&member).await;
        }
        self.calls.finish_room(&roster.group_id).await;
    }

    /// Leave a group call; the last active member ends it for all
    ///
    /// # Errors
    ///
    /// Returns error if the group is not joined
    #[tracing::instrument(skip(self))]
    pub async fn leave(&self, group_id: &GroupId) -> Result<(), GroupError> {
        let roster = self.rosters.write().await.remove(group_id);
        let roster = self.report(group_id, roster.ok_or_else(|| RosterError::GroupNotFound(group_id.clone())))?;
        let last = roster.active_except(self.local_id()).is_empty();

        self.teardown(&roster).await;
        let left = self.channels.dispatch(SignalingMessage::GroupCallUserLeft {
            room_id: group_id.clone(),
            user_id: self.local_id().clone(),
            call_id: roster.call_id,
            call_kind: roster.call_kind,
        });
        tracing::info!(group_id = %group_id, last, "Left group call");
        self.emit(GroupEvent::Left {
            group_id: group_id.clone(),
        });
        if last {
            self.broadcast_end(&roster);
        }
        self.report(group_id, left).map(|_| ())
    }

    /// End the call for every member
    ///
    /// # Errors
    ///
    /// Returns error if the group is not joined or the end notice cannot be sent
    #[tracing::instrument(skip(self))]
    pub async fn end_for_all(&self, group_id: &GroupId) -> Result<(), GroupError> {
        let roster = self.rosters.write().await.remove(group_id);
        let roster = self.report(group_id, roster.ok_or_else(|| RosterError::GroupNotFound(group_id.clone())))?;
        self.teardown(&roster).await;
        let sent = self.broadcast_end(&roster);
        self.report(group_id, sent)
    }

    fn broadcast_end(&self, roster: &GroupRoster) -> Result<(), TransportError> {
        let sent = self.channels.dispatch(SignalingMessage::GroupCallEnd {
            room_id: roster.group_id.clone(),
            call_kind: roster.call_kind,
        });
        tracing::info!(group_id = %roster.group_id, "Group call ended for all");
        self.emit(GroupEvent::Ended {
            group_id: roster.group_id.clone(),
        });
        sent.map(|_| ())
    }

    /// Mute or unmute local audio in a group call
    ///
    /// # Errors
    ///
    /// Returns error if the group is not joined
    pub async fn set_local_muted(&self, group_id: &GroupId, muted: bool) -> Result<(), GroupError> {
        {
            let mut rosters = self.rosters.write().await;
            let roster = rosters
                .get_mut(group_id)
                .ok_or_else(|| RosterError::GroupNotFound(group_id.clone()));
            let roster = self.report(group_id, roster)?;
            let local = self.registry.local_id().clone();
            let member = roster.members.iter_mut().find(|m| m.user_id == local).ok_or_else(|| {
                RosterError::MemberNotFound {
                    group_id: group_id.clone(),
                    user_id: local.clone(),
                }
            });
            self.report(group_id, member)?.is_muted = muted;
        }
        self.registry.set_track_enabled(TrackKind::Audio, !muted).await?;
        Ok(())
    }

    /// Roster snapshot
    pub async fn roster(&self, group_id: &GroupId) -> Option<GroupRoster> {
        self.joined_roster(group_id).await
    }

    /// Joined groups
    pub async fn groups(&self) -> Vec<GroupId> {
        self.rosters.read().await.keys().cloned().collect()
    }

    /// Group whose roster holds an active `peer_id`
    pub async fn group_for_peer(&self, peer_id: &UserId) -> Option<GroupId> {
        self.rosters
            .read()
            .await
            .values()
            .find(|r| r.member(peer_id).is_some_and(|m| m.is_active))
            .map(|r| r.group_id.clone())
    }
}

#[cfg(feature = "http-roster")]
mod http {
    use super::{RosterError, RosterService, RosterSnapshot};
    use crate::identity::{GroupId, IdentityProvider};
    use crate::types::CallKind;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::Arc;
    use url::Url;

    /// Roster service over the coordination layer's HTTP API
    pub struct HttpRosterService {
        client: reqwest::Client,
        base_url: Url,
        identity: Arc<dyn IdentityProvider>,
    }

    impl HttpRosterService {
        /// Create a service rooted at `base_url`
        pub fn new(base_url: Url, identity: Arc<dyn IdentityProvider>) -> Self {
            Self {
                client: reqwest::Client::new(),
                base_url,
                identity,
            }
        }

        /// Roster query URL
        ///
        /// # Errors
        ///
        /// Returns error if the base URL cannot be joined
        pub fn roster_url(
            &self,
            group_id: &GroupId,
            call_kind: CallKind,
            allow_create: bool,
        ) -> Result<Url, RosterError> {
            let mut url = self
                .base_url
                .join("active-call-roster")
                .map_err(|e| RosterError::Query(e.to_string()))?;
            url.query_pairs_mut()
                .append_pair("groupId", group_id.as_str())
                .append_pair("allowCreate", if allow_create { "true" } else { "false" })
                .append_pair("callKind", &call_kind.to_string());
            Ok(url)
        }
    }

    #[async_trait]
    impl RosterService for HttpRosterService {
        async fn active_roster(
            &self,
            group_id: &GroupId,
            call_kind: CallKind,
            allow_create: bool,
        ) -> Result<Option<RosterSnapshot>, RosterError> {
            let url = self.roster_url(group_id, call_kind, allow_create)?;
            let mut request = self.client.get(url);
            if let Some(principal) = self.identity.principal() {
                request = request.bearer_auth(principal.token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| RosterError::Query(e.to_string()))?;
            if response.status() == StatusCode::NOT_FOUND {
                tracing::debug!(group_id = %group_id, "No active roster");
                return Ok(None);
            }
            let response = response
                .error_for_status()
                .map_err(|e| RosterError::Query(e.to_string()))?;
            let snapshot = response
                .json::<RosterSnapshot>()
                .await
                .map_err(|e| RosterError::Query(e.to_string()))?;
            Ok(Some(snapshot))
        }
    }

}

#[cfg(feature = "http-roster")]
pub use http::HttpRosterService;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roster() -> GroupRoster {
        GroupRoster::from_snapshot(RosterSnapshot {
            group_id: GroupId::new("g1"),
            creator_id: UserId::new("alice"),
            call_kind: CallKind::Audio,
            participants: vec![UserId::new("alice"), UserId::new("bob")],
        })
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut roster = roster();
        assert!(!roster.upsert_active(&UserId::new("bob")));
        assert!(roster.upsert_active(&UserId::new("carol")));
        assert!(!roster.upsert_active(&UserId::new("carol")));
        assert_eq!(roster.members.len(), 3);
    }

    #[test]
    fn test_deactivate_is_idempotent() {
        let mut roster = roster();
        let bob = UserId::new("bob");
        assert!(roster.deactivate(&bob));
        assert!(!roster.deactivate(&bob));
        assert!(!roster.deactivate(&UserId::new("nobody")));

        let member = roster.member(&bob).unwrap();
        assert!(member.has_joined);
        assert!(!member.is_active);
        assert!(roster.upsert_active(&bob));
    }

    #[test]
    fn test_active_except() {
        let mut roster = roster();
        roster.upsert_active(&UserId::new("carol"));
        roster.deactivate(&UserId::new("bob"));
        assert_eq!(roster.active_except(&UserId::new("alice")), vec![UserId::new("carol")]);
        assert_eq!(roster.others(&UserId::new("alice")).len(), 2);
    }

    #[test]
    fn test_snapshot_wire_format() {
        let json = r#"{"groupId":"g1","creatorId":"alice","callKind":"video","participants":["alice","bob"]}"#;
        let snapshot: RosterSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.creator_id, UserId::new("alice"));
        assert_eq!(snapshot.call_kind, CallKind::Video);
        assert_eq!(snapshot.participants.len(), 2);
    }

    #[test]
    fn test_strategy_default() {
        let config: GroupConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.strategy, GroupStrategy::ServerManaged);
        assert!(config.allow_create);
        let mesh: GroupConfig = serde_json::from_str(r#"{"strategy":"mesh"}"#).unwrap();
        assert_eq!(mesh.strategy, GroupStrategy::Mesh);
    }
}
