//! End-to-end direct calls and chat between sessions sharing a relay

#![allow(clippy::unwrap_used)]

mod common;

use common::{eventually, join_hub, next_event, settle, wait_for_no_record, wait_for_state, Hub, StaticRoster};
use fieldlink_core::call::CallError;
use fieldlink_core::peer::PeerConnectionState;
use fieldlink_core::peer::PeerLinkEvent;
use fieldlink_core::{
    conversation_id, CallEvent, CallKind, CallStatus, NegotiationState, SessionConfig, SessionError, SessionEvent,
    SignalingMessage, UserId,
};
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;

fn limited(max_concurrent_calls: usize) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.calls.max_concurrent_calls = max_concurrent_calls;
    config
}

#[tokio::test]
async fn test_direct_video_call_connects_and_ends() {
    let hub = Hub::new();
    let roster = StaticRoster::new();
    let mut alice = join_hub(&hub, "alice", roster.clone(), SessionConfig::default()).await;
    let mut bob = join_hub(&hub, "bob", roster, SessionConfig::default()).await;

    let call_id = alice.session.start_call(bob.id(), CallKind::Video).await.unwrap();

    match next_event(&mut bob.events, |e| matches!(e, SessionEvent::Call(CallEvent::Incoming { .. }))).await {
        SessionEvent::Call(CallEvent::Incoming { call_id: incoming, from, call_kind }) => {
            assert_eq!(incoming, call_id);
            assert_eq!(from, alice.id());
            assert_eq!(call_kind, CallKind::Video);
        }
        other => unreachable!("Expected Incoming, got: {:?}", other),
    }
    assert_eq!(bob.session.calls().status(call_id).await, Some(CallStatus::Connecting));

    assert_ok!(bob.session.accept_call(call_id).await);
    next_event(&mut alice.events, |e| {
        matches!(e, SessionEvent::Call(CallEvent::Answered { call_id: id }) if *id == call_id)
    })
    .await;
    wait_for_state(alice.session.registry(), "bob", NegotiationState::AnswerExchanged).await;
    wait_for_state(bob.session.registry(), "alice", NegotiationState::AnswerExchanged).await;

    // Each side gathered one candidate; both must reach the other's link.
    let bob_link = bob.factory.link("alice");
    let alice_link = alice.factory.link("bob");
    eventually("alice's candidate applied at bob", || bob_link.applied.lock().len() == 1).await;
    eventually("bob's candidate applied at alice", || alice_link.applied.lock().len() == 1).await;

    alice.factory.emit("bob", PeerLinkEvent::ConnectionState(PeerConnectionState::Connected));
    bob.factory.emit("alice", PeerLinkEvent::ConnectionState(PeerConnectionState::Connected));
    next_event(&mut alice.events, |e| {
        matches!(e, SessionEvent::Call(CallEvent::Connected { call_id: id }) if *id == call_id)
    })
    .await;
    let session = alice.session.calls().get_call(call_id).await.unwrap();
    assert_eq!(session.status, CallStatus::Connected);
    assert!(session.start_time.is_some());
    assert_eq!(session.peer(), Some(&bob.id()));

    alice.session.end_call(call_id).await.unwrap();
    next_event(&mut bob.events, |e| {
        matches!(e, SessionEvent::Call(CallEvent::Ended { call_id: id }) if *id == call_id)
    })
    .await;
    assert_eq!(bob.session.calls().status(call_id).await, Some(CallStatus::Ended));
    wait_for_no_record(bob.session.registry(), "alice").await;
    assert!(alice.session.registry().get(&bob.id()).await.is_none());
    assert!(alice.session.media().bundle().is_none());

    match alice.session.end_call(call_id).await {
        Err(SessionError::Call(CallError::InvalidState(CallStatus::Ended))) => {}
        other => unreachable!("Expected InvalidState, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_call_ends_on_both_sides() {
    let hub = Hub::new();
    let roster = StaticRoster::new();
    let mut alice = join_hub(&hub, "alice", roster.clone(), SessionConfig::default()).await;
    let mut bob = join_hub(&hub, "bob", roster, SessionConfig::default()).await;

    let call_id = alice.session.start_call(bob.id(), CallKind::Audio).await.unwrap();
    next_event(&mut bob.events, |e| matches!(e, SessionEvent::Call(CallEvent::Incoming { .. }))).await;

    bob.session.reject_call(call_id).await.unwrap();
    next_event(&mut alice.events, |e| {
        matches!(e, SessionEvent::Call(CallEvent::Ended { call_id: id }) if *id == call_id)
    })
    .await;

    assert_eq!(alice.session.calls().status(call_id).await, Some(CallStatus::Ended));
    wait_for_no_record(alice.session.registry(), "bob").await;
    assert_eq!(bob.factory.created(), 0, "rejecting never builds a connection");
}

#[tokio::test]
async fn test_offer_addressed_elsewhere_is_ignored() {
    let hub = Hub::new();
    let roster = StaticRoster::new();
    let alice = join_hub(&hub, "alice", roster.clone(), SessionConfig::default()).await;
    let mut bob = join_hub(&hub, "bob", roster.clone(), SessionConfig::default()).await;
    let mut carol = join_hub(&hub, "carol", roster, SessionConfig::default()).await;

    alice.session.start_call(bob.id(), CallKind::Audio).await.unwrap();
    next_event(&mut bob.events, |e| matches!(e, SessionEvent::Call(CallEvent::Incoming { .. }))).await;
    settle().await;

    while let Ok(event) = carol.events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::Call(CallEvent::Incoming { .. })),
            "carol must not see bob's call"
        );
    }
    assert!(carol.session.calls().active_calls().await.is_empty());
}

#[tokio::test]
async fn test_call_limit_rejects_extra_call() {
    let hub = Hub::new();
    let roster = StaticRoster::new();
    let alice = join_hub(&hub, "alice", roster.clone(), limited(1)).await;
    let mut bob = join_hub(&hub, "bob", roster.clone(), limited(1)).await;
    let carol = join_hub(&hub, "carol", roster, SessionConfig::default()).await;

    alice.session.start_call(bob.id(), CallKind::Audio).await.unwrap();
    match alice.session.start_call(carol.id(), CallKind::Audio).await {
        Err(SessionError::Call(CallError::LimitReached(1))) => {}
        other => unreachable!("Expected LimitReached, got: {:?}", other),
    }
    assert_eq!(alice.session.calls().active_calls().await.len(), 1);

    // Bob is at his own limit once alice's call arrives; carol's call is refused
    next_event(&mut bob.events, |e| matches!(e, SessionEvent::Call(CallEvent::Incoming { .. }))).await;
    carol.session.start_call(bob.id(), CallKind::Audio).await.unwrap();
    settle().await;
    assert_eq!(bob.session.calls().active_calls().await.len(), 1);
}

#[tokio::test]
async fn test_remote_peer_failure_fails_call() {
    let hub = Hub::new();
    let roster = StaticRoster::new();
    let mut alice = join_hub(&hub, "alice", roster.clone(), SessionConfig::default()).await;
    let mut bob = join_hub(&hub, "bob", roster, SessionConfig::default()).await;

    let call_id = alice.session.start_call(bob.id(), CallKind::Audio).await.unwrap();
    next_event(&mut bob.events, |e| matches!(e, SessionEvent::Call(CallEvent::Incoming { .. }))).await;
    bob.session.accept_call(call_id).await.unwrap();
    wait_for_state(alice.session.registry(), "bob", NegotiationState::AnswerExchanged).await;

    alice.factory.emit("bob", PeerLinkEvent::ConnectionState(PeerConnectionState::Failed));
    match next_event(&mut alice.events, |e| matches!(e, SessionEvent::Call(CallEvent::Failed { .. }))).await {
        SessionEvent::Call(CallEvent::Failed { call_id: failed, .. }) => assert_eq!(failed, call_id),
        other => unreachable!("Expected Failed, got: {:?}", other),
    }
    next_event(&mut bob.events, |e| {
        matches!(e, SessionEvent::Call(CallEvent::Ended { call_id: id }) if *id == call_id)
    })
    .await;
    assert_eq!(alice.session.calls().status(call_id).await, Some(CallStatus::Failed));
}

#[tokio::test]
async fn test_chat_reaches_peer_with_conversation_id() {
    let hub = Hub::new();
    let roster = StaticRoster::new();
    let alice = join_hub(&hub, "alice", roster.clone(), SessionConfig::default()).await;
    let mut bob = join_hub(&hub, "bob", roster, SessionConfig::default()).await;

    let payload = serde_json::json!({"text": "grid 4 clear", "priority": "high"});
    let sent = alice.session.send_chat(&bob.id(), payload.clone()).unwrap();
    assert!(sent.seq.is_some());

    match next_event(&mut bob.events, |e| matches!(e, SessionEvent::Chat { .. })).await {
        SessionEvent::Chat {
            conversation_id: conversation,
            from,
            payload: received,
        } => {
            assert_eq!(conversation, conversation_id(&UserId::new("bob"), &UserId::new("alice")));
            assert_eq!(from, Some(alice.id()));
            assert_eq!(received, payload);
        }
        other => unreachable!("Expected Chat, got: {:?}", other),
    }
    assert_eq!(hub.count(|m| matches!(m, SignalingMessage::Chat { .. })), 1);
}

#[tokio::test]
async fn test_shutdown_ends_calls_and_closes_channels() {
    let hub = Hub::new();
    let roster = StaticRoster::new();
    let alice = join_hub(&hub, "alice", roster.clone(), SessionConfig::default()).await;
    let mut bob = join_hub(&hub, "bob", roster, SessionConfig::default()).await;

    let call_id = alice.session.start_call(bob.id(), CallKind::Audio).await.unwrap();
    next_event(&mut bob.events, |e| matches!(e, SessionEvent::Call(CallEvent::Incoming { .. }))).await;

    alice.session.shutdown().await;

    next_event(&mut bob.events, |e| {
        matches!(e, SessionEvent::Call(CallEvent::Ended { call_id: id }) if *id == call_id)
    })
    .await;
    assert!(alice.session.registry().peer_ids().await.is_empty());
    assert!(alice.session.calls().active_calls().await.is_empty());
}
