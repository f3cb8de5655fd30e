mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use common::{new_message, peer, Harness, PEER};
use kindred_call::{CallState, EndReason};
use kindred_client::{EventKind, SessionEvent};
use kindred_shared::{ConnectionState, MediaType};

fn connection_state(event: &SessionEvent) -> Option<ConnectionState> {
    match event {
        SessionEvent::ConnectionChanged(state) => Some(*state),
        _ => None,
    }
}

#[tokio::test]
async fn test_concurrent_connects_open_one_transport() {
    let h = Harness::new();

    let (a, b) = tokio::join!(h.session.connect(), h.session.connect());
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(h.connector.connect_attempts(), 1);
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_survive_reconnect() {
    let (mut h, first) = Harness::connected().await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    h.session.subscribe(EventKind::MessageUpdated, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    first.drop_link().await;
    h.wait_for(|e| (connection_state(e) == Some(ConnectionState::Reconnecting)).then_some(()))
        .await;
    let second = h.servers.next().await.unwrap();
    h.wait_for(|e| (connection_state(e) == Some(ConnectionState::Connected)).then_some(()))
        .await;

    second
        .push("new_message", new_message("m-1", PEER, None, "still here"))
        .await;
    h.wait_for(|e| matches!(e, SessionEvent::MessageUpdated(_)).then_some(()))
        .await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnect_fails_active_call() {
    let (mut h, mut server) = Harness::connected().await;

    let pending = h
        .session
        .call_user(peer(), MediaType::Video, json!({ "sdp": "offer" }))
        .await
        .unwrap();
    let request = server.next_named("call_user").await.unwrap();
    server.ack(request.ack.unwrap(), json!({ "call_id": "c-1" })).await;
    server
        .push("call_answered", json!({ "call_id": "c-1", "answer": { "sdp": "answer" } }))
        .await;
    assert_eq!(pending.settled().await.unwrap().state, CallState::Active);

    h.connector.fail_next_connects(5);
    server.drop_link().await;

    let call = h
        .wait_for(|e| match e {
            SessionEvent::CallUpdated(call) if call.is_terminal() => Some(call.clone()),
            _ => None,
        })
        .await;
    assert_eq!(call.state, CallState::Failed);
    assert_eq!(call.end_reason, Some(EndReason::TransportLost));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);

    let attempts = h
        .wait_for(|e| match e {
            SessionEvent::ConnectionLost { attempts } => Some(*attempts),
            _ => None,
        })
        .await;
    assert_eq!(attempts, 5);
    assert_eq!(h.connector.connect_attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_call_survives_a_short_outage() {
    let (mut h, mut server) = Harness::connected().await;

    let pending = h
        .session
        .call_user(peer(), MediaType::Audio, json!({ "sdp": "offer" }))
        .await
        .unwrap();
    let request = server.next_named("call_user").await.unwrap();
    server.ack(request.ack.unwrap(), json!({ "call_id": "c-1" })).await;
    server
        .push("call_answered", json!({ "call_id": "c-1", "answer": { "sdp": "answer" } }))
        .await;
    let local_id = pending.settled().await.unwrap().local_id;

    server.drop_link().await;
    let mut second = h.servers.next().await.unwrap();
    h.wait_for(|e| (connection_state(e) == Some(ConnectionState::Connected)).then_some(()))
        .await;
    assert_eq!(
        h.session.current_call().map(|c| c.state),
        Some(CallState::Active)
    );

    h.session.hang_up(local_id).await.unwrap();
    let end = second.next_named("end_call").await.unwrap();
    assert_eq!(end.data["call_id"], "c-1");
}

#[tokio::test]
async fn test_disconnect_is_final_until_connect() {
    let (mut h, _server) = Harness::connected().await;

    h.session.disconnect().await;
    h.wait_for(|e| (connection_state(e) == Some(ConnectionState::Disconnected)).then_some(()))
        .await;
    assert_eq!(h.connector.connect_attempts(), 1);

    h.session.connect().await.unwrap();
    let _second = h.servers.next().await.unwrap();
    assert_eq!(h.connector.connect_attempts(), 2);
}
