#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use kindred_client::{Session, SessionConfig, SessionEvent};
use kindred_net::mock::{MockConnector, MockServer, MockServers};
use kindred_net::{ReconnectPolicy, StaticToken};
use kindred_shared::UserId;

pub const ME: &str = "u-me";
pub const PEER: &str = "u-peer";

pub fn me() -> UserId {
    UserId::new(ME)
}

pub fn peer() -> UserId {
    UserId::new(PEER)
}

pub struct Harness {
    pub session: Session,
    pub connector: MockConnector,
    pub servers: MockServers,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectPolicy::fixed(5, Duration::from_secs(1), Duration::from_secs(30)),
        ..SessionConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        let (connector, servers) = MockConnector::new();
        let session = Session::new(
            me(),
            Arc::new(connector.clone()),
            Arc::new(StaticToken::new("token-1")),
            test_config(),
        );

        let (tx, events) = mpsc::unbounded_channel();
        session.subscribe_all(move |event| {
            let _ = tx.send(event.clone());
        });

        Self {
            session,
            connector,
            servers,
            events,
        }
    }

    /// Connected session plus the server side of its link.
    pub async fn connected() -> (Self, MockServer) {
        let mut harness = Self::new();
        harness.session.connect().await.unwrap();
        let server = harness.servers.next().await.unwrap();
        (harness, server)
    }

    /// Skip events until `pick` accepts one.
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(&SessionEvent) -> Option<T>) -> T {
        loop {
            let event = self.events.recv().await.expect("session stopped");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    }

    /// Events published so far, without waiting.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Push a marker event through `server` and wait until the session has
    /// handled it, so everything pushed before is handled too.
    pub async fn sync(&mut self, server: &MockServer) {
        server
            .push("user_typing", json!({ "sender_id": "u-sync" }))
            .await;
        self.wait_for(|event| match event {
            SessionEvent::TypingChanged { peer_id, typing: true } if peer_id.as_str() == "u-sync" => {
                Some(())
            }
            _ => None,
        })
        .await;
        server
            .push("user_stopped_typing", json!({ "sender_id": "u-sync" }))
            .await;
        self.wait_for(|event| match event {
            SessionEvent::TypingChanged { peer_id, typing: false } if peer_id.as_str() == "u-sync" => {
                Some(())
            }
            _ => None,
        })
        .await;
    }
}

pub fn incoming_call(call_id: &str, caller: &str) -> Value {
    json!({
        "call_id": call_id,
        "caller_id": caller,
        "call_type": "audio",
        "offer": { "type": "offer", "sdp": "v=0 remote" },
    })
}

pub fn new_message(id: &str, sender: &str, receiver: Option<&str>, content: &str) -> Value {
    let mut data = json!({
        "message_id": id,
        "sender_id": sender,
        "content": content,
        "type": "text",
        "sent_at": "2024-05-01T10:00:01Z",
    });
    if let Some(receiver) = receiver {
        data["receiver_id"] = json!(receiver);
    }
    data
}
