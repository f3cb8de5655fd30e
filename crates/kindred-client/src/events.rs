use serde::Serialize;

use kindred_call::{Call, LocalCallId};
use kindred_chat::Message;
use kindred_net::Event;
use kindred_shared::protocol::{Payload, ServerEvent};
use kindred_shared::{ConnectionState, UserId};

/// Everything a session reports to its subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    /// Reconnecting gave up; the session stays disconnected until the next
    /// explicit `connect`.
    ConnectionLost { attempts: u32 },
    /// A validated server push, before the session applied it.
    Server(ServerEvent),
    CallUpdated(Call),
    /// Apply the peer's session description to the media stack.
    RemoteDescription {
        local_id: LocalCallId,
        description: Payload,
    },
    /// Hand a peer ICE candidate to the media stack.
    RemoteCandidate {
        local_id: LocalCallId,
        candidate: Payload,
    },
    MessageUpdated(Message),
    TypingChanged { peer_id: UserId, typing: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionChanged,
    ConnectionLost,
    Server,
    CallUpdated,
    RemoteDescription,
    RemoteCandidate,
    MessageUpdated,
    TypingChanged,
}

impl Event for SessionEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionChanged(_) => EventKind::ConnectionChanged,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::Server(_) => EventKind::Server,
            Self::CallUpdated(_) => EventKind::CallUpdated,
            Self::RemoteDescription { .. } => EventKind::RemoteDescription,
            Self::RemoteCandidate { .. } => EventKind::RemoteCandidate,
            Self::MessageUpdated(_) => EventKind::MessageUpdated,
            Self::TypingChanged { .. } => EventKind::TypingChanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_routing() {
        let event = SessionEvent::TypingChanged {
            peer_id: UserId::new("u-2"),
            typing: true,
        };
        assert_eq!(event.kind(), EventKind::TypingChanged);
        assert_eq!(
            SessionEvent::ConnectionLost { attempts: 5 }.kind(),
            EventKind::ConnectionLost
        );
    }

    #[test]
    fn test_serialized_shape() {
        let event = SessionEvent::ConnectionChanged(ConnectionState::Reconnecting);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "connection_changed", "payload": "Reconnecting" })
        );
    }
}
