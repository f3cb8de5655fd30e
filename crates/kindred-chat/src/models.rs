//! Chat records handed to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kindred_shared::protocol::IncomingMessage;
use kindred_shared::{LocalMessageId, MessageId, MessageKind, UserId};

// ---------------------------------------------------------------------------
// AckStatus
// ---------------------------------------------------------------------------

/// Delivery status of a message. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Emitted, waiting for the server ack.
    Sent,
    /// Confirmed by the server. Immutable from here on.
    Delivered,
    /// No ack in time or rejected. Can be resent as a new message.
    Failed,
}

impl AckStatus {
    pub fn can_advance_to(self, next: AckStatus) -> bool {
        matches!(
            (self, next),
            (Self::Sent, Self::Delivered) | (Self::Sent, Self::Failed)
        )
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One entry of a conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Local id; tentative for our sends, generated on arrival for others.
    pub local_id: LocalMessageId,
    /// Server id, once known.
    pub server_id: Option<MessageId>,
    /// The other side of the conversation.
    pub peer_id: UserId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    /// Local send time until the server timestamp replaces it.
    pub sent_at: DateTime<Utc>,
    pub status: AckStatus,
}

impl Message {
    /// Optimistic record of a message we are about to send.
    pub fn outgoing(sender_id: UserId, peer_id: UserId, content: String, kind: MessageKind) -> Self {
        Self {
            local_id: LocalMessageId::new(),
            server_id: None,
            peer_id,
            sender_id,
            content,
            kind,
            sent_at: Utc::now(),
            status: AckStatus::Sent,
        }
    }

    /// Record of a message pushed by the server.
    pub fn delivered(peer_id: UserId, incoming: &IncomingMessage) -> Self {
        Self {
            local_id: LocalMessageId::new(),
            server_id: Some(incoming.message_id.clone()),
            peer_id,
            sender_id: incoming.sender_id.clone(),
            content: incoming.content.clone(),
            kind: incoming.kind,
            sent_at: incoming.sent_at,
            status: AckStatus::Delivered,
        }
    }

    pub fn is_from(&self, user: &UserId) -> bool {
        &self.sender_id == user
    }

    /// Reconcile with the server's id and timestamp.
    pub(crate) fn confirm(&mut self, server_id: MessageId, sent_at: DateTime<Utc>) {
        self.server_id = Some(server_id);
        self.sent_at = sent_at;
        self.status = AckStatus::Delivered;
    }
}
