//! Message channel: optimistic sends reconciled with server acks, inbound
//! messages merged into the same per-peer logs.

use tracing::{debug, info, warn};

use kindred_shared::constants::MAX_MESSAGE_SIZE;
use kindred_shared::protocol::{ClientEvent, IncomingMessage, MessageAck};
use kindred_shared::{AckError, LocalMessageId, MessageKind, UserId};

use crate::error::ChatError;
use crate::log::ConversationLog;
use crate::models::{AckStatus, Message};

pub struct MessageChannel {
    local_user: UserId,
    max_size: usize,
    log: ConversationLog,
    /// Echoes of our own sends that match more than one unacked message.
    /// They wait for acks to tell the candidates apart.
    unclaimed: Vec<Message>,
}

impl MessageChannel {
    pub fn new(local_user: UserId) -> Self {
        Self::with_limit(local_user, MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(local_user: UserId, max_size: usize) -> Self {
        Self {
            local_user,
            max_size,
            log: ConversationLog::new(),
            unclaimed: Vec::new(),
        }
    }

    /// Append an optimistic entry and return it with the `send_message`
    /// request to emit. The ack outcome goes to [`Self::on_ack`].
    pub fn send(
        &mut self,
        peer_id: UserId,
        content: String,
        kind: MessageKind,
    ) -> Result<(Message, ClientEvent), ChatError> {
        self.validate(&content)?;

        let message = Message::outgoing(self.local_user.clone(), peer_id, content, kind);
        debug!(local_id = %message.local_id, peer = %message.peer_id.short(), "Sending message");
        let event = request_for(&message);
        self.log.append(message.clone());
        Ok((message, event))
    }

    /// Send a failed message again under a new local id. The new entry takes
    /// the failed one's place in the log.
    pub fn resend(&mut self, local_id: LocalMessageId) -> Result<(Message, ClientEvent), ChatError> {
        let failed = self
            .log
            .get(local_id)
            .ok_or(ChatError::UnknownMessage(local_id))?;
        if failed.status != AckStatus::Failed {
            return Err(ChatError::NotFailed {
                local_id,
                status: failed.status,
            });
        }

        let message = Message::outgoing(
            self.local_user.clone(),
            failed.peer_id.clone(),
            failed.content.clone(),
            failed.kind,
        );
        info!(old = %local_id, new = %message.local_id, "Resending message");
        let event = request_for(&message);
        self.log.replace(local_id, message.clone());
        Ok((message, event))
    }

    /// Apply the ack outcome of a send. Returns every entry that changed: the
    /// acked one first, then any held echo it allowed to settle. Empty when
    /// the entry is gone or already settled.
    pub fn on_ack(
        &mut self,
        local_id: LocalMessageId,
        result: Result<MessageAck, AckError>,
    ) -> Vec<Message> {
        let Some(message) = self.log.get_mut(local_id) else {
            debug!(local_id = %local_id, "Ack for a message no longer in the log");
            return Vec::new();
        };
        let next = if result.is_ok() {
            AckStatus::Delivered
        } else {
            AckStatus::Failed
        };
        if !message.status.can_advance_to(next) {
            debug!(local_id = %local_id, status = ?message.status, "Ack for a settled message");
            return Vec::new();
        }

        let updated = match result {
            Ok(ack) => {
                debug!(local_id = %local_id, message_id = %ack.message_id, "Message delivered");
                message.confirm(ack.message_id.clone(), ack.sent_at);
                let updated = message.clone();
                self.log
                    .remove_duplicates(&updated.peer_id, &ack.message_id, local_id);
                self.unclaimed
                    .retain(|echo| echo.server_id.as_ref() != Some(&ack.message_id));
                updated
            }
            Err(e) => {
                warn!(local_id = %local_id, error = %e, "Message failed");
                message.status = AckStatus::Failed;
                message.clone()
            }
        };

        let mut changed = self.settle_unclaimed(&updated.peer_id, &updated.content);
        changed.insert(0, updated);
        changed
    }

    /// Merge a server-pushed message. Returns the new or reconciled entry,
    /// or `None` for duplicates and for echoes still waiting on acks.
    pub fn on_incoming(&mut self, incoming: &IncomingMessage) -> Option<Message> {
        let own = incoming.sender_id == self.local_user;
        let peer = if own {
            match &incoming.receiver_id {
                Some(receiver) => receiver.clone(),
                None => {
                    warn!(message_id = %incoming.message_id, "Echo without receiver, dropping");
                    return None;
                }
            }
        } else {
            incoming.sender_id.clone()
        };

        let held = self
            .unclaimed
            .iter()
            .any(|echo| echo.server_id.as_ref() == Some(&incoming.message_id));
        if held || self.log.contains_server_id(&peer, &incoming.message_id) {
            debug!(message_id = %incoming.message_id, "Duplicate message");
            return None;
        }

        if own {
            let candidates = self
                .log
                .pending_echo_count(&peer, &self.local_user, &incoming.content);
            if candidates > 1 {
                debug!(message_id = %incoming.message_id, candidates, "Echo matches several pending messages, waiting for acks");
                self.unclaimed.push(Message::delivered(peer, incoming));
                return None;
            }
            if let Some(pending) =
                self.log
                    .pending_echo_mut(&peer, &self.local_user, &incoming.content)
            {
                debug!(local_id = %pending.local_id, message_id = %incoming.message_id, "Echo reconciled");
                pending.confirm(incoming.message_id.clone(), incoming.sent_at);
                return Some(pending.clone());
            }
        }

        let message = Message::delivered(peer, incoming);
        self.log.append(message.clone());
        Some(message)
    }

    pub fn conversation(&self, peer: &UserId) -> &[Message] {
        self.log.messages(peer)
    }

    pub fn message(&self, local_id: LocalMessageId) -> Option<&Message> {
        self.log.get(local_id)
    }

    /// Pair held echoes of `content` once at most one unacked candidate is
    /// left. Echoes with no candidate become entries of their own.
    fn settle_unclaimed(&mut self, peer: &UserId, content: &str) -> Vec<Message> {
        if !self
            .unclaimed
            .iter()
            .any(|echo| &echo.peer_id == peer && echo.content == content)
        {
            return Vec::new();
        }
        if self.log.pending_echo_count(peer, &self.local_user, content) > 1 {
            return Vec::new();
        }

        let (settled, rest): (Vec<Message>, Vec<Message>) = std::mem::take(&mut self.unclaimed)
            .into_iter()
            .partition(|echo| &echo.peer_id == peer && echo.content == content);
        self.unclaimed = rest;

        let mut changed = Vec::new();
        for echo in settled {
            if let (Some(server_id), Some(pending)) = (
                echo.server_id.clone(),
                self.log.pending_echo_mut(peer, &self.local_user, content),
            ) {
                debug!(local_id = %pending.local_id, message_id = %server_id, "Held echo reconciled");
                pending.confirm(server_id, echo.sent_at);
                changed.push(pending.clone());
                continue;
            }
            self.log.append(echo.clone());
            changed.push(echo);
        }
        changed
    }

    fn validate(&self, content: &str) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        if content.len() > self.max_size {
            return Err(ChatError::TooLarge {
                size: content.len(),
                max: self.max_size,
            });
        }
        Ok(())
    }
}

fn request_for(message: &Message) -> ClientEvent {
    ClientEvent::SendMessage {
        receiver_id: message.peer_id.clone(),
        content: message.content.clone(),
        kind: message.kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use kindred_shared::MessageId;

    fn channel() -> MessageChannel {
        MessageChannel::new(UserId::new("me"))
    }

    fn peer() -> UserId {
        UserId::new("u-peer")
    }

    fn ack(id: &str) -> Result<MessageAck, AckError> {
        Ok(MessageAck {
            message_id: MessageId::new(id),
            sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        })
    }

    fn timeout() -> Result<MessageAck, AckError> {
        Err(AckError::Timeout {
            event: "send_message".into(),
        })
    }

    fn pushed(id: &str, sender: &str, receiver: Option<&str>, content: &str) -> IncomingMessage {
        IncomingMessage {
            message_id: MessageId::new(id),
            sender_id: UserId::new(sender),
            receiver_id: receiver.map(UserId::new),
            content: content.into(),
            kind: MessageKind::Text,
            sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap(),
        }
    }

    #[test]
    fn test_send_is_optimistic() {
        let mut ch = channel();
        let (message, event) = ch.send(peer(), "hello".into(), MessageKind::Text).unwrap();

        assert_eq!(message.status, AckStatus::Sent);
        assert_eq!(ch.conversation(&peer()).len(), 1);
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                receiver_id: peer(),
                content: "hello".into(),
                kind: MessageKind::Text
            }
        );
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        let mut ch = MessageChannel::with_limit(UserId::new("me"), 8);
        assert_eq!(
            ch.send(peer(), "   ".into(), MessageKind::Text).unwrap_err(),
            ChatError::EmptyContent
        );
        assert_eq!(
            ch.send(peer(), "123456789".into(), MessageKind::Text)
                .unwrap_err(),
            ChatError::TooLarge { size: 9, max: 8 }
        );
        assert!(ch.conversation(&peer()).is_empty());
    }

    #[test]
    fn test_ack_reconciles_single_record() {
        let mut ch = channel();
        let (message, _) = ch.send(peer(), "hello".into(), MessageKind::Text).unwrap();

        let updated = ch.on_ack(message.local_id, ack("m-1")).remove(0);
        assert_eq!(updated.status, AckStatus::Delivered);
        assert_eq!(updated.server_id, Some(MessageId::new("m-1")));
        assert_eq!(ch.conversation(&peer()).len(), 1);

        // Delivered is final.
        assert!(ch.on_ack(message.local_id, timeout()).is_empty());
        assert_eq!(
            ch.message(message.local_id).unwrap().status,
            AckStatus::Delivered
        );
    }

    #[test]
    fn test_timeout_then_resend_gets_new_id() {
        let mut ch = channel();
        let (first, _) = ch.send(peer(), "hello".into(), MessageKind::Text).unwrap();
        ch.send(peer(), "second".into(), MessageKind::Text).unwrap();

        let failed = ch.on_ack(first.local_id, timeout()).remove(0);
        assert_eq!(failed.status, AckStatus::Failed);

        let (retry, event) = ch.resend(first.local_id).unwrap();
        assert_ne!(retry.local_id, first.local_id);
        assert_eq!(retry.status, AckStatus::Sent);
        assert!(matches!(event, ClientEvent::SendMessage { ref content, .. } if content == "hello"));

        let log = ch.conversation(&peer());
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].local_id, retry.local_id);
        assert!(ch.message(first.local_id).is_none());
    }

    #[test]
    fn test_resend_requires_failed() {
        let mut ch = channel();
        let (message, _) = ch.send(peer(), "hello".into(), MessageKind::Text).unwrap();

        assert_eq!(
            ch.resend(message.local_id).unwrap_err(),
            ChatError::NotFailed {
                local_id: message.local_id,
                status: AckStatus::Sent
            }
        );
        let unknown = LocalMessageId::new();
        assert_eq!(
            ch.resend(unknown).unwrap_err(),
            ChatError::UnknownMessage(unknown)
        );
    }

    #[test]
    fn test_incoming_appended_and_deduplicated() {
        let mut ch = channel();
        let message = ch.on_incoming(&pushed("m-5", "u-peer", None, "hey")).unwrap();
        assert_eq!(message.status, AckStatus::Delivered);
        assert_eq!(message.peer_id, peer());

        assert!(ch.on_incoming(&pushed("m-5", "u-peer", None, "hey")).is_none());
        assert_eq!(ch.conversation(&peer()).len(), 1);
    }

    #[test]
    fn test_echo_before_ack_reconciles_optimistic_entry() {
        let mut ch = channel();
        let (sent, _) = ch.send(peer(), "hello".into(), MessageKind::Text).unwrap();

        let echoed = ch
            .on_incoming(&pushed("m-9", "me", Some("u-peer"), "hello"))
            .unwrap();
        assert_eq!(echoed.local_id, sent.local_id);
        assert_eq!(echoed.status, AckStatus::Delivered);

        // The ack that follows finds the entry settled.
        assert!(ch.on_ack(sent.local_id, ack("m-9")).is_empty());
        assert_eq!(ch.conversation(&peer()).len(), 1);
    }

    #[test]
    fn test_echo_after_ack_is_duplicate() {
        let mut ch = channel();
        let (sent, _) = ch.send(peer(), "hello".into(), MessageKind::Text).unwrap();
        assert_eq!(ch.on_ack(sent.local_id, ack("m-1")).len(), 1);

        assert!(ch
            .on_incoming(&pushed("m-1", "me", Some("u-peer"), "hello"))
            .is_none());
        assert_eq!(ch.conversation(&peer()).len(), 1);
    }

    #[test]
    fn test_own_message_from_other_device_is_appended() {
        let mut ch = channel();
        let message = ch
            .on_incoming(&pushed("m-2", "me", Some("u-peer"), "from my phone"))
            .unwrap();
        assert!(message.is_from(&UserId::new("me")));
        assert_eq!(ch.conversation(&peer()).len(), 1);

        assert!(ch.on_incoming(&pushed("m-3", "me", None, "lost")).is_none());
    }

    #[test]
    fn test_identical_pending_messages_keep_their_own_ids() {
        let mut ch = channel();
        let (a, _) = ch.send(peer(), "ok".into(), MessageKind::Text).unwrap();
        let (b, _) = ch.send(peer(), "ok".into(), MessageKind::Text).unwrap();

        // B's echo cannot be told apart from A's yet.
        assert!(ch.on_incoming(&pushed("m-b", "me", Some("u-peer"), "ok")).is_none());

        let changed = ch.on_ack(b.local_id, ack("m-b"));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].local_id, b.local_id);

        let echoed = ch
            .on_incoming(&pushed("m-a", "me", Some("u-peer"), "ok"))
            .unwrap();
        assert_eq!(echoed.local_id, a.local_id);

        let log = ch.conversation(&peer());
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].local_id, a.local_id);
        assert_eq!(log[0].server_id, Some(MessageId::new("m-a")));
        assert_eq!(log[1].local_id, b.local_id);
        assert_eq!(log[1].server_id, Some(MessageId::new("m-b")));
    }

    #[test]
    fn test_held_echo_pairs_with_last_candidate() {
        let mut ch = channel();
        let (a, _) = ch.send(peer(), "ok".into(), MessageKind::Text).unwrap();
        let (b, _) = ch.send(peer(), "ok".into(), MessageKind::Text).unwrap();

        assert!(ch.on_incoming(&pushed("m-a", "me", Some("u-peer"), "ok")).is_none());

        let changed = ch.on_ack(b.local_id, ack("m-b"));
        let ids: Vec<LocalMessageId> = changed.iter().map(|m| m.local_id).collect();
        assert_eq!(ids, vec![b.local_id, a.local_id]);
        assert_eq!(changed[1].server_id, Some(MessageId::new("m-a")));
        assert_eq!(changed[1].status, AckStatus::Delivered);

        // The ack for A finds it settled; nothing is duplicated.
        assert!(ch.on_ack(a.local_id, ack("m-a")).is_empty());
        assert_eq!(ch.conversation(&peer()).len(), 2);
    }
}
