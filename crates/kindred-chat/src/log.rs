use std::collections::HashMap;

use kindred_shared::{LocalMessageId, MessageId, UserId};

use crate::models::{AckStatus, Message};

/// Per-peer message logs in arrival order.
#[derive(Debug, Default)]
pub struct ConversationLog {
    conversations: HashMap<UserId, Vec<Message>>,
    index: HashMap<LocalMessageId, UserId>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.index.insert(message.local_id, message.peer_id.clone());
        self.conversations
            .entry(message.peer_id.clone())
            .or_default()
            .push(message);
    }

    /// Messages exchanged with `peer`, oldest first.
    pub fn messages(&self, peer: &UserId) -> &[Message] {
        self.conversations
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, local_id: LocalMessageId) -> Option<&Message> {
        let peer = self.index.get(&local_id)?;
        self.messages(peer).iter().find(|m| m.local_id == local_id)
    }

    pub fn get_mut(&mut self, local_id: LocalMessageId) -> Option<&mut Message> {
        let peer = self.index.get(&local_id)?;
        self.conversations
            .get_mut(peer)?
            .iter_mut()
            .find(|m| m.local_id == local_id)
    }

    pub fn contains_server_id(&self, peer: &UserId, server_id: &MessageId) -> bool {
        self.messages(peer)
            .iter()
            .any(|m| m.server_id.as_ref() == Some(server_id))
    }

    /// Unacked messages of ours to `peer` with exactly this content.
    pub fn pending_echo_count(&self, peer: &UserId, sender: &UserId, content: &str) -> usize {
        self.messages(peer)
            .iter()
            .filter(|m| is_pending_echo(m, sender, content))
            .count()
    }

    /// Oldest unacked message of ours to `peer` with exactly this content.
    pub fn pending_echo_mut(
        &mut self,
        peer: &UserId,
        sender: &UserId,
        content: &str,
    ) -> Option<&mut Message> {
        self.conversations
            .get_mut(peer)?
            .iter_mut()
            .find(|m| is_pending_echo(m, sender, content))
    }

    /// Put `replacement` where `local_id` was. Returns false if `local_id`
    /// is unknown.
    pub fn replace(&mut self, local_id: LocalMessageId, replacement: Message) -> bool {
        let Some(peer) = self.index.remove(&local_id) else {
            return false;
        };
        let Some(entries) = self.conversations.get_mut(&peer) else {
            return false;
        };
        let Some(slot) = entries.iter_mut().find(|m| m.local_id == local_id) else {
            return false;
        };
        self.index.insert(replacement.local_id, replacement.peer_id.clone());
        *slot = replacement;
        true
    }

    /// Drop every entry of `peer` carrying `server_id` except `keep`.
    pub fn remove_duplicates(
        &mut self,
        peer: &UserId,
        server_id: &MessageId,
        keep: LocalMessageId,
    ) -> usize {
        let Some(entries) = self.conversations.get_mut(peer) else {
            return 0;
        };
        let mut removed = Vec::new();
        entries.retain(|m| {
            let duplicate = m.local_id != keep && m.server_id.as_ref() == Some(server_id);
            if duplicate {
                removed.push(m.local_id);
            }
            !duplicate
        });
        for id in &removed {
            self.index.remove(id);
        }
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn is_pending_echo(message: &Message, sender: &UserId, content: &str) -> bool {
    message.status == AckStatus::Sent
        && message.server_id.is_none()
        && &message.sender_id == sender
        && message.content == content
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_shared::MessageKind;

    fn message(peer: &str, content: &str) -> Message {
        Message::outgoing(
            UserId::new("me"),
            UserId::new(peer),
            content.into(),
            MessageKind::Text,
        )
    }

    #[test]
    fn test_logs_are_per_peer_and_ordered() {
        let mut log = ConversationLog::new();
        log.append(message("a", "1"));
        log.append(message("b", "x"));
        log.append(message("a", "2"));

        let contents: Vec<&str> = log
            .messages(&UserId::new("a"))
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["1", "2"]);
        assert_eq!(log.messages(&UserId::new("b")).len(), 1);
        assert!(log.messages(&UserId::new("c")).is_empty());
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut log = ConversationLog::new();
        let first = message("a", "1");
        let first_id = first.local_id;
        log.append(first);
        log.append(message("a", "2"));

        let replacement = message("a", "1 again");
        let new_id = replacement.local_id;
        assert!(log.replace(first_id, replacement));

        let entries = log.messages(&UserId::new("a"));
        assert_eq!(entries[0].local_id, new_id);
        assert!(log.get(first_id).is_none());
        assert!(log.get(new_id).is_some());
        assert!(!log.replace(first_id, message("a", "3")));
    }

    #[test]
    fn test_remove_duplicates() {
        let mut log = ConversationLog::new();
        let mut keep = message("a", "hi");
        keep.confirm(MessageId::new("m-1"), chrono::Utc::now());
        let keep_id = keep.local_id;
        let mut dup = message("a", "hi");
        dup.confirm(MessageId::new("m-1"), chrono::Utc::now());
        log.append(keep);
        log.append(dup);

        let removed = log.remove_duplicates(&UserId::new("a"), &MessageId::new("m-1"), keep_id);
        assert_eq!(removed, 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.messages(&UserId::new("a"))[0].local_id, keep_id);
    }
}
