//! Typing indicators in both directions.
//!
//! Outbound, [`TypingDebouncer`] turns raw keystrokes into at most one
//! `typing` per debounce window and a `stop_typing` once input goes idle.
//! Inbound, [`TypingTracker`] keeps a per-peer indicator that expires unless
//! refreshed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use kindred_shared::constants::{TYPING_DEBOUNCE, TYPING_EXPIRY, TYPING_IDLE};
use kindred_shared::protocol::ClientEvent;
use kindred_shared::UserId;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct LocalTyping {
    last_signal: Instant,
    last_input: Instant,
}

#[derive(Debug)]
pub struct TypingDebouncer {
    debounce: Duration,
    idle: Duration,
    active: HashMap<UserId, LocalTyping>,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(TYPING_DEBOUNCE, TYPING_IDLE)
    }
}

impl TypingDebouncer {
    pub fn new(debounce: Duration, idle: Duration) -> Self {
        Self {
            debounce,
            idle,
            active: HashMap::new(),
        }
    }

    /// Register a keystroke in the conversation with `peer`. Returns the
    /// `typing` event to emit, if one is due.
    pub fn on_input(&mut self, peer: &UserId, now: Instant) -> Option<ClientEvent> {
        match self.active.get_mut(peer) {
            Some(state) => {
                state.last_input = now;
                if now.saturating_duration_since(state.last_signal) < self.debounce {
                    return None;
                }
                state.last_signal = now;
            }
            None => {
                self.active.insert(
                    peer.clone(),
                    LocalTyping {
                        last_signal: now,
                        last_input: now,
                    },
                );
            }
        }
        trace!(peer = %peer.short(), "Typing signal");
        Some(ClientEvent::Typing {
            receiver_id: peer.clone(),
        })
    }

    /// Explicit stop (message sent, input cleared). `None` if we never
    /// signalled typing to `peer`.
    pub fn stop(&mut self, peer: &UserId) -> Option<ClientEvent> {
        self.active.remove(peer).map(|_| ClientEvent::StopTyping {
            receiver_id: peer.clone(),
        })
    }

    /// `stop_typing` for every peer whose input has been idle long enough.
    pub fn sweep(&mut self, now: Instant) -> Vec<ClientEvent> {
        let idle = self.idle;
        let mut stopped = Vec::new();
        self.active.retain(|peer, state| {
            let keep = now.saturating_duration_since(state.last_input) < idle;
            if !keep {
                stopped.push(ClientEvent::StopTyping {
                    receiver_id: peer.clone(),
                });
            }
            keep
        });
        stopped
    }

    pub fn is_active(&self, peer: &UserId) -> bool {
        self.active.contains_key(peer)
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A remote user currently shown as typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingState {
    pub peer_id: UserId,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    peers: HashMap<UserId, TypingState>,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(TYPING_EXPIRY)
    }
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            peers: HashMap::new(),
        }
    }

    /// Set or refresh the indicator. True when `peer` was not typing before.
    pub fn on_typing(&mut self, peer: &UserId, now: Instant) -> bool {
        let expires_at = now + self.expiry;
        match self.peers.get_mut(peer) {
            Some(state) => {
                state.expires_at = expires_at;
                false
            }
            None => {
                self.peers.insert(
                    peer.clone(),
                    TypingState {
                        peer_id: peer.clone(),
                        expires_at,
                    },
                );
                true
            }
        }
    }

    /// Clear the indicator. True when it was set.
    pub fn clear(&mut self, peer: &UserId) -> bool {
        self.peers.remove(peer).is_some()
    }

    /// Drop expired indicators, returning the peers that stopped typing.
    pub fn sweep(&mut self, now: Instant) -> Vec<UserId> {
        let mut expired = Vec::new();
        self.peers.retain(|peer, state| {
            let live = state.expires_at > now;
            if !live {
                expired.push(peer.clone());
            }
            live
        });
        expired
    }

    pub fn is_typing(&self, peer: &UserId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn typing_peers(&self) -> impl Iterator<Item = &TypingState> {
        self.peers.values()
    }

    pub fn clear_all(&mut self) -> Vec<UserId> {
        self.peers.drain().map(|(peer, _)| peer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> UserId {
        UserId::new("u-peer")
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_keystrokes_are_debounced() {
        let mut debouncer = TypingDebouncer::default();
        let t0 = Instant::now();

        let emitted: Vec<_> = [0, 300, 900, 1500, 1999, 2000, 2600, 3900, 4100]
            .iter()
            .filter_map(|&at| debouncer.on_input(&peer(), t0 + ms(at)))
            .collect();

        // Signals at 0, 2000 and 4100.
        assert_eq!(emitted.len(), 3);
        assert!(emitted.iter().all(|e| matches!(e, ClientEvent::Typing { .. })));
    }

    #[test]
    fn test_idle_input_sends_stop() {
        let mut debouncer = TypingDebouncer::default();
        let t0 = Instant::now();
        debouncer.on_input(&peer(), t0);
        debouncer.on_input(&peer(), t0 + secs(1));

        assert!(debouncer.sweep(t0 + ms(3500)).is_empty());
        let stopped = debouncer.sweep(t0 + secs(4));
        assert_eq!(
            stopped,
            vec![ClientEvent::StopTyping {
                receiver_id: peer()
            }]
        );
        assert!(!debouncer.is_active(&peer()));

        // Typing again starts a fresh burst.
        assert!(debouncer.on_input(&peer(), t0 + secs(5)).is_some());
    }

    #[test]
    fn test_explicit_stop() {
        let mut debouncer = TypingDebouncer::default();
        assert!(debouncer.stop(&peer()).is_none());

        debouncer.on_input(&peer(), Instant::now());
        assert!(matches!(
            debouncer.stop(&peer()),
            Some(ClientEvent::StopTyping { .. })
        ));
        assert!(debouncer.stop(&peer()).is_none());
    }

    #[test]
    fn test_remote_indicator_expires_without_refresh() {
        let mut tracker = TypingTracker::default();
        let t0 = Instant::now();

        assert!(tracker.on_typing(&peer(), t0));
        assert!(!tracker.on_typing(&peer(), t0 + secs(3)));

        assert!(tracker.sweep(t0 + secs(7)).is_empty());
        assert!(tracker.is_typing(&peer()));

        assert_eq!(tracker.sweep(t0 + secs(8)), vec![peer()]);
        assert!(!tracker.is_typing(&peer()));
    }

    #[test]
    fn test_remote_stop_clears() {
        let mut tracker = TypingTracker::default();
        tracker.on_typing(&peer(), Instant::now());
        assert_eq!(tracker.typing_peers().count(), 1);

        assert!(tracker.clear(&peer()));
        assert!(!tracker.clear(&peer()));
        assert_eq!(tracker.typing_peers().count(), 0);
    }
}
