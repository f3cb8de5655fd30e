//! Typed publish/subscribe registry.
//!
//! Subscriptions are keyed by an opaque [`SubscriptionId`], so registering
//! the same handler twice yields two independently removable entries. The
//! registry lock is released before handlers run, which lets a handler
//! subscribe or unsubscribe while it is being invoked.

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Events that can be routed by kind.
pub trait Event: Send + Sync {
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by `subscribe`; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscription<E: Event> {
    id: SubscriptionId,
    filter: Option<E::Kind>,
    handler: Handler<E>,
}

struct Registry<E: Event> {
    next_id: u64,
    subscriptions: Vec<Subscription<E>>,
}

pub struct EventDispatcher<E: Event> {
    registry: Mutex<Registry<E>>,
}

impl<E: Event> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> EventDispatcher<E> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                subscriptions: Vec::new(),
            }),
        }
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(handler))
    }

    /// Register `handler` for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.id != id);
        registry.subscriptions.len() != before
    }

    /// Invoke every matching handler in registration order. Returns how
    /// many ran.
    pub fn publish(&self, event: &E) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler<E>> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.filter.map_or(true, |k| k == kind))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    fn insert(&self, filter: Option<E::Kind>, handler: Handler<E>) -> SubscriptionId {
        let mut registry = self.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.subscriptions.push(Subscription {
            id,
            filter,
            handler,
        });
        id
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
