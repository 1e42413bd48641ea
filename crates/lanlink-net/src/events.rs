//! Lifecycle events published by the connection managers.
//!
//! Handlers run synchronously on whichever thread produced the event: the
//! caller of `connect`, the accept worker, or a connection's receive or send
//! worker.  Keep them short and never block on the manager that emitted them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lanlink_core::ConnectionId;
use parking_lot::RwLock;

use crate::connection::{Connection, ConnectionStatus};

#[derive(Debug, Clone)]
pub enum NetEvent {
    /// A connection was created and is now tracked by the manager.
    ConnectionAdded(Arc<Connection>),
    /// A tracked connection disconnected and was released.
    ConnectionRemoved(ConnectionId),
    /// Forwarded from a connection's status handler.
    ConnectionStatusChanged {
        status: ConnectionStatus,
        id: ConnectionId,
    },
    /// The server listener started (`true`) or its accept loop ended.
    ListenerStatusChanged { active: bool },
}

pub type EventHandler = Arc<dyn Fn(&NetEvent) + Send + Sync>;

/// Token returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of subscribers.
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&NetEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Removes a subscriber.  Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Delivers `event` to a snapshot of the current subscribers, in
    /// subscription order.  Handlers may subscribe or unsubscribe while
    /// running.
    pub(crate) fn emit(&self, event: &NetEvent) {
        let snapshot: Vec<EventHandler> =
            self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in snapshot {
            handler(event);
        }
    }
}
