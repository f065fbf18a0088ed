use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{Block, Transaction, TransactionId};

/// Immutable value messages exchanged between components. Listeners are
/// registered at boot and torn down on cleanup; no component holds a
/// reference to another.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    Bootstrap,
    NewBlock { block: Arc<Block> },
    DeleteBlock { block: Arc<Block> },
    BroadcastBlock { block: Arc<Block> },
    NewBroadhash { broadhash: String, height: u64 },
    UnconfirmedTransaction { transaction: Arc<Transaction>, broadcast: bool },
    ConfirmedTransactions { ids: Vec<TransactionId> },
    DeletedTransactions { ids: Vec<TransactionId> },
    MigrationWarning { detail: String },
    ModuleState { broadhash: String, height: u64 },
}

impl ChainEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            ChainEvent::Bootstrap => "bootstrap",
            ChainEvent::NewBlock { .. } => "blocks:change",
            ChainEvent::DeleteBlock { .. } => "blocks:delete",
            ChainEvent::BroadcastBlock { .. } => "blocks:broadcast",
            ChainEvent::NewBroadhash { .. } => "consensus:broadhash",
            ChainEvent::UnconfirmedTransaction { .. } => "transactions:change",
            ChainEvent::ConfirmedTransactions { .. } => "transactions:confirmed:change",
            ChainEvent::DeletedTransactions { .. } => "transactions:deleted",
            ChainEvent::MigrationWarning { .. } => "storage:migration:warning",
            ChainEvent::ModuleState { .. } => "interchain:updateModuleState",
        }
    }
}

type Listener = Arc<dyn Fn(&ChainEvent) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Synchronous publish/subscribe bus. Events are delivered inside the
/// publishing task before `publish` returns; listeners must hand off any
/// blocking work to their own queues.
pub struct EventBus {
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ChainEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.write().retain(|(existing, _)| *existing != id);
    }

    pub fn publish(&self, event: &ChainEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_reaches_all_listeners_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(RwLock::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.subscribe(move |event| {
                seen.write().push((tag, event.topic()));
            });
        }
        bus.publish(&ChainEvent::Bootstrap);
        let seen = seen.read();
        assert_eq!(
            *seen,
            vec![("first", "bootstrap"), ("second", "bootstrap")]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = {
            let count = count.clone();
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        bus.publish(&ChainEvent::Bootstrap);
        bus.unsubscribe(id);
        bus.publish(&ChainEvent::Bootstrap);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let bus = EventBus::new();
        bus.subscribe(|_| {});
        bus.subscribe(|_| {});
        assert_eq!(bus.listener_count(), 2);
        bus.clear();
        assert_eq!(bus.listener_count(), 0);
    }
}
