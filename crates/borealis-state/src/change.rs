//! Store change notifications

use tokio::sync::broadcast;

use borealis_core::EntityId;

/// Default capacity of the change channel
pub const DEFAULT_CHANGE_BUFFER: usize = 1024;

/// Something in the store changed; consumers re-read what they display
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreChange {
    AircraftUpserted(EntityId),
    AircraftRemoved(EntityId),
    ControllerUpserted(EntityId),
    ControllerRemoved(EntityId),
    Cleared,
}

impl StoreChange {
    pub fn entity(&self) -> Option<EntityId> {
        match self {
            StoreChange::AircraftUpserted(id)
            | StoreChange::AircraftRemoved(id)
            | StoreChange::ControllerUpserted(id)
            | StoreChange::ControllerRemoved(id) => Some(*id),
            StoreChange::Cleared => None,
        }
    }
}

/// Sending half of the change channel
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    tx: broadcast::Sender<StoreChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        ChangeFeed { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }

    /// Publish a change; nobody listening is fine
    pub fn publish(&self, change: StoreChange) {
        let _ = self.tx.send(change);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_BUFFER)
    }
}
