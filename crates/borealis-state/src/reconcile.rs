//! Reconciliation of inbound updates against the store

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use borealis_core::{EntityId, Timestamp};
use borealis_wire::{AircraftUpdate, AuthoritativeUpdate, ControllerUpdate};

use crate::EntityStore;

/// What happened to a single update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// Merged into a known entity
    Merged,
    /// Created from scratch
    Seeded,
    /// Delete of a known entity
    Removed,
    /// Delete of an id we never had
    Absent,
    /// Target unknown; the caller decides how to resync before seeding
    Unknown(EntityId),
}

/// Reconciliation result for a batch of updates
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub merged: u32,
    pub seeded: u32,
    pub removed: u32,
    pub absent: u32,
    pub failed: u32,
}

impl ReconciliationResult {
    fn record(&mut self, outcome: Reconciled) {
        match outcome {
            Reconciled::Merged => self.merged += 1,
            Reconciled::Seeded | Reconciled::Unknown(_) => self.seeded += 1,
            Reconciled::Removed => self.removed += 1,
            Reconciled::Absent => self.absent += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.merged + self.seeded + self.removed + self.absent + self.failed
    }
}

impl EntityStore {
    /// Apply a single aircraft update, leaving unknown targets alone
    pub fn reconcile_aircraft(&self, sent: Timestamp, update: &AircraftUpdate) -> Reconciled {
        if update.update.is_delete() {
            return match self.remove_aircraft(update.aircraft) {
                Some(_) => Reconciled::Removed,
                None => Reconciled::Absent,
            };
        }
        if self.merge_aircraft(sent, update) {
            Reconciled::Merged
        } else {
            Reconciled::Unknown(update.aircraft)
        }
    }

    /// Apply a single controller update, leaving unknown targets alone
    pub fn reconcile_controller(&self, sent: Timestamp, update: &ControllerUpdate) -> Reconciled {
        if update.update.is_delete() {
            return match self.remove_controller(update.controller) {
                Some(_) => Reconciled::Removed,
                None => Reconciled::Absent,
            };
        }
        if self.merge_controller(sent, update) {
            Reconciled::Merged
        } else {
            Reconciled::Unknown(update.controller)
        }
    }

    /// Merge if known, otherwise build the entity straight from the update
    pub fn upsert_aircraft(&self, sent: Timestamp, update: &AircraftUpdate) -> Reconciled {
        match self.reconcile_aircraft(sent, update) {
            Reconciled::Unknown(_) => {
                self.seed_aircraft(sent, update);
                Reconciled::Seeded
            }
            outcome => outcome,
        }
    }

    pub fn upsert_controller(&self, sent: Timestamp, update: &ControllerUpdate) -> Reconciled {
        match self.reconcile_controller(sent, update) {
            Reconciled::Unknown(_) => {
                self.seed_controller(sent, update);
                Reconciled::Seeded
            }
            outcome => outcome,
        }
    }

    /// Apply a bulk snapshot
    ///
    /// Items are independent full replacements, so each runs as its own
    /// task and the call returns once all of them finished.
    pub async fn apply_authoritative(
        self: &Arc<Self>,
        sent: Timestamp,
        bulk: AuthoritativeUpdate,
    ) -> ReconciliationResult {
        let mut tasks = JoinSet::new();

        for update in bulk.aircraft {
            let store = Arc::clone(self);
            tasks.spawn(async move { store.upsert_aircraft(sent, &update) });
        }
        for update in bulk.controllers {
            let store = Arc::clone(self);
            tasks.spawn(async move { store.upsert_controller(sent, &update) });
        }

        let mut result = ReconciliationResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => result.record(outcome),
                Err(e) => {
                    warn!("authoritative item failed: {}", e);
                    result.failed += 1;
                }
            }
        }

        debug!(?result, "authoritative update applied");
        result
    }
}
