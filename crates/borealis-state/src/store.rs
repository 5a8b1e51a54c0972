//! Entity store - the local replica of everything the hub has told us
//!
//! Two sharded maps keyed by id. Every mutation goes through the map's
//! entry or shard guard for that id, so writes to one id are atomic while
//! writes to different ids proceed in parallel.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;

use borealis_core::{Aircraft, Controller, EntityId, Timestamp};
use borealis_wire::{default_aircraft_lag, AircraftUpdate, AuthoritativeUpdate, ControllerUpdate};

use crate::{extrapolate, ChangeFeed, StoreChange, DEFAULT_CHANGE_BUFFER};

/// Store tuning
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Latency compensation added to aircraft update times
    pub aircraft_lag: Duration,
    /// Capacity of the change channel
    pub change_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            aircraft_lag: default_aircraft_lag(),
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }
}

/// Concurrent store of aircraft and controllers
#[derive(Debug)]
pub struct EntityStore {
    aircraft: DashMap<EntityId, Aircraft>,
    controllers: DashMap<EntityId, Controller>,
    changes: ChangeFeed,
    aircraft_lag: Duration,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        EntityStore {
            aircraft: DashMap::new(),
            controllers: DashMap::new(),
            changes: ChangeFeed::new(config.change_buffer),
            aircraft_lag: config.aircraft_lag,
        }
    }

    /// Lag applied to aircraft timestamps
    pub fn aircraft_lag(&self) -> Duration {
        self.aircraft_lag
    }

    /// Listen for changes
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub(crate) fn publish(&self, change: StoreChange) {
        self.changes.publish(change);
    }

    // ------------------------------------------------------------------
    // Aircraft mutation
    // ------------------------------------------------------------------

    pub fn contains_aircraft(&self, id: EntityId) -> bool {
        self.aircraft.contains_key(&id)
    }

    /// Merge `update` into a known aircraft; false if the id is unknown
    pub fn merge_aircraft(&self, sent: Timestamp, update: &AircraftUpdate) -> bool {
        let Some(mut entry) = self.aircraft.get_mut(&update.aircraft) else {
            return false;
        };
        let next = update.apply(sent, self.aircraft_lag, &entry);
        *entry = next;
        drop(entry);

        self.publish(StoreChange::AircraftUpserted(update.aircraft));
        true
    }

    /// Seed a default aircraft and merge `update` into it
    ///
    /// If the id appeared in the meantime the update merges into what is
    /// there instead.
    pub fn seed_aircraft(&self, sent: Timestamp, update: &AircraftUpdate) {
        let mut entry = self.aircraft.entry(update.aircraft).or_default();
        let next = update.apply(sent, self.aircraft_lag, &entry);
        *entry = next;
        drop(entry);

        self.publish(StoreChange::AircraftUpserted(update.aircraft));
    }

    /// Remove an aircraft; absent ids are a no-op
    pub fn remove_aircraft(&self, id: EntityId) -> Option<Aircraft> {
        let (_, removed) = self.aircraft.remove(&id)?;
        self.publish(StoreChange::AircraftRemoved(id));
        Some(removed)
    }

    // ------------------------------------------------------------------
    // Controller mutation
    // ------------------------------------------------------------------

    pub fn contains_controller(&self, id: EntityId) -> bool {
        self.controllers.contains_key(&id)
    }

    /// Merge `update` into a known controller; false if the id is unknown
    pub fn merge_controller(&self, sent: Timestamp, update: &ControllerUpdate) -> bool {
        let Some(mut entry) = self.controllers.get_mut(&update.controller) else {
            return false;
        };
        let next = update.apply(sent, &entry);
        *entry = next;
        drop(entry);

        self.publish(StoreChange::ControllerUpserted(update.controller));
        true
    }

    pub fn seed_controller(&self, sent: Timestamp, update: &ControllerUpdate) {
        let mut entry = self.controllers.entry(update.controller).or_default();
        let next = update.apply(sent, &entry);
        *entry = next;
        drop(entry);

        self.publish(StoreChange::ControllerUpserted(update.controller));
    }

    pub fn remove_controller(&self, id: EntityId) -> Option<Controller> {
        let (_, removed) = self.controllers.remove(&id)?;
        self.publish(StoreChange::ControllerRemoved(id));
        Some(removed)
    }

    /// Drop everything, e.g. when switching hubs
    pub fn clear(&self) {
        self.aircraft.clear();
        self.controllers.clear();
        self.publish(StoreChange::Cleared);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// All aircraft, projected to the current instant
    pub fn aircraft(&self) -> Vec<Aircraft> {
        self.aircraft_at(Utc::now())
    }

    /// All aircraft, projected to `now`
    pub fn aircraft_at(&self, now: Timestamp) -> Vec<Aircraft> {
        self.aircraft
            .iter()
            .map(|entry| extrapolate(entry.value(), now))
            .collect()
    }

    /// Ids and projected values of every aircraft
    pub fn aircraft_entries_at(&self, now: Timestamp) -> Vec<(EntityId, Aircraft)> {
        self.aircraft
            .iter()
            .map(|entry| (*entry.key(), extrapolate(entry.value(), now)))
            .collect()
    }

    /// Stored value of one aircraft, without projection
    pub fn raw_aircraft(&self, id: EntityId) -> Option<Aircraft> {
        self.aircraft.get(&id).map(|entry| entry.value().clone())
    }

    pub fn controllers(&self) -> Vec<Controller> {
        self.controllers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn controller(&self, id: EntityId) -> Option<Controller> {
        self.controllers.get(&id).map(|entry| entry.value().clone())
    }

    /// Ids whose callsign matches `callsign`, ignoring case
    ///
    /// Aircraft come first, then controllers.
    pub fn ids_by_callsign(&self, callsign: &str) -> Vec<EntityId> {
        let aircraft = self
            .aircraft
            .iter()
            .filter(|entry| entry.metadata.callsign.eq_ignore_ascii_case(callsign))
            .map(|entry| *entry.key());
        let controllers = self
            .controllers
            .iter()
            .filter(|entry| entry.metadata.callsign.eq_ignore_ascii_case(callsign))
            .map(|entry| *entry.key());

        aircraft.chain(controllers).collect()
    }

    pub fn aircraft_count(&self) -> usize {
        self.aircraft.len()
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn len(&self) -> usize {
        self.aircraft_count() + self.controller_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything known, as full updates
    ///
    /// Stored values, not projections: the receiver applies its own lag.
    pub fn snapshot(&self) -> AuthoritativeUpdate {
        AuthoritativeUpdate {
            aircraft: self
                .aircraft
                .iter()
                .map(|entry| AircraftUpdate::full(*entry.key(), entry.value()))
                .collect(),
            controllers: self
                .controllers
                .iter()
                .map(|entry| ControllerUpdate::full(*entry.key(), entry.value()))
                .collect(),
        }
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borealis_core::{
        AircraftMetadata, AircraftState, ControllerLevel, ControllerMetadata, Coordinate, Movement,
    };
    use chrono::TimeZone;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn callsign(cs: &str) -> AircraftMetadata {
        AircraftMetadata {
            callsign: cs.into(),
            ..AircraftMetadata::default()
        }
    }

    fn state(lat: f64, lon: f64) -> AircraftState {
        AircraftState {
            position: Coordinate::new(lat, lon),
            heading: 180.0,
            altitude: 5000,
        }
    }

    #[test]
    fn test_merge_requires_known_id() {
        let store = EntityStore::new();
        let id = EntityId::from_u128(1);
        let update = AircraftUpdate::new(id).with_metadata(callsign("AAL123"));

        assert!(!store.merge_aircraft(t0(), &update));
        assert!(store.is_empty());

        store.seed_aircraft(t0(), &update);
        assert!(store.contains_aircraft(id));
        assert!(store.merge_aircraft(t0(), &update));
    }

    #[test]
    fn test_metadata_merge_keeps_other_groups() {
        let store = EntityStore::new();
        let id = EntityId::from_u128(1);

        store.seed_aircraft(
            t0(),
            &AircraftUpdate::new(id)
                .with_state(state(34.0, -118.0))
                .with_movement(Movement { speed: 250.0 }),
        );
        let before = store.raw_aircraft(id).unwrap();

        let later = t0() + Duration::seconds(10);
        store.merge_aircraft(later, &AircraftUpdate::new(id).with_metadata(callsign("SWA9")));
        let after = store.raw_aircraft(id).unwrap();

        assert_eq!(after.metadata.callsign, "SWA9");
        assert_eq!(after.state, before.state);
        assert_eq!(after.movement, before.movement);
        assert_eq!(after.time, later + store.aircraft_lag());
    }

    #[test]
    fn test_remove() {
        let store = EntityStore::new();
        let id = EntityId::from_u128(7);

        assert!(store.remove_aircraft(id).is_none());

        store.seed_aircraft(t0(), &AircraftUpdate::new(id).with_metadata(callsign("N123")));
        assert!(store.remove_aircraft(id).is_some());
        assert!(store.aircraft_at(t0()).is_empty());
        assert!(store.remove_controller(id).is_none());
    }

    #[test]
    fn test_ids_by_callsign_ignores_case() {
        let store = EntityStore::new();
        let ac = EntityId::from_u128(1);
        let ctr = EntityId::from_u128(2);

        store.seed_aircraft(t0(), &AircraftUpdate::new(ac).with_metadata(callsign("Kzla")));
        store.seed_controller(
            t0(),
            &ControllerUpdate::new(ctr)
                .with_metadata(ControllerMetadata::new("KZLA", ControllerLevel::Center)),
        );

        assert_eq!(store.ids_by_callsign("kzla"), vec![ac, ctr]);
        assert!(store.ids_by_callsign("KLAX").is_empty());
    }

    #[test]
    fn test_snapshot_rebuilds_store() {
        let store = EntityStore::new();
        for n in 0..5u128 {
            store.seed_aircraft(
                t0(),
                &AircraftUpdate::new(EntityId::from_u128(n))
                    .with_metadata(callsign(&format!("TST{n}")))
                    .with_state(state(n as f64, 0.0))
                    .with_movement(Movement { speed: 100.0 }),
            );
        }
        store.seed_controller(
            t0(),
            &ControllerUpdate::new(EntityId::from_u128(99))
                .with_metadata(ControllerMetadata::new("LAX_TWR", ControllerLevel::Tower)),
        );

        let snapshot = store.snapshot();
        assert_eq!(snapshot.aircraft.len(), 5);
        assert_eq!(snapshot.controllers.len(), 1);

        let replica = EntityStore::with_config(StoreConfig {
            aircraft_lag: Duration::zero(),
            ..StoreConfig::default()
        });
        for update in &snapshot.aircraft {
            replica.seed_aircraft(t0(), update);
        }
        for n in 0..5u128 {
            let id = EntityId::from_u128(n);
            let original = store.raw_aircraft(id).unwrap();
            let copy = replica.raw_aircraft(id).unwrap();
            assert_eq!(copy.metadata, original.metadata);
            assert_eq!(copy.state, original.state);
            assert_eq!(copy.movement, original.movement);
        }
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let store = EntityStore::new();
        let mut rx = store.subscribe();
        let id = EntityId::from_u128(3);

        store.seed_controller(
            t0(),
            &ControllerUpdate::new(id).with_metadata(ControllerMetadata::new("X", ControllerLevel::Ground)),
        );
        store.remove_controller(id);
        store.clear();

        assert_eq!(rx.recv().await.unwrap(), StoreChange::ControllerUpserted(id));
        assert_eq!(rx.recv().await.unwrap(), StoreChange::ControllerRemoved(id));
        assert_eq!(rx.recv().await.unwrap(), StoreChange::Cleared);
    }

    #[test]
    fn test_read_path_does_not_mutate() {
        let store = EntityStore::new();
        let id = EntityId::from_u128(5);
        store.seed_aircraft(
            t0(),
            &AircraftUpdate::new(id)
                .with_state(AircraftState {
                    position: Coordinate::new(0.0, 0.0),
                    heading: 90.0,
                    altitude: 10000,
                })
                .with_movement(Movement { speed: 300.0 }),
        );
        let stored = store.raw_aircraft(id).unwrap();

        let projected = store.aircraft_at(stored.time + Duration::seconds(60));
        assert!(projected[0].state.position.longitude > 0.08);
        assert_eq!(store.raw_aircraft(id).unwrap(), stored);
    }
}
