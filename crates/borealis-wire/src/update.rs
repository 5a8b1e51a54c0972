//! Partial entity updates
//!
//! An update names its target, the groups it changes, and carries exactly
//! those groups. Applying it is a pure function from the previous entity
//! value to the next one: flagged groups are replaced, everything else is
//! carried over untouched.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use borealis_core::{
    Aircraft, AircraftMetadata, AircraftState, Controller, ControllerMetadata, ControllerState,
    EntityId, Movement, SyncError, SyncResult, Timestamp,
};

use crate::UpdatedFields;

/// Latency compensation added to aircraft timestamps, in seconds
pub const AIRCRAFT_LAG_SECONDS: i64 = 1;

/// Default latency compensation for aircraft
pub fn default_aircraft_lag() -> Duration {
    Duration::seconds(AIRCRAFT_LAG_SECONDS)
}

/// Partial update of one aircraft
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AircraftUpdate {
    pub aircraft: EntityId,
    pub update: UpdatedFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AircraftMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AircraftState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movement: Option<Movement>,
}

impl AircraftUpdate {
    /// Update touching no group yet
    pub fn new(aircraft: EntityId) -> Self {
        AircraftUpdate {
            aircraft,
            update: UpdatedFields::NONE,
            metadata: None,
            state: None,
            movement: None,
        }
    }

    pub fn delete(aircraft: EntityId) -> Self {
        AircraftUpdate {
            update: UpdatedFields::delete(),
            ..Self::new(aircraft)
        }
    }

    /// Update carrying every group of `aircraft`
    pub fn full(id: EntityId, aircraft: &Aircraft) -> Self {
        Self::new(id)
            .with_metadata(aircraft.metadata.clone())
            .with_state(aircraft.state)
            .with_movement(aircraft.movement)
    }

    pub fn with_metadata(mut self, metadata: AircraftMetadata) -> Self {
        self.update.set_metadata(true);
        self.metadata = Some(metadata);
        self
    }

    pub fn with_state(mut self, state: AircraftState) -> Self {
        self.update.set_state(true);
        self.state = Some(state);
        self
    }

    pub fn with_movement(mut self, movement: Movement) -> Self {
        self.update.set_movement(true);
        self.movement = Some(movement);
        self
    }

    /// Check that flags and carried groups agree
    pub fn validate(&self) -> SyncResult<()> {
        check_flags(self.update, self.aircraft)?;

        if self.update.has_metadata() && self.metadata.is_none() {
            return Err(missing_group(self.aircraft, "metadata"));
        }
        if self.update.has_state() && self.state.is_none() {
            return Err(missing_group(self.aircraft, "state"));
        }
        if self.update.has_movement() && self.movement.is_none() {
            return Err(missing_group(self.aircraft, "movement"));
        }
        Ok(())
    }

    /// Next value of `aircraft` after this update
    ///
    /// The timestamp becomes `sent + lag` whatever groups were touched.
    pub fn apply(&self, sent: Timestamp, lag: Duration, aircraft: &Aircraft) -> Aircraft {
        let metadata = match (&self.metadata, self.update.has_metadata()) {
            (Some(metadata), true) => metadata.clone(),
            _ => aircraft.metadata.clone(),
        };
        let state = match (self.state, self.update.has_state()) {
            (Some(state), true) => state,
            _ => aircraft.state,
        };
        let movement = match (self.movement, self.update.has_movement()) {
            (Some(movement), true) => movement,
            _ => aircraft.movement,
        };

        Aircraft {
            time: sent.checked_add_signed(lag).unwrap_or(sent),
            metadata,
            state,
            movement,
        }
    }
}

/// Partial update of one controller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerUpdate {
    pub controller: EntityId,
    pub update: UpdatedFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ControllerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ControllerState>,
}

impl ControllerUpdate {
    pub fn new(controller: EntityId) -> Self {
        ControllerUpdate {
            controller,
            update: UpdatedFields::NONE,
            metadata: None,
            state: None,
        }
    }

    pub fn delete(controller: EntityId) -> Self {
        ControllerUpdate {
            update: UpdatedFields::delete(),
            ..Self::new(controller)
        }
    }

    pub fn full(id: EntityId, controller: &Controller) -> Self {
        Self::new(id)
            .with_metadata(controller.metadata.clone())
            .with_state(controller.state.clone())
    }

    pub fn with_metadata(mut self, metadata: ControllerMetadata) -> Self {
        self.update.set_metadata(true);
        self.metadata = Some(metadata);
        self
    }

    pub fn with_state(mut self, state: ControllerState) -> Self {
        self.update.set_state(true);
        self.state = Some(state);
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        check_flags(self.update, self.controller)?;

        if self.update.has_movement() {
            return Err(SyncError::Protocol(format!(
                "controller {} update flags movement",
                self.controller
            )));
        }
        if self.update.has_metadata() && self.metadata.is_none() {
            return Err(missing_group(self.controller, "metadata"));
        }
        if self.update.has_state() && self.state.is_none() {
            return Err(missing_group(self.controller, "state"));
        }
        Ok(())
    }

    /// Next value of `controller` after this update
    ///
    /// Controllers take the send time as is, with no lag compensation.
    pub fn apply(&self, sent: Timestamp, controller: &Controller) -> Controller {
        let metadata = match (&self.metadata, self.update.has_metadata()) {
            (Some(metadata), true) => metadata.clone(),
            _ => controller.metadata.clone(),
        };
        let state = match (&self.state, self.update.has_state()) {
            (Some(state), true) => state.clone(),
            _ => controller.state.clone(),
        };

        Controller {
            time: sent,
            metadata,
            state,
        }
    }
}

fn check_flags(update: UpdatedFields, target: EntityId) -> SyncResult<()> {
    if update.unknown_bits() != 0 {
        return Err(SyncError::Protocol(format!(
            "update for {target} has unknown flag bits {:#04x}",
            update.unknown_bits()
        )));
    }
    if update.is_delete() && update.has_data() {
        return Err(SyncError::Protocol(format!(
            "update for {target} combines delete with data"
        )));
    }
    Ok(())
}

fn missing_group(target: EntityId, group: &str) -> SyncError {
    SyncError::Protocol(format!("update for {target} flags {group} but carries none"))
}
