//! Replicated entity model
//!
//! Entities are plain immutable values. Each one is split into field groups
//! (metadata, state, movement) so that a partial update can replace a group
//! without touching the others.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock timestamp used on the wire and in the store
pub type Timestamp = DateTime<Utc>;

/// Timestamp of an entity that has never been updated
pub const NEVER: Timestamp = DateTime::<Utc>::MIN_UTC;

/// Geographic position in decimal degrees
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Coordinate {
            latitude,
            longitude,
        }
    }
}

/// Filed flight rules
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlightRules {
    Ifr,
    Vfr,
    Dvfr,
    Svfr,
    #[default]
    Unknown,
}

/// Flight plan side of an aircraft
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AircraftMetadata {
    pub callsign: String,
    pub rules: FlightRules,
    pub origin: String,
    pub destination: String,
    pub route: String,
    /// Feet, -1 for VFR
    pub filed_altitude: i32,
    /// Knots
    pub filed_speed: u32,
}

/// Where the aircraft is and where it points
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AircraftState {
    pub position: Coordinate,
    /// Degrees true
    pub heading: f32,
    /// Feet
    pub altitude: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    /// Ground speed in knots
    pub speed: f32,
}

/// Aircraft as last reported by the hub
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aircraft {
    /// Time of the most recently applied update
    pub time: Timestamp,
    pub metadata: AircraftMetadata,
    pub state: AircraftState,
    pub movement: Movement,
}

impl Default for Aircraft {
    fn default() -> Self {
        Aircraft {
            time: NEVER,
            metadata: AircraftMetadata::default(),
            state: AircraftState::default(),
            movement: Movement::default(),
        }
    }
}

/// Facility level of a controller position
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerLevel {
    #[default]
    Observer,
    Delivery,
    Ground,
    Tower,
    Approach,
    Center,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerMetadata {
    pub callsign: String,
    pub level: ControllerLevel,
}

impl ControllerMetadata {
    pub fn new(callsign: impl Into<String>, level: ControllerLevel) -> Self {
        ControllerMetadata {
            callsign: callsign.into(),
            level,
        }
    }
}

/// Area of responsibility; empty when the controller has not drawn one
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub area: Vec<Coordinate>,
}

/// Controller as last reported by the hub
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    /// Time of the most recently applied update
    pub time: Timestamp,
    pub metadata: ControllerMetadata,
    pub state: ControllerState,
}

impl Default for Controller {
    fn default() -> Self {
        Controller {
            time: NEVER,
            metadata: ControllerMetadata::default(),
            state: ControllerState::default(),
        }
    }
}
