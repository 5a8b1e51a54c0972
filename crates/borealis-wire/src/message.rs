//! Protocol messages carried inside envelopes
//!
//! The set of kinds is closed. A payload naming a kind outside of it is a
//! version mismatch with the hub and is reported as such, distinct from a
//! known kind with a malformed body.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use borealis_core::{EntityId, SyncError, SyncResult};

use crate::{AircraftUpdate, ControllerUpdate};

/// Tag field of every message
pub const KIND_FIELD: &str = "kind";

/// Every kind this build understands
pub const KNOWN_KINDS: [&str; 6] = [
    "aircraft_update",
    "controller_update",
    "authoritative_update",
    "channel_message",
    "text_message",
    "kill_message",
];

/// Radio frequency, stored in kHz and written as MHz with three decimals
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Frequency(pub u32);

impl Frequency {
    pub fn from_khz(khz: u32) -> Self {
        Frequency(khz)
    }

    pub fn khz(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.0 / 1000, self.0 % 1000)
    }
}

impl FromStr for Frequency {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SyncError::Protocol(format!("bad frequency: {s:?}"));
        let (mhz, frac) = s.trim().split_once('.').unwrap_or((s.trim(), ""));
        if frac.len() > 3 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }

        let mhz: u32 = mhz.parse().map_err(|_| bad())?;
        let frac: u32 = format!("{frac:0<3}").parse().map_err(|_| bad())?;
        mhz.checked_mul(1000)
            .and_then(|khz| khz.checked_add(frac))
            .map(Frequency)
            .ok_or_else(bad)
    }
}

impl From<Frequency> for String {
    fn from(freq: Frequency) -> Self {
        freq.to_string()
    }
}

impl TryFrom<String> for Frequency {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Full-state snapshot used to resynchronize a peer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeUpdate {
    #[serde(default)]
    pub aircraft: Vec<AircraftUpdate>,
    #[serde(default)]
    pub controllers: Vec<ControllerUpdate>,
}

impl AuthoritativeUpdate {
    pub fn len(&self) -> usize {
        self.aircraft.len() + self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Text on a radio frequency
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub from: EntityId,
    pub frequency: Frequency,
    pub text: String,
}

/// Direct text between two entities
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextMessage {
    pub from: EntityId,
    pub to: EntityId,
    pub text: String,
}

/// Ask the hub to remove an entity from the simulation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KillMessage {
    pub victim: EntityId,
}

/// Every message the tunnel carries after the handshake
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkMessage {
    AircraftUpdate(AircraftUpdate),
    ControllerUpdate(ControllerUpdate),
    AuthoritativeUpdate(AuthoritativeUpdate),
    ChannelMessage(ChannelMessage),
    TextMessage(TextMessage),
    KillMessage(KillMessage),
}

impl NetworkMessage {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::AircraftUpdate(_) => "aircraft_update",
            NetworkMessage::ControllerUpdate(_) => "controller_update",
            NetworkMessage::AuthoritativeUpdate(_) => "authoritative_update",
            NetworkMessage::ChannelMessage(_) => "channel_message",
            NetworkMessage::TextMessage(_) => "text_message",
            NetworkMessage::KillMessage(_) => "kill_message",
        }
    }

    /// Decode a decrypted payload
    pub fn decode(payload: Value) -> SyncResult<Self> {
        let kind = payload
            .as_object()
            .and_then(|obj| obj.get(KIND_FIELD))
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Protocol("payload has no message kind".into()))?;

        if !KNOWN_KINDS.contains(&kind) {
            return Err(SyncError::UnsupportedMessageKind(kind.to_owned()));
        }

        let message: NetworkMessage = serde_json::from_value(payload)
            .map_err(|e| SyncError::Protocol(format!("malformed message body: {e}")))?;
        message.validate()?;
        Ok(message)
    }

    /// Check that every carried update is well formed
    pub fn validate(&self) -> SyncResult<()> {
        match self {
            NetworkMessage::AircraftUpdate(update) => update.validate(),
            NetworkMessage::ControllerUpdate(update) => update.validate(),
            NetworkMessage::AuthoritativeUpdate(bulk) => {
                bulk.aircraft.iter().try_for_each(AircraftUpdate::validate)?;
                bulk.controllers.iter().try_for_each(ControllerUpdate::validate)
            }
            NetworkMessage::ChannelMessage(_)
            | NetworkMessage::TextMessage(_)
            | NetworkMessage::KillMessage(_) => Ok(()),
        }
    }
}

impl From<AircraftUpdate> for NetworkMessage {
    fn from(update: AircraftUpdate) -> Self {
        NetworkMessage::AircraftUpdate(update)
    }
}

impl From<ControllerUpdate> for NetworkMessage {
    fn from(update: ControllerUpdate) -> Self {
        NetworkMessage::ControllerUpdate(update)
    }
}

impl From<AuthoritativeUpdate> for NetworkMessage {
    fn from(update: AuthoritativeUpdate) -> Self {
        NetworkMessage::AuthoritativeUpdate(update)
    }
}
