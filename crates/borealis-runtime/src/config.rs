//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use borealis_core::{ControllerLevel, ControllerMetadata, EntityId, SyncError, SyncResult};
use borealis_state::{StoreConfig, DEFAULT_CHANGE_BUFFER};
use borealis_wire::AIRCRAFT_LAG_SECONDS;

/// Default base URL of the hub tunnel
pub const DEFAULT_TUNNEL_BASE: &str = "ws://127.0.0.1:5031";

/// Logging setup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".into(),
            json: false,
        }
    }
}

/// How this client presents itself to the hub
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub callsign: String,
    pub level: ControllerLevel,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        PresenceConfig {
            callsign: "KZLA".into(),
            level: ControllerLevel::Center,
        }
    }
}

impl From<&PresenceConfig> for ControllerMetadata {
    fn from(presence: &PresenceConfig) -> Self {
        ControllerMetadata::new(presence.callsign.clone(), presence.level)
    }
}

/// Session configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base of the tunnel URL; the hub id is appended as `/connect/{id}`
    pub tunnel_base: String,
    /// Discovery endpoint, empty until selected
    pub discovery_endpoint: String,
    /// Latency compensation added to aircraft update times
    #[serde(with = "humantime_duration")]
    pub aircraft_lag: Duration,
    /// Pause between installing the dispatcher and confirming
    #[serde(with = "humantime_duration")]
    pub confirmation_delay: Duration,
    pub presence: PresenceConfig,
    /// Capacity of the store change and session event channels
    pub change_buffer: usize,
    pub log: LogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            tunnel_base: DEFAULT_TUNNEL_BASE.into(),
            discovery_endpoint: String::new(),
            aircraft_lag: Duration::from_secs(AIRCRAFT_LAG_SECONDS as u64),
            confirmation_delay: Duration::from_millis(100),
            presence: PresenceConfig::default(),
            change_buffer: DEFAULT_CHANGE_BUFFER,
            log: LogConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load from JSON text; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::NotConfigured(format!("bad config: {e}")))
    }

    pub fn with_tunnel_base(mut self, base: impl Into<String>) -> Self {
        self.tunnel_base = base.into();
        self
    }

    pub fn with_discovery_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.discovery_endpoint = endpoint.into();
        self
    }

    pub fn with_aircraft_lag(mut self, lag: Duration) -> Self {
        self.aircraft_lag = lag;
        self
    }

    pub fn with_confirmation_delay(mut self, delay: Duration) -> Self {
        self.confirmation_delay = delay;
        self
    }

    pub fn with_presence(mut self, callsign: impl Into<String>, level: ControllerLevel) -> Self {
        self.presence = PresenceConfig {
            callsign: callsign.into(),
            level,
        };
        self
    }

    pub fn with_change_buffer(mut self, capacity: usize) -> Self {
        self.change_buffer = capacity;
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Tunnel URL for `hub`
    pub fn tunnel_url(&self, hub: EntityId) -> String {
        format!("{}/connect/{}", self.tunnel_base.trim_end_matches('/'), hub)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            aircraft_lag: chrono::Duration::from_std(self.aircraft_lag)
                .unwrap_or_else(|_| borealis_wire::default_aircraft_lag()),
            change_buffer: self.change_buffer,
        }
    }
}

/// Durations written the human way: `"1s"`, `"100ms"`
mod humantime_duration {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(de::Error::custom)
    }
}
