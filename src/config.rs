use crate::error::{PlexError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the bridge
///
/// Every field has a default, so an empty TOML document is a valid config.
/// Durations are stored in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the Plex account API
    pub account_base_url: String,

    /// Product name sent as `X-Plex-Product`
    pub product: String,

    /// Bound on every HTTP call
    pub request_timeout_ms: u64,

    /// Bound on each endpoint reachability probe
    pub probe_timeout_ms: u64,

    /// Interval between poll ticks
    pub poll_interval_ms: u64,

    /// Fixed delay before each reconnect attempt of the notification stream
    pub reconnect_delay_ms: u64,

    /// How long `disconnect()` waits for a clean close
    pub disconnect_timeout_ms: u64,

    /// Spacing between successive `recently_added` events from one poll
    pub recently_added_stagger_ms: u64,

    /// Interval between PIN checks while pairing
    pub pin_poll_interval_ms: u64,

    /// How long to wait for the user to approve a PIN
    pub pin_timeout_ms: u64,

    /// Capacity of the outward event channel
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            account_base_url: "https://plex.tv".to_string(),
            product: "Plex Bridge".to_string(),
            request_timeout_ms: 5_000,
            probe_timeout_ms: 5_000,
            poll_interval_ms: 60_000,
            reconnect_delay_ms: 5_000,
            disconnect_timeout_ms: 2_500,
            recently_added_stagger_ms: 2_000,
            pin_poll_interval_ms: 1_000,
            pin_timeout_ms: 60_000,
            event_capacity: 100,
        }
    }
}

impl BridgeConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| PlexError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PlexError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(PlexError::Config("event_capacity must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(PlexError::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.pin_poll_interval_ms == 0 {
            return Err(PlexError::Config("pin_poll_interval_ms must be positive".to_string()));
        }
        url::Url::parse(&self.account_base_url)
            .map_err(|e| PlexError::Config(format!("account_base_url: {}", e)))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn recently_added_stagger(&self) -> Duration {
        Duration::from_millis(self.recently_added_stagger_ms)
    }

    pub fn pin_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pin_poll_interval_ms)
    }

    pub fn pin_timeout(&self) -> Duration {
        Duration::from_millis(self.pin_timeout_ms)
    }

    /// Account base URL without a trailing slash
    pub(crate) fn account_base(&self) -> &str {
        self.account_base_url.trim_end_matches('/')
    }
}
