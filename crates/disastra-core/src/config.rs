//! Centralized Configuration Management
//!
//! All relay tunables live in [`RelayConfig`], which is serde-loadable so
//! front ends can read it from TOML.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryConfig;
use crate::errors::{RelayError, Result};
use crate::protocol::deduplication::DEFAULT_SEEN_RETENTION;
use crate::types::Ttl;

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Configuration for CSP channel buffer sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffer size for Command channels (Application → Relay)
    pub command_buffer_size: usize,
    /// Buffer size for AppEvent channels (Relay → Application)
    pub app_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32,
            app_event_buffer_size: 128,
        }
    }
}

impl ChannelConfig {
    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 64,
            app_event_buffer_size: 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Cache Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a seen id blocks re-delivery and re-broadcast
    pub seen_retention_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            seen_retention_secs: DEFAULT_SEEN_RETENTION.as_secs(),
        }
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.seen_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// How long a follow-up waits for its SOS before it is delivered on its own
    pub retention_secs: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            retention_secs: 6 * 60 * 60,
        }
    }
}

impl OrphanConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

// ----------------------------------------------------------------------------
// Relay Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub delivery: DeliveryConfig,
    pub dedup: DedupConfig,
    pub orphans: OrphanConfig,
    pub channels: ChannelConfig,
    /// Period of the retry scan
    pub scan_interval_ms: u64,
    /// TTL given to envelopes built by front ends
    pub default_ttl: Ttl,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryConfig::default(),
            dedup: DedupConfig::default(),
            orphans: OrphanConfig::default(),
            channels: ChannelConfig::default(),
            scan_interval_ms: 1_000,
            default_ttl: Ttl::DEFAULT,
        }
    }
}

impl RelayConfig {
    /// Fast timers and generous buffers for tests and simulation
    pub fn testing() -> Self {
        Self {
            delivery: DeliveryConfig::testing(),
            dedup: DedupConfig {
                seen_retention_secs: 60,
            },
            orphans: OrphanConfig { retention_secs: 60 },
            channels: ChannelConfig::testing(),
            scan_interval_ms: 10,
            default_ttl: Ttl::new(7, Duration::from_secs(60)),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.channels.command_buffer_size == 0 {
            return Err(RelayError::config_error("Command buffer size cannot be zero"));
        }
        if self.channels.app_event_buffer_size == 0 {
            return Err(RelayError::config_error("App event buffer size cannot be zero"));
        }

        if self.delivery.max_attempts == 0 {
            return Err(RelayError::config_error("Max attempts cannot be zero"));
        }
        let multiplier = self.delivery.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(RelayError::config_error(
                "Backoff multiplier must be at least 1.0",
            ));
        }
        if self.delivery.initial_retry_delay_ms > self.delivery.max_retry_delay_ms {
            return Err(RelayError::config_error(
                "Initial retry delay cannot be greater than max retry delay",
            ));
        }

        if self.scan_interval_ms == 0 {
            return Err(RelayError::config_error("Scan interval cannot be zero"));
        }
        if self.dedup.seen_retention_secs == 0 {
            return Err(RelayError::config_error("Seen retention cannot be zero"));
        }
        if self.default_ttl.lifetime_ms == 0 {
            return Err(RelayError::config_error("Default TTL lifetime cannot be zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(RelayConfig::default().validate().is_ok());
        assert!(RelayConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.delivery.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.delivery.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.delivery.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.delivery.initial_retry_delay_ms = config.delivery.max_retry_delay_ms + 1;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.channels.command_buffer_size = 0;
        assert!(config.validate().is_err());
    }
}
