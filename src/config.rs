//! Discovery engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Interval between checks while waiting for a port to clear
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling on waiting for a port's previous occupant to unregister
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Bytes of a received frame retained on the device
pub const MAX_FRAME_SIZE: usize = 32;

/// Configuration for the discovery engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Interval between drain-wait checks
    #[serde(with = "duration_ms")]
    pub drain_poll_interval: Duration,

    /// Drain-wait ceiling
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,

    /// Maximum events executing concurrently across all ports
    pub max_concurrent_events: usize,

    /// Maximum depth of the expander tree walk
    pub max_expander_depth: usize,

    /// Bytes copied from a PHY's received frame
    pub max_frame_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_concurrent_events: 16,
            max_expander_depth: 16,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl DiscoveryConfig {
    /// Number of drain-wait polls before giving up
    pub fn drain_attempts(&self) -> u64 {
        let poll = self.drain_poll_interval.as_millis().max(1);
        (self.drain_timeout.as_millis() / poll) as u64
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.drain_poll_interval.is_zero() {
            return Err(Error::Config("drain_poll_interval must be > 0".into()));
        }
        if self.drain_timeout < self.drain_poll_interval {
            return Err(Error::Config(
                "drain_timeout must be >= drain_poll_interval".into(),
            ));
        }
        if self.max_concurrent_events == 0 {
            return Err(Error::Config("max_concurrent_events must be > 0".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_FRAME_SIZE {
            return Err(Error::Config(format!(
                "max_frame_size must be within 1..={}",
                MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drain_attempts(), 1800);
    }

    #[test]
    fn test_invalid_config() {
        let config = DiscoveryConfig {
            max_concurrent_events: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            drain_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DiscoveryConfig {
            max_frame_size: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let config: DiscoveryConfig =
            serde_yaml::from_str("drain_timeout: 1000\nmax_expander_depth: 4\n").unwrap();
        assert_eq!(config.drain_timeout, Duration::from_secs(1));
        assert_eq!(config.max_expander_depth, 4);
        assert_eq!(config.drain_poll_interval, DEFAULT_DRAIN_POLL_INTERVAL);
    }
}
