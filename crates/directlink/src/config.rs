//! # Endpoint Configuration
//!
//! Tunables for the network thread, loadable from TOML.
//!
//! ```toml
//! heartbeat_interval_ms = 1000
//! tick_wait_ms = 20
//! tick_budget_ms = 10
//! have_list_batch_size = 64
//! auto_connect = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DirectLinkError, DirectLinkResult};

/// Endpoint configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Interval between two `Heartbeat` broadcasts.
    pub heartbeat_interval_ms: u64,
    /// Bounded wait of the network thread when idle.
    pub tick_wait_ms: u64,
    /// Handling time after which a tick counts as late. The idle wait is
    /// not part of it.
    pub tick_budget_ms: u64,
    /// Number of `HaveElement` entries packed in one have-list message.
    pub have_list_batch_size: usize,
    /// Connects public sources to remote public destinations of the same name.
    pub auto_connect: bool,
    /// Capacity of the caller → network thread command queue.
    pub command_queue_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            tick_wait_ms: 20,
            tick_budget_ms: 10,
            have_list_batch_size: 64,
            auto_connect: true,
            command_queue_capacity: 1024,
        }
    }
}

impl EndpointConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> DirectLinkResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DirectLinkError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> DirectLinkResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DirectLinkError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Rejects values the network thread cannot work with.
    pub fn validate(&self) -> DirectLinkResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(DirectLinkError::InvalidConfig(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.tick_wait_ms == 0 {
            return Err(DirectLinkError::InvalidConfig("tick_wait_ms must be > 0".into()));
        }
        if self.tick_budget_ms == 0 {
            return Err(DirectLinkError::InvalidConfig("tick_budget_ms must be > 0".into()));
        }
        if self.have_list_batch_size == 0 {
            return Err(DirectLinkError::InvalidConfig(
                "have_list_batch_size must be > 0".into(),
            ));
        }
        if self.command_queue_capacity == 0 {
            return Err(DirectLinkError::InvalidConfig(
                "command_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Heartbeat interval as a duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Idle wait as a duration.
    #[must_use]
    pub const fn tick_wait(&self) -> Duration {
        Duration::from_millis(self.tick_wait_ms)
    }

    /// Tick handling budget as a duration.
    #[must_use]
    pub const fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EndpointConfig::from_toml_str("tick_wait_ms = 5\nauto_connect = false").unwrap();
        assert_eq!(config.tick_wait_ms, 5);
        assert!(!config.auto_connect);
        assert_eq!(config.heartbeat_interval_ms, 1000);
        assert_eq!(config.have_list_batch_size, 64);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = EndpointConfig::from_toml_str("have_list_batch_size = 0").unwrap_err();
        assert!(matches!(err, DirectLinkError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_tick_budget_rejected() {
        assert!(EndpointConfig::from_toml_str("tick_budget_ms = 0").is_err());
        assert_eq!(EndpointConfig::default().tick_budget().as_millis(), 10);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(EndpointConfig::from_toml_str("tick_wait_ms = \"soon\"").is_err());
    }
}
