//! Centralized Configuration Management
//!
//! All configuration consumed by the engine and its collaborators. Durations are
//! stored as integer milliseconds so the TOML form stays readable; accessors
//! return `Duration`.

use core::time::Duration;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{PairchatError, Result};

// ----------------------------------------------------------------------------
// ICE Configuration
// ----------------------------------------------------------------------------

/// Network traversal servers handed to the connection factory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN/TURN server URLs
    pub servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:stun3.l.google.com:19302".to_string(),
                "stun:stun4.l.google.com:19302".to_string(),
            ],
        }
    }
}

// ----------------------------------------------------------------------------
// Negotiation Configuration
// ----------------------------------------------------------------------------

/// Limits applied to the offer/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Upper bound on each asynchronous description call
    pub description_timeout_ms: u64,
    /// Automatic re-pairings after consecutive failures without reaching Stable
    pub max_negotiation_retries: u32,
    /// When set, a Responder still idle after this long sends its own offer
    pub responder_offer_fallback_ms: Option<u64>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            description_timeout_ms: 10_000,
            max_negotiation_retries: 1,
            responder_offer_fallback_ms: None,
        }
    }
}

impl NegotiationConfig {
    pub fn description_timeout(&self) -> Duration {
        Duration::from_millis(self.description_timeout_ms)
    }

    pub fn responder_offer_fallback(&self) -> Option<Duration> {
        self.responder_offer_fallback_ms.map(Duration::from_millis)
    }

    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            description_timeout_ms: 1_000,
            max_negotiation_retries: 1,
            responder_offer_fallback_ms: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Reconnect Policy
// ----------------------------------------------------------------------------

/// Bounded reconnection schedule owned by a relay link implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based), doubling up to `max_delay_ms`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// No delays between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the bounded channels between tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffer size for Command channels (UI → controller)
    pub command_buffer_size: usize,
    /// Buffer size for LinkEvent channels (link → controller)
    pub link_event_buffer_size: usize,
    /// Buffer size for AppEvent channels (controller → UI)
    pub app_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32,
            link_event_buffer_size: 128, // candidates arrive in bursts
            app_event_buffer_size: 64,
        }
    }
}

impl ChannelConfig {
    /// Create configuration for low-memory environments
    pub fn low_memory() -> Self {
        Self {
            command_buffer_size: 8,
            link_event_buffer_size: 32,
            app_event_buffer_size: 16,
        }
    }

    /// Create configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 100,
            link_event_buffer_size: 256,
            app_event_buffer_size: 256,
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum retained negotiation audit entries
    pub audit_capacity: usize,
    pub ice: IceConfig,
    pub negotiation: NegotiationConfig,
    pub reconnect: ReconnectPolicy,
    pub channels: ChannelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audit_capacity: 1000,
            ice: IceConfig::default(),
            negotiation: NegotiationConfig::default(),
            reconnect: ReconnectPolicy::default(),
            channels: ChannelConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for tests: no backoff, short timeouts, roomy channels
    pub fn testing() -> Self {
        Self {
            audit_capacity: 100,
            ice: IceConfig { servers: Vec::new() },
            negotiation: NegotiationConfig::testing(),
            reconnect: ReconnectPolicy::immediate(3),
            channels: ChannelConfig::testing(),
        }
    }

    /// Create a low-memory configuration
    pub fn low_memory() -> Self {
        Self {
            channels: ChannelConfig::low_memory(),
            audit_capacity: 100,
            ..Self::default()
        }
    }

    /// Parse from TOML; missing sections fall back to defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(input)
            .map_err(|e| PairchatError::config_error(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PairchatError::config_error(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PairchatError::config_error(format!("failed to serialize: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.negotiation.description_timeout_ms == 0 {
            return Err(PairchatError::config_error(
                "description_timeout_ms must be greater than 0",
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(PairchatError::config_error(
                "reconnect initial_delay_ms exceeds max_delay_ms",
            ));
        }
        let channels = &self.channels;
        if channels.command_buffer_size == 0
            || channels.link_event_buffer_size == 0
            || channels.app_event_buffer_size == 0
        {
            return Err(PairchatError::config_error("channel buffer sizes must be non-zero"));
        }
        if self.audit_capacity == 0 {
            return Err(PairchatError::config_error("audit_capacity must be non-zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stun_servers() {
        let config = EngineConfig::default();
        assert_eq!(config.ice.servers.len(), 5);
        assert!(config.ice.servers.iter().all(|s| s.starts_with("stun:")));
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            audit_capacity = 10

            [negotiation]
            description_timeout_ms = 2500
            max_negotiation_retries = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.audit_capacity, 10);
        assert_eq!(config.negotiation.description_timeout(), Duration::from_millis(2500));
        assert_eq!(config.negotiation.max_negotiation_retries, 0);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let text = EngineConfig::default().to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let result = EngineConfig::from_toml_str("[negotiation]\ndescription_timeout_ms = 0\n");
        assert!(matches!(result, Err(PairchatError::Configuration { .. })));
    }
}
