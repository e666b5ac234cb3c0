//! Pairchat CLI Configuration Management
//!
//! Configuration is loaded from a TOML file (`--config`) with two sections:
//! `[engine]`, the engine's own `EngineConfig`, and `[cli]` for this binary.
//! Missing keys fall back to defaults. `PAIRCHAT_*` environment variables
//! override the file.

use std::path::Path;

use pairchat_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub cli: CliConfig,
}

/// Settings for the binary itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Prompt shown in chat mode
    pub prompt: String,
    /// How long the demo waits for each expected event
    pub event_timeout_secs: u64,
    /// Participant token of the chat-mode echo partner
    pub echo_partner: String,
    /// Give participants a camera and microphone
    pub with_media: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            prompt: "pairchat> ".to_string(),
            event_timeout_secs: 10,
            echo_partner: "echo".to_string(),
            with_media: true,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.cli.event_timeout_secs == 0 {
            return Err(CliError::Config(
                "cli.event_timeout_secs must be positive".to_string(),
            ));
        }
        if self.cli.echo_partner.trim().is_empty() {
            return Err(CliError::Config(
                "cli.echo_partner must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `PAIRCHAT_EVENT_TIMEOUT_SECS` and `PAIRCHAT_RESPONDER_FALLBACK_MS`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("PAIRCHAT_EVENT_TIMEOUT_SECS") {
            self.cli.event_timeout_secs = value.parse().map_err(|_| {
                CliError::Config(format!("invalid PAIRCHAT_EVENT_TIMEOUT_SECS: {}", value))
            })?;
        }
        if let Ok(value) = std::env::var("PAIRCHAT_RESPONDER_FALLBACK_MS") {
            let millis = value.parse().map_err(|_| {
                CliError::Config(format!("invalid PAIRCHAT_RESPONDER_FALLBACK_MS: {}", value))
            })?;
            self.engine.negotiation.responder_offer_fallback_ms = Some(millis);
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [engine.negotiation]
            max_negotiation_retries = 3

            [cli]
            prompt = "> "
            "#,
        )
        .expect("Failed to parse config");

        assert_eq!(config.engine.negotiation.max_negotiation_retries, 3);
        assert_eq!(config.engine.negotiation.description_timeout_ms, 10_000);
        assert_eq!(config.engine.ice.servers.len(), 5);
        assert_eq!(config.cli.prompt, "> ");
        assert_eq!(config.cli.echo_partner, "echo");
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = AppConfig::default();
        config.engine.negotiation.responder_offer_fallback_ms = Some(2_000);
        let text = config.to_toml_string().expect("Failed to serialize");
        let parsed = AppConfig::from_toml_str(&text).expect("Failed to parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml_str("[cli]\nevent_timeout_secs = 0\n").is_err());
        assert!(AppConfig::from_toml_str("[engine.negotiation]\ndescription_timeout_ms = 0\n").is_err());
        assert!(AppConfig::from_toml_str("not toml [").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        writeln!(file, "[cli]\nwith_media = false").expect("Failed to write config");
        let config = AppConfig::load_from_file(file.path()).expect("Failed to load config");
        assert!(!config.cli.with_media);
    }
}
