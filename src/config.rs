//! # Configuration Management
//!
//! Loads bridge settings from three layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `sco-bridge.toml` in the working directory
//! - Environment variables prefixed with `SCO_BRIDGE`, sections split by `__`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`SCO_BRIDGE__LINK__SETTLE_DELAY_MS=150`, ...)
//! 2. Configuration file (`sco-bridge.toml`)
//! 3. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::jitter::DEFAULT_JITTER_MS;

/// Environment prefix for overrides.
const ENV_PREFIX: &str = "SCO_BRIDGE";

/// Highest number of kickstart writes the handshake may issue.
pub const MAX_KICKSTART_ATTEMPTS: u32 = 5;

/// Top-level bridge configuration.
///
/// Grouped by concern so each component only needs its own section:
/// the dispatcher reads `agent`, the handshake reads `link`, the workers read
/// `stream`, and the device launcher reads `audio`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub agent: AgentConfig,
    pub link: LinkConfig,
    pub stream: StreamConfig,
    pub audio: AudioConfig,
}

/// Call-control bus settings.
///
/// ## Fields:
/// - `service`: well-known D-Bus name of the telephony daemon
/// - `agent_path`: object path the audio agent is exported at
/// - `register_timeout_secs`: how long to keep retrying while the service is absent
/// - `register_retry_ms`: pause between registration attempts
/// - `wideband`: offer mSBC when a transform is available
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub service: String,
    pub agent_path: String,
    pub register_timeout_secs: u64,
    pub register_retry_ms: u64,
    pub wideband: bool,
}

/// Link handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Command run once at startup to switch the adapter to transparent voice.
    /// Empty skips the step.
    pub voice_setting_command: Vec<String>,
    pub kickstart_attempts: u32,
    pub settle_delay_ms: u64,
}

/// Stream engine retry policy.
///
/// ## Tuning guidelines:
/// - `poll_timeout_ms` bounds how long a stop request can go unnoticed
/// - `max_link_timeouts` is the number of consecutive connection timeouts the
///   receive worker tolerates
/// - `max_write_failures` is the number of consecutive hard write errors the
///   transmit worker tolerates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub poll_timeout_ms: u64,
    pub max_link_timeouts: u32,
    pub timeout_backoff_ms: u64,
    pub write_backoff_ms: u64,
    pub max_write_failures: u32,
}

/// Host audio device settings.
///
/// Commands may contain `{rate}`, replaced by the session sample rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub playback_command: Vec<String>,
    pub capture_command: Vec<String>,
    /// Prefill for narrowband calls; 0 forwards directly.
    pub jitter_buffer_ms: u32,
}

fn args(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                service: "org.ofono".to_string(),
                agent_path: "/org/scobridge/agent".to_string(),
                register_timeout_secs: 60,
                register_retry_ms: 1000,
                wideband: true,
            },
            link: LinkConfig {
                voice_setting_command: args(&["hciconfig", "hci0", "voice", "0x0063"]),
                kickstart_attempts: MAX_KICKSTART_ATTEMPTS,
                settle_delay_ms: 200,
            },
            stream: StreamConfig {
                poll_timeout_ms: 1000,
                max_link_timeouts: 3,
                timeout_backoff_ms: 100,
                write_backoff_ms: 10,
                max_write_failures: 10,
            },
            audio: AudioConfig {
                playback_command: args(&[
                    "aplay", "-q", "-t", "raw", "-f", "S16_LE", "-c", "1", "-r", "{rate}",
                ]),
                capture_command: args(&[
                    "arecord", "-q", "-t", "raw", "-f", "S16_LE", "-c", "1", "-r", "{rate}",
                ]),
                jitter_buffer_ms: DEFAULT_JITTER_MS,
            },
        }
    }
}

impl BridgeConfig {
    /// Load configuration from defaults, `sco-bridge.toml` and the environment.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&BridgeConfig::default())?)
            .add_source(config::File::with_name("sco-bridge").required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("link.voice_setting_command")
                    .with_list_parse_key("audio.playback_command")
                    .with_list_parse_key("audio.capture_command")
                    .try_parsing(true),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings that would make a worker spin or never give up.
    pub fn validate(&self) -> Result<()> {
        if self.agent.service.is_empty() {
            return Err(anyhow::anyhow!("Call-control service name must not be empty"));
        }

        if !self.agent.agent_path.starts_with('/') {
            return Err(anyhow::anyhow!("Agent path must be an absolute object path"));
        }

        if self.agent.register_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Registration timeout must be greater than 0"));
        }

        if self.link.kickstart_attempts == 0 || self.link.kickstart_attempts > MAX_KICKSTART_ATTEMPTS {
            return Err(anyhow::anyhow!(
                "Kickstart attempts must be between 1 and {}",
                MAX_KICKSTART_ATTEMPTS
            ));
        }

        if self.link.settle_delay_ms > 1000 {
            return Err(anyhow::anyhow!("Settle delay cannot exceed 1000ms"));
        }

        if self.stream.poll_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Poll timeout must be greater than 0"));
        }

        if self.stream.max_link_timeouts == 0 {
            return Err(anyhow::anyhow!("Link timeout bound must be greater than 0"));
        }

        if self.stream.max_write_failures == 0 {
            return Err(anyhow::anyhow!("Write failure bound must be greater than 0"));
        }

        if self.audio.playback_command.is_empty() || self.audio.capture_command.is_empty() {
            return Err(anyhow::anyhow!("Playback and capture commands must not be empty"));
        }

        Ok(())
    }
}

impl AgentConfig {
    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }

    pub fn register_retry(&self) -> Duration {
        Duration::from_millis(self.register_retry_ms)
    }
}

impl LinkConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.agent.service, "org.ofono");
        assert_eq!(config.agent.register_timeout_secs, 60);
        assert_eq!(config.link.kickstart_attempts, 5);
        assert_eq!(config.stream.max_link_timeouts, 3);
        assert_eq!(config.stream.max_write_failures, 10);
        assert_eq!(config.audio.jitter_buffer_ms, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = BridgeConfig::default();
        config.link.kickstart_attempts = 6;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.stream.poll_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.audio.capture_command.clear();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.link.settle_delay_ms = 1500;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.agent.agent_path = "agent".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        std::env::set_var("SCO_BRIDGE__LINK__SETTLE_DELAY_MS", "150");
        std::env::set_var("SCO_BRIDGE__AGENT__WIDEBAND", "false");
        let config = BridgeConfig::load();
        std::env::remove_var("SCO_BRIDGE__LINK__SETTLE_DELAY_MS");
        std::env::remove_var("SCO_BRIDGE__AGENT__WIDEBAND");

        let config = config.unwrap();
        assert_eq!(config.link.settle_delay_ms, 150);
        assert!(!config.agent.wideband);
        // Untouched sections keep their defaults
        assert_eq!(config.stream.poll_timeout_ms, 1000);
    }
}
