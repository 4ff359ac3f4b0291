use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::session::reconnect::ReconnectPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Paths
    pub data_dir: PathBuf,
    pub state_file: PathBuf,
    pub streams_file: PathBuf,

    // Reconexión
    pub max_reconnect_attempts: u32,
    #[serde(with = "humantime_serde_compat")]
    pub reconnect_delay: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub reconnect_max_delay: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub reconnect_max_elapsed: Duration,

    // Metadata ICY
    #[serde(with = "humantime_serde_compat")]
    pub metadata_fetch_interval: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub metadata_timeout: Duration,

    // UI
    pub stop_reaction: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let data_dir: PathBuf = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,
            application_id: std::env::var("APPLICATION_ID")
                .context("APPLICATION_ID no definido")?
                .parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Paths
            state_file: std::env::var("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("state.json")),
            streams_file: std::env::var("STREAMS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.streams_file),
            data_dir,

            // Reconexión
            max_reconnect_attempts: std::env::var("MAX_RECONNECT_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            reconnect_delay: env_duration("RECONNECT_DELAY", defaults.reconnect_delay)?,
            reconnect_max_delay: env_duration("RECONNECT_MAX_DELAY", defaults.reconnect_max_delay)?,
            reconnect_max_elapsed: env_duration(
                "RECONNECT_MAX_ELAPSED",
                defaults.reconnect_max_elapsed,
            )?,

            // Metadata
            metadata_fetch_interval: env_duration(
                "METADATA_FETCH_INTERVAL",
                defaults.metadata_fetch_interval,
            )?,
            metadata_timeout: env_duration("METADATA_TIMEOUT", defaults.metadata_timeout)?,

            stop_reaction: std::env::var("STOP_REACTION").unwrap_or(defaults.stop_reaction),
        };

        // Create the data directory if it doesn't exist
        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one reconnect attempt
    /// - Backoff base delay must not exceed the delay cap
    /// - Metadata polling interval must be at least one second
    /// - The stop reaction must not be empty
    pub fn validate(&self) -> Result<()> {
        if self.max_reconnect_attempts == 0 {
            anyhow::bail!("MAX_RECONNECT_ATTEMPTS must be greater than 0");
        }

        if self.reconnect_delay > self.reconnect_max_delay {
            anyhow::bail!(
                "RECONNECT_DELAY ({}) cannot exceed RECONNECT_MAX_DELAY ({})",
                humantime::format_duration(self.reconnect_delay),
                humantime::format_duration(self.reconnect_max_delay)
            );
        }

        if self.reconnect_max_elapsed.is_zero() {
            anyhow::bail!("RECONNECT_MAX_ELAPSED must be greater than 0");
        }

        if self.metadata_fetch_interval < Duration::from_secs(1) {
            anyhow::bail!("METADATA_FETCH_INTERVAL must be at least 1s");
        }

        if self.stop_reaction.trim().is_empty() {
            anyhow::bail!("STOP_REACTION cannot be empty");
        }

        Ok(())
    }

    /// Retry policy handed to the reconnection coordinator.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: self.reconnect_delay,
            max_delay: self.reconnect_max_delay,
            max_elapsed: self.reconnect_max_elapsed,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the bot token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            State: {} | Streams: {}\n  \
            Reconnect: {} attempts, {} base, {} cap, {} total\n  \
            Metadata: every {} (timeout {})",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.state_file.display(),
            self.streams_file.display(),
            self.max_reconnect_attempts,
            humantime::format_duration(self.reconnect_delay),
            humantime::format_duration(self.reconnect_max_delay),
            humantime::format_duration(self.reconnect_max_elapsed),
            humantime::format_duration(self.metadata_fetch_interval),
            humantime::format_duration(self.metadata_timeout),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            state_file: data_dir.join("state.json"),
            streams_file: "streams.toml".into(),
            data_dir,

            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_max_elapsed: Duration::from_secs(300),

            metadata_fetch_interval: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(5),

            stop_reaction: "⏹️".to_string(),
        }
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => humantime::parse_duration(val.trim())
            .with_context(|| format!("{} no es una duración válida: {:?}", key, val)),
        _ => Ok(default),
    }
}

/// Serializa duraciones como texto legible ("5s", "1m 30s").
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_attempts() {
        let config = Config {
            max_reconnect_attempts: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_base_delay_above_cap() {
        let config = Config {
            reconnect_delay: Duration::from_secs(120),
            reconnect_max_delay: Duration::from_secs(60),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_token() {
        let config = Config {
            discord_token: "super-secret".to_string(),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secret"));
        assert!(summary.contains("3 attempts"));
    }

    #[test]
    fn policy_mirrors_config() {
        let policy = Config::default().reconnect_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
    }
}
