//! Configuration management for the termrelay host.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termrelay/config.toml`.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::ShrinkKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::passphrase::DicewareAuthority;
use crate::pipeline::PipelineOptions;
use crate::session;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_clients must be between 2 and 33 (owner included), got {0}")]
    InvalidMaxClients(usize),

    #[error("passphrase_words must be between 1 and 16, got {0}")]
    InvalidPassphraseWords(usize),

    #[error("hash_cost must be between 4 and 31, got {0}")]
    InvalidHashCost(u32),

    #[error("{name} must be greater than 0")]
    ZeroDuration { name: &'static str },

    #[error("consumer_queue must be greater than 0")]
    InvalidConsumerQueue,

    #[error("bind_host is not an IP address: {0}")]
    InvalidBindHost(String),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 42024;

/// Main configuration structure for the termrelay host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging and data directory.
    pub daemon: DaemonConfig,

    /// Listener address.
    pub network: NetworkConfig,

    /// Shared-session settings.
    pub session: SessionConfig,

    /// Passphrase settings.
    pub security: SecurityConfig,

    /// Network timeouts.
    pub timeouts: TimeoutConfig,

    /// Broadcast pipeline tuning.
    pub pipeline: PipelineConfig,
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for log files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind.
    pub bind_host: String,

    /// TCP port to listen on.
    pub port: u16,
}

/// Shared-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Display name of the operator.
    pub owner: String,

    /// Maximum participants, the owner included.
    pub max_clients: usize,

    /// Shell to share.
    pub shell: String,

    /// Expected spacing of viewer heartbeats, in seconds.
    pub heartbeat_interval_secs: u64,
}

/// Passphrase configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Words per generated passphrase.
    pub passphrase_words: usize,

    /// bcrypt cost factor.
    pub hash_cost: u32,

    /// Seconds between passphrase rotations.
    pub rotation_interval_secs: u64,
}

/// Timeouts, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on each handshake round.
    pub auth_timeout_secs: u64,

    /// Bound on refusal and farewell frames.
    pub kick_timeout_secs: u64,

    /// Bound on each broadcast write to a viewer.
    pub broadcast_write_timeout_secs: u64,

    /// Bound on the whole shutdown sequence.
    pub shutdown_timeout_secs: u64,
}

/// Broadcast pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Codec applied to terminal output before it is sent.
    pub shrink: ShrinkKind,

    /// Frames queued per viewer before it is dropped as too slow.
    pub consumer_queue: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            max_clients: 9,
            shell: default_shell(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            passphrase_words: 6,
            hash_cost: bcrypt::DEFAULT_COST,
            rotation_interval_secs: 300, // 5 minutes
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 60,
            kick_timeout_secs: 30,
            broadcast_write_timeout_secs: 10,
            shutdown_timeout_secs: 60,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shrink: ShrinkKind::None,
            consumer_queue: 256,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
}

/// Returns the user's shell, falling back to `/bin/sh`.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn default_owner() -> String {
    std::env::var("USER")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "host".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMRELAY_PORT: Override the listening port
    /// - TERMRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("TERMRELAY_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!(port, "Overriding port from environment");
                        self.network.port = port;
                    }
                    Err(_) => tracing::warn!(value = %port, "Ignoring invalid TERMRELAY_PORT"),
                }
            }
        }

        if let Ok(level) = std::env::var("TERMRELAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!(level = %level, "Overriding log_level from environment");
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=33).contains(&self.session.max_clients) {
            return Err(ConfigError::InvalidMaxClients(self.session.max_clients));
        }

        if !(1..=16).contains(&self.security.passphrase_words) {
            return Err(ConfigError::InvalidPassphraseWords(self.security.passphrase_words));
        }

        if !(4..=31).contains(&self.security.hash_cost) {
            return Err(ConfigError::InvalidHashCost(self.security.hash_cost));
        }

        let durations = [
            ("heartbeat_interval_secs", self.session.heartbeat_interval_secs),
            ("rotation_interval_secs", self.security.rotation_interval_secs),
            ("auth_timeout_secs", self.timeouts.auth_timeout_secs),
            ("kick_timeout_secs", self.timeouts.kick_timeout_secs),
            ("broadcast_write_timeout_secs", self.timeouts.broadcast_write_timeout_secs),
            ("shutdown_timeout_secs", self.timeouts.shutdown_timeout_secs),
        ];
        if let Some(&(name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::ZeroDuration { name });
        }

        if self.pipeline.consumer_queue == 0 {
            return Err(ConfigError::InvalidConsumerQueue);
        }

        if self.network.bind_host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidBindHost(self.network.bind_host.clone()));
        }

        let shell_path = Path::new(&self.session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
            }
        } else if which::which(&self.session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// The listener address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .network
            .bind_host
            .parse()
            .map_err(|_| ConfigError::InvalidBindHost(self.network.bind_host.clone()))?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    /// Runtime session settings derived from this configuration.
    pub fn session_config(&self) -> Result<session::SessionConfig, ConfigError> {
        Ok(session::SessionConfig {
            bind_addr: self.bind_addr()?,
            owner: self.session.owner.clone(),
            max_clients: self.session.max_clients,
            rotation_interval: Duration::from_secs(self.security.rotation_interval_secs),
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs),
            auth_timeout: Duration::from_secs(self.timeouts.auth_timeout_secs),
            kick_timeout: Duration::from_secs(self.timeouts.kick_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.timeouts.shutdown_timeout_secs),
            pipeline: PipelineOptions {
                queue_depth: self.pipeline.consumer_queue,
                write_timeout: Duration::from_secs(self.timeouts.broadcast_write_timeout_secs),
                shrink: self.pipeline.shrink,
            },
        })
    }

    /// The passphrase authority described by `[security]`.
    pub fn authority(&self) -> DicewareAuthority {
        DicewareAuthority::new(self.security.passphrase_words, self.security.hash_cost)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid() -> Config {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.network.bind_host, "0.0.0.0");
        assert_eq!(config.network.port, 42024);
        assert_eq!(config.session.max_clients, 9);
        assert_eq!(config.session.heartbeat_interval_secs, 30);
        assert_eq!(config.security.passphrase_words, 6);
        assert_eq!(config.security.hash_cost, 12);
        assert_eq!(config.security.rotation_interval_secs, 300);
        assert_eq!(config.timeouts.auth_timeout_secs, 60);
        assert_eq!(config.timeouts.kick_timeout_secs, 30);
        assert_eq!(config.timeouts.broadcast_write_timeout_secs, 10);
        assert_eq!(config.timeouts.shutdown_timeout_secs, 60);
        assert_eq!(config.pipeline.shrink, ShrinkKind::None);
        assert_eq!(config.pipeline.consumer_queue, 256);
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("termrelay"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
max_clients = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.max_clients, 5);
        assert_eq!(config.network.port, DEFAULT_PORT);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[network]
bind_host = "127.0.0.1"
port = 4000

[session]
owner = "ops"
max_clients = 4
shell = "/bin/zsh"
heartbeat_interval_secs = 10

[security]
passphrase_words = 4
hash_cost = 10
rotation_interval_secs = 60

[timeouts]
auth_timeout_secs = 20
kick_timeout_secs = 5
broadcast_write_timeout_secs = 3
shutdown_timeout_secs = 15

[pipeline]
shrink = "lz4"
consumer_queue = 64
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.network.bind_host, "127.0.0.1");
        assert_eq!(config.network.port, 4000);
        assert_eq!(config.session.owner, "ops");
        assert_eq!(config.session.shell, "/bin/zsh");
        assert_eq!(config.security.hash_cost, 10);
        assert_eq!(config.timeouts.kick_timeout_secs, 5);
        assert_eq!(config.pipeline.shrink, ShrinkKind::Lz4);
        assert_eq!(config.pipeline.consumer_queue, 64);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[daemon\nlog_level = \"debug\"\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_unknown_shrink() {
        let result = Config::from_toml("[pipeline]\nshrink = \"zstd\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip() {
        let original = Config::default();
        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[timeouts]"));
        assert!(toml.contains("[pipeline]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.session.max_clients = 15;
        original.pipeline.shrink = ShrinkKind::Lz4;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termrelay"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_port_and_log_level() {
        std::env::set_var("TERMRELAY_PORT", "5555");
        std::env::set_var("TERMRELAY_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("TERMRELAY_PORT");
        std::env::remove_var("TERMRELAY_LOG_LEVEL");

        assert_eq!(config.network.port, 5555);
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        std::env::set_var("TERMRELAY_PORT", "not-a-port");
        std::env::remove_var("TERMRELAY_LOG_LEVEL");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("TERMRELAY_PORT");

        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TERMRELAY_PORT", "");
        std::env::set_var("TERMRELAY_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("TERMRELAY_PORT");
        std::env::remove_var("TERMRELAY_LOG_LEVEL");

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_max_clients_bounds() {
        let mut config = valid();
        config.session.max_clients = 1;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxClients(1)));

        config.session.max_clients = 34;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxClients(34)));

        config.session.max_clients = 2;
        assert!(config.validate().is_ok());
        config.session.max_clients = 33;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_security_bounds() {
        let mut config = valid();
        config.security.passphrase_words = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPassphraseWords(0)));

        let mut config = valid();
        config.security.hash_cost = 3;
        assert_eq!(config.validate(), Err(ConfigError::InvalidHashCost(3)));

        let mut config = valid();
        config.security.rotation_interval_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                name: "rotation_interval_secs"
            })
        );
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = valid();
        config.timeouts.kick_timeout_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration {
                name: "kick_timeout_secs"
            })
        );
    }

    #[test]
    fn test_validate_consumer_queue() {
        let mut config = valid();
        config.pipeline.consumer_queue = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConsumerQueue));
    }

    #[test]
    fn test_validate_bind_host() {
        let mut config = valid();
        config.network.bind_host = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindHost("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid();
        config.session.shell = "/nonexistent/shell".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidShellPath(_))));

        config.session.shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.session.shell = "definitely-not-a-shell-xyz".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidShellPath(_))));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_session_config_conversion() {
        let mut config = valid();
        config.network.bind_host = "127.0.0.1".to_string();
        config.network.port = 4100;
        config.timeouts.broadcast_write_timeout_secs = 7;

        let session = config.session_config().unwrap();
        assert_eq!(session.bind_addr, "127.0.0.1:4100".parse().unwrap());
        assert_eq!(session.max_clients, 9);
        assert_eq!(session.pipeline.write_timeout, Duration::from_secs(7));
        assert_eq!(session.pipeline.queue_depth, 256);
        assert_eq!(session.rotation_interval, Duration::from_secs(300));
    }
}
