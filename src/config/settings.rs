//! Broker settings

use crate::core::channel::ChannelKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },

    /// Config could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Value out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level broker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// TCP listener
    pub listen: ListenConfig,
    /// External channel strategy
    pub channel: ChannelConfig,
    /// Debounce and grace windows
    pub timing: TimingConfig,
    /// Diagnostic logging
    pub logging: LoggingConfig,
    /// Command/response traffic log
    pub traffic_log: TrafficLogConfig,
}

impl BrokerConfig {
    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        match super::config_file() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Render as pretty TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the broker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.port == 0 {
            return Err(ConfigError::Invalid("listen.port must not be 0".to_string()));
        }
        if self.listen.host.trim().is_empty() {
            return Err(ConfigError::Invalid("listen.host must not be empty".to_string()));
        }
        if self.timing.debounce_ms == 0 {
            return Err(ConfigError::Invalid("timing.debounce_ms must be positive".to_string()));
        }
        if self.timing.grace_ms == 0 {
            return Err(ConfigError::Invalid("timing.grace_ms must be positive".to_string()));
        }
        if self.channel.directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("channel.directory must not be empty".to_string()));
        }
        if self.channel.symlink_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "channel.symlink_directory must not be empty".to_string(),
            ));
        }
        if self.traffic_log.enabled && self.traffic_log.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("traffic_log.path must not be empty".to_string()));
        }
        Ok(())
    }

    /// Listener address as `host:port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.host, self.listen.port)
    }
}

/// TCP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address
    pub host: String,
    /// Port devices connect to
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50000,
        }
    }
}

/// External channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Strategy used for every device
    pub mode: ChannelKind,
    /// Directory for command/response files
    pub directory: PathBuf,
    /// Directory for pty symlinks
    pub symlink_directory: PathBuf,
    /// Terminator appended to device lines written to a pty
    pub pty_line_ending: LineEnding,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: ChannelKind::Files,
            directory: PathBuf::from("/tmp"),
            symlink_directory: PathBuf::from("/tmp"),
            pty_line_ending: LineEnding::Cr,
        }
    }
}

/// Line ending type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// Carriage Return only
    #[default]
    Cr,
    /// Line Feed only
    Lf,
    /// Both CR and LF
    CrLf,
}

impl LineEnding {
    /// Get the byte sequence for this line ending
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }
}

/// Debounce and grace windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Quiet period after the last command-file change before flushing
    pub debounce_ms: u64,
    /// Delay between socket close and session cleanup
    pub grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 20,
            grace_ms: 100,
        }
    }
}

impl TimingConfig {
    /// Debounce window
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Grace window
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Diagnostic log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Diagnostic logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (RUST_LOG wins if set)
    pub level: String,
    /// Output format
    pub format: LogOutput,
    /// Also write daily-rotated files here
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogOutput::Text,
            directory: None,
        }
    }
}

/// Command/response traffic log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficLogConfig {
    /// Record traffic
    pub enabled: bool,
    /// Log file
    pub path: PathBuf,
    /// Truncate once the file grows past this size
    pub max_size_mb: u64,
}

impl Default for TrafficLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("/tmp/picobridge.log"),
            max_size_mb: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr(), "0.0.0.0:50000");
        assert_eq!(config.timing.grace(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: BrokerConfig = toml::from_str(
            r#"
            [listen]
            port = 5000

            [channel]
            mode = "pty"
            symlink_directory = "/home/project"
            pty_line_ending = "crlf"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port, 5000);
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.channel.mode, ChannelKind::Pty);
        assert_eq!(config.channel.pty_line_ending, LineEnding::CrLf);
        assert_eq!(config.channel.directory, PathBuf::from("/tmp"));
        assert_eq!(config.timing.debounce_ms, 20);
    }

    #[test]
    fn test_validate_rejects_zero_timing() {
        let mut config = BrokerConfig::default();
        config.timing.grace_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = BrokerConfig::default();
        config.listen.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = BrokerConfig::default();
        config.traffic_log.enabled = true;
        config.logging.format = LogOutput::Json;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        assert_eq!(BrokerConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[listen]\nport = \"nope\"\n").unwrap();

        assert!(matches!(
            BrokerConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
