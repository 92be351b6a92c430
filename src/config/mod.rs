//! Configuration module
//!
//! Handles broker settings loaded from TOML

mod settings;

pub use settings::{
    BrokerConfig, ChannelConfig, ConfigError, LineEnding, ListenConfig, LogOutput, LoggingConfig,
    TimingConfig, TrafficLogConfig,
};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "picobridge", "Picobridge")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default config file location
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}
