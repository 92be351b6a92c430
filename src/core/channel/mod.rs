//! External channel adapters
//!
//! A channel is the per-device conduit other processes use to talk to a
//! device session. Two deployment-wide strategies exist:
//! - File pair: a watched command file plus a response file
//! - Pty: a pseudo-terminal exposed through a symlink (Unix only)

mod file_pair;
#[cfg(unix)]
mod pty;
#[cfg(test)]
pub(crate) mod testing;

pub use file_pair::{file_pair_paths, FilePairChannel, FilePairProvider};
#[cfg(unix)]
pub use pty::{pty_link_path, PtyChannel, PtyProvider};

use super::event::BrokerEvent;
use super::identity::DeviceNumber;
use crate::config::ChannelConfig;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel strategy, chosen once per deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Command file + response file
    #[default]
    Files,
    /// Pseudo-terminal behind a symlink
    Pty,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Files => write!(f, "files"),
            Self::Pty => write!(f, "pty"),
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "files" | "file" | "pipe" => Ok(Self::Files),
            "pty" => Ok(Self::Pty),
            other => Err(format!("unknown channel mode: {}", other)),
        }
    }
}

/// Edge-triggered notification from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    /// Command content may have changed; read it after the debounce window
    Changed,
    /// Operator bytes to forward to the device as-is
    Input(Bytes),
}

/// Channel error types
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Filesystem or device I/O failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Change watcher could not be installed
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Pseudo-terminal allocation failed
    #[error("PTY error: {0}")]
    Pty(String),

    /// Strategy not available on this platform
    #[error("Unsupported channel: {0}")]
    Unsupported(String),
}

impl ChannelError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Posts channel signals for one device into the broker loop
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    device: DeviceNumber,
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl ChannelNotifier {
    /// Create a notifier for `device`
    pub fn new(device: DeviceNumber, tx: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self { device, tx }
    }

    /// Device this notifier reports for
    pub fn device(&self) -> DeviceNumber {
        self.device
    }

    /// Post a signal; false once the broker loop is gone
    pub fn notify(&self, signal: ChannelSignal) -> bool {
        self.tx
            .send(BrokerEvent::Channel {
                device: self.device,
                signal,
            })
            .is_ok()
    }
}

/// Per-device adapter resource
#[async_trait]
pub trait ExternalChannel: Send + fmt::Debug {
    /// Strategy of this channel
    fn kind(&self) -> ChannelKind;

    /// Human-readable location (paths) for logs
    fn describe(&self) -> String;

    /// Full pending command content (empty if none)
    async fn read_command(&mut self) -> Result<Bytes, ChannelError>;

    /// Acknowledge consumption by truncating the command side
    async fn clear_command(&mut self) -> Result<(), ChannelError>;

    /// Deliver device bytes to the response side
    async fn write_response(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Remove every external trace of the channel. Must be idempotent.
    fn destroy(&mut self) -> Result<(), ChannelError>;
}

/// Creates channels for newly seen devices
#[cfg_attr(test, mockall::automock)]
pub trait ChannelProvider: Send {
    /// Strategy this provider creates
    fn kind(&self) -> ChannelKind;

    /// Provision the resource for `device`, reporting changes via `notifier`
    fn provision(
        &self,
        device: DeviceNumber,
        notifier: ChannelNotifier,
    ) -> Result<Box<dyn ExternalChannel>, ChannelError>;
}

impl fmt::Debug for dyn ChannelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelProvider({})", self.kind())
    }
}

/// Build the provider selected by configuration
pub fn provider_for(config: &ChannelConfig) -> Result<Box<dyn ChannelProvider>, ChannelError> {
    match config.mode {
        ChannelKind::Files => Ok(Box::new(FilePairProvider::new(config.directory.clone()))),
        #[cfg(unix)]
        ChannelKind::Pty => Ok(Box::new(PtyProvider::new(
            config.symlink_directory.clone(),
            config.pty_line_ending,
        ))),
        #[cfg(not(unix))]
        ChannelKind::Pty => Err(ChannelError::Unsupported(
            "PTY not supported on this platform".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!("files".parse::<ChannelKind>(), Ok(ChannelKind::Files));
        assert_eq!("PTY".parse::<ChannelKind>(), Ok(ChannelKind::Pty));
        assert!("serial".parse::<ChannelKind>().is_err());
        assert_eq!(ChannelKind::Pty.to_string(), "pty");
    }

    #[test]
    fn test_notifier_posts_channel_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = ChannelNotifier::new(DeviceNumber::new(4), tx);

        assert!(notifier.notify(ChannelSignal::Changed));
        match rx.try_recv().unwrap() {
            BrokerEvent::Channel { device, signal } => {
                assert_eq!(device, DeviceNumber::new(4));
                assert_eq!(signal, ChannelSignal::Changed);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        drop(rx);
        assert!(!notifier.notify(ChannelSignal::Changed));
    }
}
