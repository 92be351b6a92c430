//! # Picobridge Core Library
//!
//! A broker that keeps persistent TCP connections from embedded devices and
//! exposes each device to local processes through a stable channel:
//! - File pair: write a command file, read a response file
//! - Pty: a pseudo-terminal behind a `pico<N>` symlink
//!
//! Devices identify with a `pico_<serial>` handshake and get a small number
//! that stays fixed for the life of the process. Short disconnects within the
//! grace window are invisible to channel users.
//!
//! ## Example
//!
//! ```rust,no_run
//! use picobridge_core::{BrokerConfig, BrokerService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BrokerConfig::default();
//!     let service = BrokerService::start(&config).await?;
//!     println!("listening on {}", service.local_addr());
//!
//!     tokio::signal::ctrl_c().await?;
//!     let stats = service.shutdown().await;
//!     println!("{} command(s) delivered", stats.commands_delivered);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{BrokerConfig, ChannelConfig, ConfigError, LineEnding, TimingConfig};
pub use crate::core::broker::{Broker, BrokerHandle};
pub use crate::core::channel::{ChannelKind, ChannelProvider, ExternalChannel};
pub use crate::core::identity::DeviceNumber;
pub use crate::core::registry::{BrokerStats, SessionRegistry};
pub use crate::core::server::{BrokerService, ServerError};
pub use crate::core::session::SessionState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
