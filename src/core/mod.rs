//! Core module containing the broker
//!
//! This module provides:
//! - Device handshake and identity resolution
//! - Per-socket reader/writer tasks with revocable links
//! - Session lifecycle with a disconnect grace window
//! - Debounced command dispatch and response relay
//! - External channel adapters (file pair, pty)
//! - Traffic logging

pub mod broker;
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod handshake;
pub mod identity;
pub mod logger;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod timer;
