//! Events consumed by the broker loop

use super::channel::ChannelSignal;
use super::connection::{ConnectionId, DeviceLink};
use super::identity::DeviceNumber;
use super::timer::TaskId;
use bytes::Bytes;

/// Everything the broker reacts to, in arrival order
#[derive(Debug)]
pub enum BrokerEvent {
    /// A connection presented `pico_<serial>`
    Identified {
        /// Writable handle of the identifying connection
        link: DeviceLink,
        /// Sanitized serial
        serial: String,
    },
    /// Bytes read from an identified connection
    Payload {
        /// Source connection
        conn: ConnectionId,
        /// Raw chunk
        data: Bytes,
    },
    /// Reader side of a connection ended (EOF, error or revoked)
    Closed {
        /// Connection that went away
        conn: ConnectionId,
    },
    /// Notification from a session's external channel
    Channel {
        /// Owning device
        device: DeviceNumber,
        /// What happened
        signal: ChannelSignal,
    },
    /// Debounce window for a device elapsed
    DebounceElapsed {
        /// Owning device
        device: DeviceNumber,
        /// Timer that fired
        task: TaskId,
    },
    /// Disconnect grace window for a device elapsed
    GraceElapsed {
        /// Owning device
        device: DeviceNumber,
        /// Timer that fired
        task: TaskId,
    },
    /// Tear everything down and stop the loop
    Shutdown,
}
