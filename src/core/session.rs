//! Device session state
//!
//! A session is the stable, addressable side of a device: its channel lives
//! as long as the session, while sockets come and go underneath it.

use super::channel::ExternalChannel;
use super::connection::{ConnectionId, DeviceLink};
use super::identity::DeviceNumber;
use super::timer::{ScheduledTask, TaskId};
use std::fmt;

/// Lifecycle state of a session present in the table.
///
/// A device without a table entry is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Live socket installed
    Active,
    /// Socket closed, cleanup scheduled unless the device comes back
    DisconnectPending,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::DisconnectPending => write!(f, "disconnect-pending"),
        }
    }
}

/// One logical device
#[derive(Debug)]
pub struct Session {
    device: DeviceNumber,
    link: Option<DeviceLink>,
    channel: Box<dyn ExternalChannel>,
    grace: Option<ScheduledTask>,
    debounce: Option<ScheduledTask>,
}

impl Session {
    /// New active session owning `link` and `channel`
    pub fn new(device: DeviceNumber, link: DeviceLink, channel: Box<dyn ExternalChannel>) -> Self {
        Self {
            device,
            link: Some(link),
            channel,
            grace: None,
            debounce: None,
        }
    }

    /// Device number
    pub fn device(&self) -> DeviceNumber {
        self.device
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        if self.grace.is_some() {
            SessionState::DisconnectPending
        } else {
            SessionState::Active
        }
    }

    /// Connection currently installed, if any
    pub fn current_conn(&self) -> Option<ConnectionId> {
        self.link.as_ref().map(DeviceLink::conn)
    }

    /// Installed link
    pub fn link(&self) -> Option<&DeviceLink> {
        self.link.as_ref()
    }

    /// Channel adapter, mutable
    pub fn channel_mut(&mut self) -> &mut dyn ExternalChannel {
        self.channel.as_mut()
    }

    /// Install a new socket: revoke the old one first and abandon any
    /// pending cleanup. Returns the revoked connection, if there was one.
    pub fn replace_link(&mut self, link: DeviceLink) -> Option<ConnectionId> {
        if let Some(task) = self.grace.take() {
            task.cancel();
        }

        let previous = self.link.take().map(|old| {
            old.close();
            old.conn()
        });

        self.link = Some(link);
        previous
    }

    /// Drop the link if it belongs to `conn`. Returns true if it did.
    pub fn release_link(&mut self, conn: ConnectionId) -> bool {
        if self.current_conn() != Some(conn) {
            return false;
        }
        if let Some(old) = self.link.take() {
            old.close();
        }
        true
    }

    /// Enter the grace window
    pub fn begin_grace(&mut self, task: ScheduledTask) {
        self.grace = Some(task);
    }

    /// True if `task` is the pending grace timer
    pub fn is_grace_task(&self, task: TaskId) -> bool {
        self.grace.as_ref().is_some_and(|t| t.is(task))
    }

    /// (Re)start the debounce window, cancelling the previous one
    pub fn restart_debounce(&mut self, task: ScheduledTask) {
        if let Some(previous) = self.debounce.replace(task) {
            previous.cancel();
        }
    }

    /// Consume the debounce timer if `task` is the current one
    pub fn take_debounce(&mut self, task: TaskId) -> bool {
        if self.debounce.as_ref().is_some_and(|t| t.is(task)) {
            self.debounce = None;
            true
        } else {
            false
        }
    }

    /// Cancel timers and force-close the socket. The channel is left alone.
    pub fn disarm(&mut self) {
        if let Some(task) = self.grace.take() {
            task.cancel();
        }
        if let Some(task) = self.debounce.take() {
            task.cancel();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    /// Disarm, then destroy the channel. Consumes the session.
    pub fn teardown(mut self) -> Result<(), super::channel::ChannelError> {
        self.disarm();
        self.channel.destroy()
    }
}
