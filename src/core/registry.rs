//! Session table and lifecycle controller
//!
//! Owns every session and applies connect, disconnect, grace expiry and
//! shutdown transitions. All calls come from the single broker loop, so no
//! locking is needed; stale timer expiries and closes of replaced sockets
//! are recognised by id and ignored.

use super::channel::{ChannelNotifier, ChannelProvider, ChannelSignal};
use super::connection::{ConnectionId, DeviceLink};
use super::dispatcher::{self, FlushOutcome};
use super::event::BrokerEvent;
use super::identity::{DeviceNumber, IdentityResolver};
use super::logger::Logger;
use super::relay;
use super::session::{Session, SessionState};
use super::timer::{Scheduler, TaskId};
use crate::config::TimingConfig;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Counters reported when the broker stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Identified connections accepted
    pub connections: u64,
    /// Connections that replaced a live or pending socket
    pub reconnects: u64,
    /// Sessions removed after their grace window
    pub disconnects_cleaned: u64,
    /// Commands written to a device socket
    pub commands_delivered: u64,
    /// Commands left in place for lack of a writable socket
    pub commands_undelivered: u64,
    /// Device chunks written to a channel
    pub responses_relayed: u64,
}

/// What happened to an identified connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// New session with a freshly provisioned channel
    Created(DeviceNumber),
    /// Existing session took over the new socket
    Reconnected(DeviceNumber),
    /// Channel could not be provisioned; socket closed
    ProvisionFailed(DeviceNumber),
    /// Broker is shutting down; socket closed
    Refused,
}

/// What a socket close did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Session entered its grace window
    GraceStarted(DeviceNumber),
    /// Connection no longer current for any session
    Stale,
}

/// Session table plus everything needed to drive transitions
#[derive(Debug)]
pub struct SessionRegistry {
    identities: IdentityResolver,
    sessions: HashMap<DeviceNumber, Session>,
    connections: HashMap<ConnectionId, DeviceNumber>,
    provider: Box<dyn ChannelProvider>,
    scheduler: Scheduler<BrokerEvent>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    debounce: Duration,
    grace: Duration,
    traffic: Option<Logger>,
    stats: BrokerStats,
    shut_down: bool,
}

impl SessionRegistry {
    /// Create an empty registry; timers and channel signals post into `events`
    pub fn new(
        provider: Box<dyn ChannelProvider>,
        events: mpsc::UnboundedSender<BrokerEvent>,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            identities: IdentityResolver::new(),
            sessions: HashMap::new(),
            connections: HashMap::new(),
            provider,
            scheduler: Scheduler::new(events.clone()),
            events,
            debounce: timing.debounce(),
            grace: timing.grace(),
            traffic: None,
            stats: BrokerStats::default(),
            shut_down: false,
        }
    }

    /// Record delivered commands and relayed responses to `logger`
    pub fn with_traffic_log(mut self, logger: Logger) -> Self {
        self.traffic = Some(logger);
        self
    }

    /// Device number for `serial`, allocating one on first sight
    pub fn resolve(&mut self, serial: &str) -> DeviceNumber {
        self.identities.resolve(serial)
    }

    /// Session for `device`, if present
    pub fn session(&self, device: DeviceNumber) -> Option<&Session> {
        self.sessions.get(&device)
    }

    /// State of `device`; `None` means absent
    pub fn state(&self, device: DeviceNumber) -> Option<SessionState> {
        self.sessions.get(&device).map(Session::state)
    }

    /// Device a connection currently serves
    pub fn device_for(&self, conn: ConnectionId) -> Option<DeviceNumber> {
        self.connections.get(&conn).copied()
    }

    /// Number of present sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if no session is present
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Counters so far
    pub fn stats(&self) -> BrokerStats {
        self.stats
    }

    /// Install an identified socket for its device
    pub fn connect(&mut self, serial: &str, link: DeviceLink) -> ConnectOutcome {
        if self.shut_down {
            link.close();
            return ConnectOutcome::Refused;
        }

        let device = self.resolve(serial);
        let conn = link.conn();

        if let Some(session) = self.sessions.get_mut(&device) {
            let pending = session.state() == SessionState::DisconnectPending;
            if let Some(previous) = session.replace_link(link) {
                debug!("Pico {}: revoked {}", device, previous);
                self.connections.remove(&previous);
            }
            self.connections.insert(conn, device);
            self.stats.connections += 1;
            self.stats.reconnects += 1;

            info!(
                "Pico {} ({}) reconnected on {}{}",
                device,
                serial,
                conn,
                if pending { ", cleanup cancelled" } else { "" }
            );
            self.note(device, "reconnected");
            return ConnectOutcome::Reconnected(device);
        }

        let notifier = ChannelNotifier::new(device, self.events.clone());
        match self.provider.provision(device, notifier) {
            Ok(channel) => {
                info!(
                    "Pico {} ({}) connected on {}, channel {}",
                    device,
                    serial,
                    conn,
                    channel.describe()
                );
                self.sessions
                    .insert(device, Session::new(device, link, channel));
                self.connections.insert(conn, device);
                self.stats.connections += 1;
                self.note(device, "connected");
                ConnectOutcome::Created(device)
            }
            Err(e) => {
                error!("Pico {}: channel provisioning failed: {}", device, e);
                link.close();
                ConnectOutcome::ProvisionFailed(device)
            }
        }
    }

    /// React to a socket going away
    pub fn disconnect(&mut self, conn: ConnectionId) -> DisconnectOutcome {
        let Some(device) = self.connections.remove(&conn) else {
            debug!("{}: close of a replaced or unknown connection ignored", conn);
            return DisconnectOutcome::Stale;
        };

        let Some(session) = self.sessions.get_mut(&device) else {
            return DisconnectOutcome::Stale;
        };

        if !session.release_link(conn) {
            debug!("Pico {}: close of stale {} ignored", device, conn);
            return DisconnectOutcome::Stale;
        }

        let task = self
            .scheduler
            .schedule(self.grace, move |task| BrokerEvent::GraceElapsed { device, task });
        session.begin_grace(task);

        info!(
            "Pico {} disconnected, cleanup in {}ms",
            device,
            self.grace.as_millis()
        );
        self.note(device, "disconnected");
        DisconnectOutcome::GraceStarted(device)
    }

    /// Grace timer fired. Returns true if the session was cleaned up.
    pub fn grace_elapsed(&mut self, device: DeviceNumber, task: TaskId) -> bool {
        let Some(session) = self.sessions.get(&device) else {
            return false;
        };

        if !session.is_grace_task(task) || session.link().is_some() {
            debug!("Pico {}: stale grace expiry {} ignored", device, task);
            return false;
        }

        let Some(session) = self.sessions.remove(&device) else {
            return false;
        };
        match session.teardown() {
            Ok(()) => info!("Pico {} cleaned up", device),
            Err(e) => warn!("Pico {} cleanup incomplete: {}", device, e),
        }
        self.stats.disconnects_cleaned += 1;
        self.note(device, "cleaned up");
        true
    }

    /// Route a channel signal to its session
    pub fn channel_signal(&mut self, device: DeviceNumber, signal: ChannelSignal) {
        let Some(session) = self.sessions.get_mut(&device) else {
            debug!("Pico {}: signal for absent session ignored", device);
            return;
        };

        match signal {
            ChannelSignal::Changed => {
                dispatcher::on_change(session, &mut self.scheduler, self.debounce);
            }
            ChannelSignal::Input(data) => {
                if dispatcher::deliver(session, data.clone()) {
                    self.stats.commands_delivered += 1;
                    self.log_command(device, &data);
                } else {
                    debug!("Pico {}: no socket, {} input bytes dropped", device, data.len());
                    self.stats.commands_undelivered += 1;
                }
            }
        }
    }

    /// Debounce timer fired; flush the pending command if it is still current
    pub async fn debounce_elapsed(&mut self, device: DeviceNumber, task: TaskId) -> FlushOutcome {
        let Some(session) = self.sessions.get_mut(&device) else {
            return FlushOutcome::Empty;
        };

        if !session.take_debounce(task) {
            debug!("Pico {}: stale debounce expiry {} ignored", device, task);
            return FlushOutcome::Empty;
        }

        let outcome = dispatcher::flush(session).await;
        match &outcome {
            FlushOutcome::Delivered(data) => {
                debug!("Pico {}: delivered {} command bytes", device, data.len());
                self.stats.commands_delivered += 1;
                self.log_command(device, data);
            }
            FlushOutcome::Undelivered => self.stats.commands_undelivered += 1,
            FlushOutcome::Empty | FlushOutcome::Failed => {}
        }
        outcome
    }

    /// Bytes arrived from a connection. Returns true if they were relayed.
    pub async fn payload(&mut self, conn: ConnectionId, data: Bytes) -> bool {
        let Some(device) = self.connections.get(&conn).copied() else {
            debug!("{}: payload from replaced connection dropped", conn);
            return false;
        };
        let Some(session) = self.sessions.get_mut(&device) else {
            return false;
        };

        if !relay::forward(session, &data).await {
            return false;
        }
        self.stats.responses_relayed += 1;
        if let Some(traffic) = &self.traffic {
            traffic.lock().log_response(device, &data);
        }
        true
    }

    /// Tear down every session. Idempotent; returns how many were removed.
    pub fn shutdown_all(&mut self) -> usize {
        if !self.shut_down {
            info!("Shutting down {} session(s)", self.sessions.len());
        }
        self.shut_down = true;

        let mut removed = 0;
        for (device, session) in self.sessions.drain() {
            if let Err(e) = session.teardown() {
                warn!("Pico {} cleanup incomplete: {}", device, e);
            }
            removed += 1;
        }
        self.connections.clear();
        removed
    }

    fn log_command(&self, device: DeviceNumber, data: &[u8]) {
        if let Some(traffic) = &self.traffic {
            traffic.lock().log_command(device, data);
        }
    }

    fn note(&self, device: DeviceNumber, message: &str) {
        if let Some(traffic) = &self.traffic {
            traffic.lock().log_info(device, message);
        }
    }
}
