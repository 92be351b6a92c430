//! The broker event loop
//!
//! A single task drains [`BrokerEvent`]s in arrival order and applies them to
//! the [`SessionRegistry`]. Socket tasks, channel watchers and timers only
//! ever post events, so the session table has exactly one writer.

use super::channel::ChannelProvider;
use super::event::BrokerEvent;
use super::logger::Logger;
use super::registry::{BrokerStats, ConnectOutcome, SessionRegistry};
use crate::config::TimingConfig;
use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Cloneable sender side of the broker loop
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl BrokerHandle {
    /// Raw event sender, handed to connection tasks
    pub fn sender(&self) -> mpsc::UnboundedSender<BrokerEvent> {
        self.tx.clone()
    }

    /// Ask the loop to tear down every session and stop.
    /// Returns false if the loop is already gone.
    pub fn shutdown(&self) -> bool {
        self.tx.send(BrokerEvent::Shutdown).is_ok()
    }
}

/// Event loop state
#[derive(Debug)]
pub struct Broker {
    registry: SessionRegistry,
    rx: mpsc::UnboundedReceiver<BrokerEvent>,
}

impl Broker {
    /// Create a broker and the handle used to feed it
    pub fn new(provider: Box<dyn ChannelProvider>, timing: &TimingConfig) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(provider, tx.clone(), timing);
        (Self { registry, rx }, BrokerHandle { tx })
    }

    /// Record traffic to `logger`
    pub fn with_traffic_log(mut self, logger: Logger) -> Self {
        self.registry = self.registry.with_traffic_log(logger);
        self
    }

    /// Session table
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Apply one event. Breaks once the broker has shut down.
    pub async fn handle(&mut self, event: BrokerEvent) -> ControlFlow<()> {
        match event {
            BrokerEvent::Identified { link, serial } => {
                if let ConnectOutcome::Refused = self.registry.connect(&serial, link) {
                    debug!("Connection from {} refused during shutdown", serial);
                }
            }
            BrokerEvent::Payload { conn, data } => {
                self.registry.payload(conn, data).await;
            }
            BrokerEvent::Closed { conn } => {
                self.registry.disconnect(conn);
            }
            BrokerEvent::Channel { device, signal } => {
                self.registry.channel_signal(device, signal);
            }
            BrokerEvent::DebounceElapsed { device, task } => {
                self.registry.debounce_elapsed(device, task).await;
            }
            BrokerEvent::GraceElapsed { device, task } => {
                self.registry.grace_elapsed(device, task);
            }
            BrokerEvent::Shutdown => {
                self.registry.shutdown_all();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> Option<BrokerEvent> {
        self.rx.recv().await
    }

    /// Run until a shutdown event arrives; returns final counters
    pub async fn run(mut self) -> BrokerStats {
        while let Some(event) = self.rx.recv().await {
            if self.handle(event).await.is_break() {
                break;
            }
        }

        // No-op after an explicit shutdown
        self.registry.shutdown_all();

        let stats = self.registry.stats();
        info!(
            "Broker stopped: {} connection(s), {} reconnect(s), {} cleaned, {} command(s) delivered, {} undelivered, {} response(s) relayed",
            stats.connections,
            stats.reconnects,
            stats.disconnects_cleaned,
            stats.commands_delivered,
            stats.commands_undelivered,
            stats.responses_relayed
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::testing::FakeProvider;
    use crate::core::channel::ChannelSignal;
    use crate::core::connection::{ConnectionId, DeviceLink};
    use crate::core::identity::DeviceNumber;
    use crate::core::session::SessionState;
    use bytes::Bytes;
    use std::time::Duration;

    fn broker() -> (Broker, BrokerHandle, FakeProvider) {
        let provider = FakeProvider::default();
        let (broker, handle) = Broker::new(Box::new(provider.clone()), &TimingConfig::default());
        (broker, handle, provider)
    }

    /// Drain queued events, letting timers fire, for `span` of virtual time
    async fn pump(broker: &mut Broker, span: Duration) {
        let deadline = tokio::time::Instant::now() + span;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, broker.next_event()).await {
            if broker.handle(event).await.is_break() {
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lifecycle_through_events() {
        let (mut broker, handle, provider) = broker();
        let tx = handle.sender();
        let (link, mut socket) = DeviceLink::detached(ConnectionId::new(1));
        let device = DeviceNumber::new(1);

        tx.send(BrokerEvent::Identified {
            link,
            serial: "ABC123".to_string(),
        })
        .unwrap();
        pump(&mut broker, Duration::from_millis(1)).await;
        assert_eq!(broker.registry().state(device), Some(SessionState::Active));

        provider.state(1).lock().command = b"on\n".to_vec();
        provider.notifier(1).notify(ChannelSignal::Changed);
        pump(&mut broker, Duration::from_millis(50)).await;
        assert_eq!(socket.try_recv().unwrap(), Bytes::from_static(b"on\n"));

        tx.send(BrokerEvent::Payload {
            conn: ConnectionId::new(1),
            data: Bytes::from_static(b"OK\n"),
        })
        .unwrap();
        tx.send(BrokerEvent::Closed {
            conn: ConnectionId::new(1),
        })
        .unwrap();
        pump(&mut broker, Duration::from_millis(10)).await;
        assert_eq!(provider.state(1).lock().responses, b"OK\n");
        assert_eq!(
            broker.registry().state(device),
            Some(SessionState::DisconnectPending)
        );

        pump(&mut broker, Duration::from_millis(200)).await;
        assert_eq!(broker.registry().state(device), None);
        assert_eq!(provider.state(1).lock().destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_run() {
        let (broker, handle, provider) = broker();
        let (link, _socket) = DeviceLink::detached(ConnectionId::new(1));
        handle
            .sender()
            .send(BrokerEvent::Identified {
                link,
                serial: "ABC123".to_string(),
            })
            .unwrap();
        assert!(handle.shutdown());

        let stats = broker.run().await;
        assert_eq!(stats.connections, 1);
        assert_eq!(provider.state(1).lock().destroyed, 1);
        assert!(!handle.shutdown());
    }
}
