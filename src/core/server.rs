//! TCP listener and the running broker service
//!
//! [`BrokerService::start`] binds the listener, spawns the accept loop and
//! the broker loop, and returns a handle that can stop both.

use super::broker::{Broker, BrokerHandle};
use super::channel::{provider_for, ChannelError};
use super::connection::{spawn_connection, ConnectionId};
use super::event::BrokerEvent;
use super::logger::TrafficLog;
use super::registry::BrokerStats;
use crate::config::BrokerConfig;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Startup errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Channel strategy unavailable
    #[error("Channel setup failed: {0}")]
    Channel(#[from] ChannelError),

    /// Traffic log could not be opened
    #[error("Traffic log unavailable: {0}")]
    TrafficLog(#[source] io::Error),
}

impl ServerError {
    /// Underlying I/O error kind, if any
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Bind { source, .. } | Self::TrafficLog(source) => Some(source.kind()),
            Self::Channel(ChannelError::Io { source, .. }) => Some(source.kind()),
            Self::Channel(_) => None,
        }
    }
}

/// Bound listener feeding accepted sockets to the broker
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl Server {
    /// Bind `addr` (`host:port`)
    pub async fn bind(
        addr: &str,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener, events })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `stop` is cancelled. Accepted sockets are closed with it.
    pub async fn run(self, stop: CancellationToken) {
        let mut next_id = 0u64;

        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let conn = ConnectionId::new(next_id);
                    info!("{}: accepted from {}", conn, peer);
                    spawn_connection(stream, conn, self.events.clone(), &stop);
                }
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Listener closed");
    }
}

/// Listener plus broker loop, running in the background
#[derive(Debug)]
pub struct BrokerService {
    addr: SocketAddr,
    handle: BrokerHandle,
    stop: CancellationToken,
    accept_task: JoinHandle<()>,
    broker_task: JoinHandle<BrokerStats>,
}

impl BrokerService {
    /// Bind, provision the channel strategy and start both loops
    pub async fn start(config: &BrokerConfig) -> Result<Self, ServerError> {
        let provider = provider_for(&config.channel)?;
        let traffic = TrafficLog::from_config(&config.traffic_log).map_err(ServerError::TrafficLog)?;

        let (broker, handle) = Broker::new(provider, &config.timing);
        let broker = match traffic {
            Some(logger) => {
                info!("Traffic log: {}", logger.lock().path().display());
                broker.with_traffic_log(logger)
            }
            None => broker,
        };

        let server = Server::bind(&config.listen_addr(), handle.sender()).await?;
        let addr = server
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr(),
                source,
            })?;

        info!(
            "Listening on {} ({} channels, debounce {}ms, grace {}ms)",
            addr, config.channel.mode, config.timing.debounce_ms, config.timing.grace_ms
        );

        let stop = CancellationToken::new();
        let accept_task = tokio::spawn(server.run(stop.clone()));
        let broker_task = tokio::spawn(broker.run());

        Ok(Self {
            addr,
            handle,
            stop,
            accept_task,
            broker_task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, close every socket, tear down every session and wait
    /// for the loop to end
    pub async fn shutdown(self) -> BrokerStats {
        self.stop.cancel();
        if let Err(e) = self.accept_task.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        self.handle.shutdown();
        match self.broker_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Broker loop ended abnormally: {}", e);
                BrokerStats::default()
            }
        }
    }
}
