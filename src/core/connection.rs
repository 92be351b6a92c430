//! Per-socket tasks and the revocable device link
//!
//! Every accepted socket gets a reader task (handshake + payload forwarding)
//! and a writer task fed through an unbounded queue. The broker never touches
//! the socket directly: it holds a [`DeviceLink`], which can queue bytes for
//! the writer or force-close both tasks.

use super::event::BrokerEvent;
use super::handshake::{ChunkOutcome, Handshake};
use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity of one accepted socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Link already closed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Link {0} is closed")]
pub struct LinkClosed(pub ConnectionId);

/// Handle to a live device socket
#[derive(Debug)]
pub struct DeviceLink {
    conn: ConnectionId,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl DeviceLink {
    /// Build a link from its parts
    pub fn new(
        conn: ConnectionId,
        peer: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            peer,
            tx,
            cancel,
        }
    }

    /// A link with no socket behind it; writes land in the returned receiver
    pub fn detached(conn: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(conn, None, tx, CancellationToken::new()), rx)
    }

    /// Connection this link belongs to
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    /// Remote address, if known
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// True while the writer side can still accept bytes
    pub fn is_writable(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Queue bytes for the socket
    pub fn send(&self, data: Bytes) -> Result<(), LinkClosed> {
        if !self.is_writable() {
            return Err(LinkClosed(self.conn));
        }
        self.tx.send(data).map_err(|_| LinkClosed(self.conn))
    }

    /// Force-close the socket; idempotent
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// True once [`close`](Self::close) was called or the socket went down
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Spawn reader and writer tasks for an accepted socket.
///
/// Cancelling `parent` closes the socket, identified or not.
pub fn spawn_connection(
    stream: TcpStream,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<BrokerEvent>,
    parent: &CancellationToken,
) {
    let peer = stream.peer_addr().ok();

    // Lower latency for short command lines
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{}: set_nodelay failed: {}", conn, e);
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = parent.child_token();
    let link = DeviceLink::new(conn, peer, tx, cancel.clone());

    tokio::spawn(write_loop(conn, write_half, rx, cancel.clone()));
    tokio::spawn(read_loop(conn, read_half, link, events, cancel));
}

async fn write_loop(
    conn: ConnectionId,
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = rx.recv() => data,
        };

        let Some(data) = data else { break };

        let written = async {
            socket.write_all(&data).await?;
            socket.flush().await
        };
        if let Err(e) = written.await {
            warn!("{}: write failed: {}", conn, e);
            cancel.cancel();
            break;
        }
    }

    socket.shutdown().await.ok();
}

async fn read_loop(
    conn: ConnectionId,
    socket: OwnedReadHalf,
    link: DeviceLink,
    events: mpsc::UnboundedSender<BrokerEvent>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(socket, BytesCodec::new());
    let mut handshake = Handshake::default();
    let mut pending = Some(link);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{}: revoked", conn);
                break;
            }
            frame = frames.next() => frame,
        };

        let chunk = match frame {
            Some(Ok(chunk)) => chunk.freeze(),
            Some(Err(e)) => {
                warn!("{}: read failed: {}", conn, e);
                break;
            }
            None => break,
        };

        match handshake.feed(chunk) {
            ChunkOutcome::Ignored => {
                debug!("{}: ignoring chunk before handshake", conn);
            }
            ChunkOutcome::Identified(serial) => {
                let Some(link) = pending.take() else { continue };
                info!(
                    "{}: identified as {} from {}",
                    conn,
                    serial,
                    link.peer().map_or_else(|| "?".to_string(), |p| p.to_string())
                );
                if events.send(BrokerEvent::Identified { link, serial }).is_err() {
                    break;
                }
            }
            ChunkOutcome::Payload(data) => {
                if events.send(BrokerEvent::Payload { conn, data }).is_err() {
                    break;
                }
            }
        }
    }

    cancel.cancel();

    // Unidentified connections were never known to the broker
    if handshake.is_identified() {
        let _ = events.send(BrokerEvent::Closed { conn });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_link_send_and_close() {
        let (link, mut rx) = DeviceLink::detached(ConnectionId::new(1));
        assert!(link.is_writable());

        tokio_test::assert_ok!(link.send(Bytes::from_static(b"on\n")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"on\n"));

        link.close();
        link.close();
        assert!(!link.is_writable());
        assert_eq!(
            link.send(Bytes::from_static(b"x")),
            Err(LinkClosed(ConnectionId::new(1)))
        );
    }

    #[test]
    fn test_link_not_writable_when_receiver_dropped() {
        let (link, rx) = DeviceLink::detached(ConnectionId::new(2));
        drop(rx);
        assert!(!link.is_writable());
        assert!(!link.is_closed());
        tokio_test::assert_err!(link.send(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_socket_handshake_and_payload() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        spawn_connection(server_side, ConnectionId::new(9), events_tx, &CancellationToken::new());

        client.write_all(b"noise").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.write_all(b"pico_XYZ").await.unwrap();

        let link = match events.recv().await.unwrap() {
            BrokerEvent::Identified { link, serial } => {
                assert_eq!(serial, "XYZ");
                link
            }
            other => panic!("unexpected event: {:?}", other),
        };

        link.send(Bytes::from_static(b"on\n")).unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"on\n");

        client.write_all(b"OK\n").await.unwrap();
        match events.recv().await.unwrap() {
            BrokerEvent::Payload { conn, data } => {
                assert_eq!(conn, ConnectionId::new(9));
                assert_eq!(data, Bytes::from_static(b"OK\n"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        link.close();
        match events.recv().await.unwrap() {
            BrokerEvent::Closed { conn } => assert_eq!(conn, ConnectionId::new(9)),
            other => panic!("unexpected event: {:?}", other),
        }

        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    }
}
