//! End-to-end broker tests over real sockets and file-pair channels

use picobridge_core::config::BrokerConfig;
use picobridge_core::core::channel::file_pair_paths;
use picobridge_core::{BrokerService, DeviceNumber};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(5);

fn config(dir: &Path, grace_ms: u64) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.listen.host = "127.0.0.1".to_string();
    config.listen.port = 0;
    config.channel.directory = dir.to_path_buf();
    config.timing.grace_ms = grace_ms;
    config
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_file(path: &Path) {
    let owned = path.to_path_buf();
    eventually(&format!("{}", path.display()), || {
        let path = owned.clone();
        async move { path.exists() }
    })
    .await;
}

async fn wait_for_removal(path: &Path) {
    let owned = path.to_path_buf();
    eventually(&format!("removal of {}", path.display()), || {
        let path = owned.clone();
        async move { !path.exists() }
    })
    .await;
}

async fn wait_for_content(path: &Path, expected: &[u8]) {
    let owned = path.to_path_buf();
    let expected = expected.to_vec();
    eventually(&format!("content of {}", path.display()), || {
        let path = owned.clone();
        let expected = expected.clone();
        async move { std::fs::read(&path).map_or(false, |c| c == expected) }
    })
    .await;
}

async fn connect(addr: SocketAddr, serial: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("pico_{}", serial).as_bytes())
        .await
        .unwrap();
    stream
}

async fn read_some(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("no data from broker")
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_command_response_and_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let service = BrokerService::start(&config(dir.path(), 100)).await.unwrap();
    let (command, response) = file_pair_paths(dir.path(), DeviceNumber::new(1));

    let mut device = connect(service.local_addr(), "ABC123").await;
    wait_for_file(&command).await;
    wait_for_file(&response).await;

    // Operator -> device
    std::fs::write(&command, b"on\n").unwrap();
    assert_eq!(read_some(&mut device).await, b"on\n");
    wait_for_content(&command, b"").await;

    // Device -> operator
    device.write_all(b"OK\n").await.unwrap();
    wait_for_content(&response, b"OK\n").await;

    // Disconnect: both files removed once the grace window passes
    drop(device);
    wait_for_removal(&command).await;
    wait_for_removal(&response).await;

    // Same serial comes back under the same number
    let _device = connect(service.local_addr(), "ABC123").await;
    wait_for_file(&command).await;

    let stats = service.shutdown().await;
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.disconnects_cleaned, 1);
    assert!(!command.exists());
}

#[tokio::test]
async fn test_reconnect_within_grace_keeps_files() {
    let dir = tempfile::tempdir().unwrap();
    let service = BrokerService::start(&config(dir.path(), 1000)).await.unwrap();
    let (command, response) = file_pair_paths(dir.path(), DeviceNumber::new(1));

    let first = connect(service.local_addr(), "E6614").await;
    wait_for_file(&command).await;
    drop(first);

    let mut second = connect(service.local_addr(), "E6614").await;
    // Keep the handshake and the first payload in separate segments
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.write_all(b"ready\n").await.unwrap();
    wait_for_content(&response, b"ready\n").await;

    // Well past the grace window
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(command.exists());
    assert!(response.exists());

    std::fs::write(&command, b"status\n").unwrap();
    assert_eq!(read_some(&mut second).await, b"status\n");

    let stats = service.shutdown().await;
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.disconnects_cleaned, 0);
}

#[tokio::test]
async fn test_devices_numbered_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let service = BrokerService::start(&config(dir.path(), 100)).await.unwrap();
    let (first_cmd, _) = file_pair_paths(dir.path(), DeviceNumber::new(1));
    let (second_cmd, _) = file_pair_paths(dir.path(), DeviceNumber::new(2));

    let _a = connect(service.local_addr(), "BBB").await;
    wait_for_file(&first_cmd).await;
    let mut b = connect(service.local_addr(), "AAA").await;
    wait_for_file(&second_cmd).await;

    std::fs::write(&second_cmd, b"ping\n").unwrap();
    assert_eq!(read_some(&mut b).await, b"ping\n");

    service.shutdown().await;
}

#[tokio::test]
async fn test_unidentified_connection_gets_no_channel() {
    let dir = tempfile::tempdir().unwrap();
    let service = BrokerService::start(&config(dir.path(), 100)).await.unwrap();

    let mut stranger = TcpStream::connect(service.local_addr()).await.unwrap();
    stranger.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    let stats = service.shutdown().await;
    assert_eq!(stats.connections, 0);

    // Shutdown closes sockets that never identified
    assert!(read_some(&mut stranger).await.is_empty());
}

#[tokio::test]
async fn test_shutdown_removes_every_channel() {
    let dir = tempfile::tempdir().unwrap();
    let service = BrokerService::start(&config(dir.path(), 100)).await.unwrap();

    let _a = connect(service.local_addr(), "AAA").await;
    let _b = connect(service.local_addr(), "BBB").await;
    let (first_cmd, _) = file_pair_paths(dir.path(), DeviceNumber::new(1));
    let (second_cmd, _) = file_pair_paths(dir.path(), DeviceNumber::new(2));
    wait_for_file(&first_cmd).await;
    wait_for_file(&second_cmd).await;

    let stats = service.shutdown().await;
    assert_eq!(stats.connections, 2);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
