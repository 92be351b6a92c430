//! File pair channel
//!
//! `<dir>/pico_<N>.txt` carries operator commands, `<dir>/pico_<N>_response.txt`
//! holds the latest device response. Both are world read/write so unrelated
//! processes can use them. The command file is watched for changes.

use super::{ChannelError, ChannelKind, ChannelNotifier, ChannelProvider, ChannelSignal, ExternalChannel};
use crate::core::identity::DeviceNumber;
use async_trait::async_trait;
use bytes::Bytes;
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FILE_PREFIX: &str = "pico_";
const RESPONSE_SUFFIX: &str = "_response";
#[cfg(unix)]
const FILE_MODE: u32 = 0o666;

/// Command and response paths for a device
pub fn file_pair_paths(directory: &Path, device: DeviceNumber) -> (PathBuf, PathBuf) {
    let command = directory.join(format!("{}{}.txt", FILE_PREFIX, device));
    let response = directory.join(format!("{}{}{}.txt", FILE_PREFIX, device, RESPONSE_SUFFIX));
    (command, response)
}

/// Provisions file pair channels inside one directory
#[derive(Debug, Clone)]
pub struct FilePairProvider {
    directory: PathBuf,
}

impl FilePairProvider {
    /// Create a provider rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl ChannelProvider for FilePairProvider {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Files
    }

    fn provision(
        &self,
        device: DeviceNumber,
        notifier: ChannelNotifier,
    ) -> Result<Box<dyn ExternalChannel>, ChannelError> {
        Ok(Box::new(FilePairChannel::create(&self.directory, device, notifier)?))
    }
}

/// Watched command file + response file
pub struct FilePairChannel {
    device: DeviceNumber,
    command_path: PathBuf,
    response_path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    destroyed: bool,
}

impl std::fmt::Debug for FilePairChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePairChannel")
            .field("device", &self.device)
            .field("command_path", &self.command_path)
            .field("response_path", &self.response_path)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl FilePairChannel {
    /// Create both files empty and start watching the command file
    pub fn create(
        directory: &Path,
        device: DeviceNumber,
        notifier: ChannelNotifier,
    ) -> Result<Self, ChannelError> {
        fs::create_dir_all(directory).map_err(|e| ChannelError::io(directory, e))?;

        let (command_path, response_path) = file_pair_paths(directory, device);
        create_shared_file(&command_path)?;
        if let Err(e) = create_shared_file(&response_path) {
            remove_if_exists(&command_path).ok();
            return Err(e);
        }

        let mut channel = Self {
            device,
            command_path,
            response_path,
            watcher: None,
            destroyed: false,
        };

        // On failure the channel is dropped, which removes the files again
        channel.watcher = Some(watch_commands(&channel.command_path, notifier)?);

        debug!(
            "Pico {}: files ready: command [{}], response [{}]",
            device,
            channel.command_path.display(),
            channel.response_path.display()
        );

        Ok(channel)
    }

    /// Command file path
    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    /// Response file path
    pub fn response_path(&self) -> &Path {
        &self.response_path
    }
}

#[async_trait]
impl ExternalChannel for FilePairChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Files
    }

    fn describe(&self) -> String {
        format!(
            "command [{}], response [{}]",
            self.command_path.display(),
            self.response_path.display()
        )
    }

    async fn read_command(&mut self) -> Result<Bytes, ChannelError> {
        tokio::fs::read(&self.command_path)
            .await
            .map(Bytes::from)
            .map_err(|e| ChannelError::io(&self.command_path, e))
    }

    async fn clear_command(&mut self) -> Result<(), ChannelError> {
        tokio::fs::write(&self.command_path, b"")
            .await
            .map_err(|e| ChannelError::io(&self.command_path, e))
    }

    async fn write_response(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        tokio::fs::write(&self.response_path, data)
            .await
            .map_err(|e| ChannelError::io(&self.response_path, e))
    }

    fn destroy(&mut self) -> Result<(), ChannelError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        // Stop watching before the file disappears
        self.watcher = None;

        let command = remove_if_exists(&self.command_path);
        let response = remove_if_exists(&self.response_path);
        command.and(response)
    }
}

impl Drop for FilePairChannel {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Pico {}: cleanup on drop failed: {}", self.device, e);
        }
    }
}

fn create_shared_file(path: &Path) -> Result<(), ChannelError> {
    fs::write(path, b"").map_err(|e| ChannelError::io(path, e))?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))
        .map_err(|e| ChannelError::io(path, e))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), ChannelError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChannelError::io(path, e)),
    }
}

/// True for events that can mean new command bytes
fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

fn watch_commands(path: &Path, notifier: ChannelNotifier) -> Result<RecommendedWatcher, ChannelError> {
    let device = notifier.device();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_content_change(&event.kind) => {
            notifier.notify(ChannelSignal::Changed);
        }
        Ok(_) => {}
        Err(e) => warn!("Pico {}: command watcher error: {}", device, e),
    })?;

    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::BrokerEvent;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn notifier(device: u32) -> (ChannelNotifier, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier::new(DeviceNumber::new(device), tx), rx)
    }

    #[test]
    fn test_paths() {
        let (command, response) = file_pair_paths(Path::new("/tmp"), DeviceNumber::new(3));
        assert_eq!(command, PathBuf::from("/tmp/pico_3.txt"));
        assert_eq!(response, PathBuf::from("/tmp/pico_3_response.txt"));
    }

    #[test]
    fn test_content_change_filter() {
        use notify::event::{AccessKind, CreateKind, DataChange, ModifyKind};
        assert!(is_content_change(&EventKind::Modify(ModifyKind::Data(DataChange::Any))));
        assert!(is_content_change(&EventKind::Create(CreateKind::File)));
        assert!(!is_content_change(&EventKind::Access(AccessKind::Read)));
    }

    #[tokio::test]
    async fn test_create_write_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let (notifier, _rx) = notifier(1);
        let mut channel = FilePairChannel::create(dir.path(), DeviceNumber::new(1), notifier).unwrap();

        let mode = fs::metadata(channel.command_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
        assert_eq!(fs::read(channel.response_path()).unwrap(), b"");

        channel.write_response(b"first\n").await.unwrap();
        channel.write_response(b"OK\n").await.unwrap();
        assert_eq!(fs::read(channel.response_path()).unwrap(), b"OK\n");

        fs::write(channel.command_path(), b"on\n").unwrap();
        assert_eq!(channel.read_command().await.unwrap(), Bytes::from_static(b"on\n"));
        channel.clear_command().await.unwrap();
        assert!(channel.read_command().await.unwrap().is_empty());

        let command = channel.command_path().to_path_buf();
        let response = channel.response_path().to_path_buf();
        channel.destroy().unwrap();
        channel.destroy().unwrap();
        assert!(!command.exists());
        assert!(!response.exists());
    }

    #[tokio::test]
    async fn test_provision_truncates_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let (command, _) = file_pair_paths(dir.path(), DeviceNumber::new(2));
        fs::write(&command, b"stale").unwrap();

        let provider = FilePairProvider::new(dir.path());
        let (notifier, _rx) = notifier(2);
        let channel = provider.provision(DeviceNumber::new(2), notifier).unwrap();
        assert_eq!(channel.kind(), ChannelKind::Files);
        assert_eq!(fs::read(&command).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_command_write_is_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let (notifier, mut rx) = notifier(5);
        let channel = FilePairChannel::create(dir.path(), DeviceNumber::new(5), notifier).unwrap();

        fs::write(channel.command_path(), b"on\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change notification")
            .unwrap();
        match event {
            BrokerEvent::Channel { device, signal } => {
                assert_eq!(device, DeviceNumber::new(5));
                assert_eq!(signal, ChannelSignal::Changed);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_drop_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let (notifier, _rx) = notifier(6);
        let channel = FilePairChannel::create(dir.path(), DeviceNumber::new(6), notifier).unwrap();
        let command = channel.command_path().to_path_buf();
        drop(channel);
        assert!(!command.exists());
    }
}
