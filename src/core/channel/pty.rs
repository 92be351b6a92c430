//! Pseudo-terminal channel (Unix)
//!
//! Each device gets a raw-mode pty. The slave path is published through a
//! symlink `<dir>/pico<N>` so serial tools can open it like a device node.
//! Bytes read from the master are operator input and go straight to the
//! device; device responses are written to the master.

use super::{ChannelError, ChannelKind, ChannelNotifier, ChannelProvider, ChannelSignal, ExternalChannel};
use crate::config::LineEnding;
use crate::core::identity::DeviceNumber;
use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::termios::{self, SetArg};
use std::ffi::CStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const LINK_PREFIX: &str = "pico";
const READ_BUFFER: usize = 4096;

/// Symlink path published for a device
pub fn pty_link_path(directory: &Path, device: DeviceNumber) -> PathBuf {
    directory.join(format!("{}{}", LINK_PREFIX, device))
}

/// Provisions pty channels with symlinks in one directory
#[derive(Debug, Clone)]
pub struct PtyProvider {
    symlink_directory: PathBuf,
    line_ending: LineEnding,
}

impl PtyProvider {
    /// Create a provider publishing links in `symlink_directory`
    pub fn new(symlink_directory: impl Into<PathBuf>, line_ending: LineEnding) -> Self {
        Self {
            symlink_directory: symlink_directory.into(),
            line_ending,
        }
    }
}

impl ChannelProvider for PtyProvider {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Pty
    }

    fn provision(
        &self,
        device: DeviceNumber,
        notifier: ChannelNotifier,
    ) -> Result<Box<dyn ExternalChannel>, ChannelError> {
        Ok(Box::new(PtyChannel::open(
            &self.symlink_directory,
            device,
            self.line_ending,
            notifier,
        )?))
    }
}

/// Pty pair plus its published symlink
#[derive(Debug)]
pub struct PtyChannel {
    device: DeviceNumber,
    link_path: PathBuf,
    slave_path: PathBuf,
    master: Option<Arc<AsyncFd<File>>>,
    // Held open so master reads block instead of failing with EIO
    slave: Option<OwnedFd>,
    reader: Option<JoinHandle<()>>,
    line_ending: LineEnding,
    destroyed: bool,
}

impl PtyChannel {
    /// Allocate the pty, publish the symlink and start reading the master
    pub fn open(
        symlink_directory: &Path,
        device: DeviceNumber,
        line_ending: LineEnding,
        notifier: ChannelNotifier,
    ) -> Result<Self, ChannelError> {
        let (master, slave, slave_path) = open_pty()?;

        make_raw(&slave).map_err(|e| ChannelError::io(&slave_path, e))?;
        set_nonblocking(&master).map_err(|e| ChannelError::io(&slave_path, e))?;

        // SAFETY: the `File` owns the master fd and keeps it open until the
        // `AsyncFd` drops it.
        let master = unsafe { AsyncFd::register(File::from(master)) }
            .map_err(|e| ChannelError::io(&slave_path, io::Error::from(e)))?;
        let master = Arc::new(master);

        let link_path = pty_link_path(symlink_directory, device);
        publish_link(symlink_directory, &link_path, &slave_path)?;

        let reader = tokio::spawn(read_master(device, Arc::clone(&master), notifier));

        debug!(
            "Pico {}: pty {} linked at {}",
            device,
            slave_path.display(),
            link_path.display()
        );

        Ok(Self {
            device,
            link_path,
            slave_path,
            master: Some(master),
            slave: Some(slave),
            reader: Some(reader),
            line_ending,
            destroyed: false,
        })
    }

    /// Published symlink
    pub fn link_path(&self) -> &Path {
        &self.link_path
    }

    /// Slave device path (e.g. `/dev/pts/3`)
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }
}

#[async_trait]
impl ExternalChannel for PtyChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Pty
    }

    fn describe(&self) -> String {
        format!("{} -> {}", self.link_path.display(), self.slave_path.display())
    }

    // Operator input arrives as ChannelSignal::Input; nothing is parked here.
    async fn read_command(&mut self) -> Result<Bytes, ChannelError> {
        Ok(Bytes::new())
    }

    async fn clear_command(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn write_response(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let Some(master) = self.master.as_ref() else {
            return Err(ChannelError::io(
                &self.slave_path,
                io::Error::new(io::ErrorKind::NotConnected, "pty destroyed"),
            ));
        };

        let line = terminate_line(data, self.line_ending);
        if line.is_empty() {
            return Ok(());
        }

        // Non-blocking: a full input queue means nobody is reading the slave,
        // in which case the response is dropped rather than stalling the loop.
        let mut written = 0;
        while written < line.len() {
            match master.get_ref().write(&line[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ChannelError::io(&self.slave_path, e)),
            }
        }

        Ok(())
    }

    fn destroy(&mut self) -> Result<(), ChannelError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.master = None;
        self.slave = None;

        match fs::remove_file(&self.link_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChannelError::io(&self.link_path, e)),
        }
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Pico {}: pty cleanup on drop failed: {}", self.device, e);
        }
    }
}

/// Trim trailing whitespace and append the terminal line ending
fn terminate_line(data: &[u8], ending: LineEnding) -> Vec<u8> {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    if end == 0 {
        return Vec::new();
    }

    let mut line = Vec::with_capacity(end + 2);
    line.extend_from_slice(&data[..end]);
    line.extend_from_slice(ending.bytes());
    line
}

fn open_pty() -> Result<(OwnedFd, OwnedFd, PathBuf), ChannelError> {
    let mut master_fd: libc::c_int = -1;
    let mut slave_fd: libc::c_int = -1;
    let mut name_buf = [0 as libc::c_char; 256];

    // SAFETY: all out-pointers are valid for the call; the name buffer is
    // larger than any pts path the kernel hands out.
    let result = unsafe {
        libc::openpty(
            &mut master_fd,
            &mut slave_fd,
            name_buf.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };

    if result != 0 {
        return Err(ChannelError::Pty(format!(
            "openpty failed: {}",
            io::Error::last_os_error()
        )));
    }

    // SAFETY: openpty succeeded, so both descriptors are open and owned by us
    // and the name buffer holds a NUL-terminated string.
    let (master, slave, name) = unsafe {
        (
            OwnedFd::from_raw_fd(master_fd),
            OwnedFd::from_raw_fd(slave_fd),
            CStr::from_ptr(name_buf.as_ptr()).to_string_lossy().into_owned(),
        )
    };

    Ok((master, slave, PathBuf::from(name)))
}

fn make_raw(slave: &OwnedFd) -> io::Result<()> {
    let mut attrs = termios::tcgetattr(slave)?;
    termios::cfmakeraw(&mut attrs);
    termios::tcsetattr(slave, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid open descriptor for the duration of both calls.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn publish_link(directory: &Path, link_path: &Path, target: &Path) -> Result<(), ChannelError> {
    fs::create_dir_all(directory).map_err(|e| ChannelError::io(directory, e))?;

    // A link left behind by a crashed run points at a dead pts
    if fs::symlink_metadata(link_path).is_ok() {
        debug!("Replacing stale link {}", link_path.display());
        fs::remove_file(link_path).map_err(|e| ChannelError::io(link_path, e))?;
    }

    std::os::unix::fs::symlink(target, link_path).map_err(|e| ChannelError::io(link_path, e))
}

async fn read_master(device: DeviceNumber, master: Arc<AsyncFd<File>>, notifier: ChannelNotifier) {
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Pico {}: pty poll failed: {}", device, e);
                break;
            }
        };

        match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let input = Bytes::copy_from_slice(&buf[..n]);
                if !notifier.notify(ChannelSignal::Input(input)) {
                    break;
                }
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => {
                debug!("Pico {}: pty read ended: {}", device, e);
                break;
            }
            Err(_would_block) => {}
        }
    }
}
