//! Command/response traffic log
//!
//! A plain-text record of what went to and came from each device, kept
//! separate from diagnostic tracing output so operators can tail it. The
//! file is truncated once it grows past its size cap.

use crate::config::TrafficLogConfig;
use crate::core::identity::DeviceNumber;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Shared handle
pub type Logger = Arc<Mutex<TrafficLog>>;

/// Traffic direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Operator command delivered to a device
    Command,
    /// Device response relayed to its channel
    Response,
    /// Lifecycle note
    Info,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Info => "info",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// When it happened
    pub timestamp: DateTime<Local>,
    /// Device involved
    pub device: DeviceNumber,
    /// Direction
    pub direction: Direction,
    /// Payload
    pub data: Vec<u8>,
}

impl LogEntry {
    /// Create new entry stamped now
    pub fn new(device: DeviceNumber, direction: Direction, data: &[u8]) -> Self {
        Self {
            timestamp: Local::now(),
            device,
            direction,
            data: data.to_vec(),
        }
    }

    /// Format as one text line (no trailing newline)
    pub fn to_text(&self) -> String {
        let text = String::from_utf8_lossy(&self.data);
        format!(
            "{} [Pico {} - {}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.device,
            self.direction.label(),
            text.trim()
        )
    }
}

/// Size-capped append-only traffic log
#[derive(Debug)]
pub struct TrafficLog {
    path: PathBuf,
    max_bytes: u64,
    file: Option<File>,
    lines_logged: usize,
}

impl TrafficLog {
    /// Open (or create) the log file
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            max_bytes,
            file: Some(file),
            lines_logged: 0,
        })
    }

    /// Build a shared logger from config; `None` when disabled
    pub fn from_config(config: &TrafficLogConfig) -> io::Result<Option<Logger>> {
        if !config.enabled {
            return Ok(None);
        }
        let log = Self::open(&config.path, config.max_size_mb.saturating_mul(1024 * 1024))?;
        Ok(Some(Arc::new(Mutex::new(log))))
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written since open
    pub fn lines_logged(&self) -> usize {
        self.lines_logged
    }

    /// Append an entry; failures are reported through tracing and swallowed
    pub fn log(&mut self, device: DeviceNumber, direction: Direction, data: &[u8]) {
        let entry = LogEntry::new(device, direction, data);
        if let Err(e) = self.append(&entry) {
            warn!("Traffic log {} write failed: {}", self.path.display(), e);
        }
    }

    /// Log a delivered command
    pub fn log_command(&mut self, device: DeviceNumber, data: &[u8]) {
        self.log(device, Direction::Command, data);
    }

    /// Log a relayed response
    pub fn log_response(&mut self, device: DeviceNumber, data: &[u8]) {
        self.log(device, Direction::Response, data);
    }

    /// Log a lifecycle note
    pub fn log_info(&mut self, device: DeviceNumber, message: &str) {
        self.log(device, Direction::Info, message.as_bytes());
    }

    fn append(&mut self, entry: &LogEntry) -> io::Result<()> {
        self.rotate_if_full()?;

        let file = match self.file.take() {
            Some(file) => file,
            None => open_append(&self.path)?,
        };
        let file = self.file.insert(file);

        writeln!(file, "{}", entry.to_text())?;
        self.lines_logged += 1;
        Ok(())
    }

    fn rotate_if_full(&mut self) -> io::Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            // Deleted underneath us; reopen on next append
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.file = None;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if size > self.max_bytes {
            self.file = None;
            File::create(&self.path)?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
