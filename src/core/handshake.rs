//! Per-connection handshake
//!
//! A connection starts unidentified. The first chunk carrying the `pico_`
//! marker identifies it; everything after that is device payload, even if
//! the marker shows up again.

use super::identity::sanitize_serial;
use bytes::Bytes;

/// Marker a device sends to announce its serial
pub const HANDSHAKE_MARKER: &str = "pico_";

/// Handshake state of one connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Handshake {
    /// No marker seen yet
    #[default]
    Unidentified,
    /// Marker seen, serial recorded
    Identified(String),
}

/// What to do with a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Pre-handshake noise, drop it
    Ignored,
    /// This chunk identified the connection
    Identified(String),
    /// Device payload for the identified session
    Payload(Bytes),
}

impl Handshake {
    /// Feed one raw chunk
    pub fn feed(&mut self, chunk: Bytes) -> ChunkOutcome {
        match self {
            Self::Identified(_) => ChunkOutcome::Payload(chunk),
            Self::Unidentified => match parse_marker(&chunk) {
                Some(serial) => {
                    *self = Self::Identified(serial.clone());
                    ChunkOutcome::Identified(serial)
                }
                None => ChunkOutcome::Ignored,
            },
        }
    }

    /// True once the marker has been seen
    pub fn is_identified(&self) -> bool {
        matches!(self, Self::Identified(_))
    }

    /// Recorded serial, if identified
    pub fn serial(&self) -> Option<&str> {
        match self {
            Self::Identified(serial) => Some(serial),
            Self::Unidentified => None,
        }
    }
}

/// Extract the serial from a handshake chunk.
///
/// Returns `None` if the chunk does not start with the marker or if nothing
/// printable follows it.
pub fn parse_marker(chunk: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(chunk);
    let message = sanitize_serial(&text);
    let serial = sanitize_serial(message.strip_prefix(HANDSHAKE_MARKER)?);
    (!serial.is_empty()).then_some(serial)
}
