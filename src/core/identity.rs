//! Device identity resolution
//!
//! Devices present a volatile serial string when they connect. The resolver
//! maps each serial to a stable [`DeviceNumber`] that survives reconnects for
//! the lifetime of the process.

use std::collections::HashMap;
use std::fmt;

/// Stable logical device number (starts at 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceNumber(u32);

impl DeviceNumber {
    /// Wrap a raw number
    pub fn new(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strip C0/C1 control characters and surrounding whitespace.
///
/// The result is safe to use as a map key and inside derived resource names.
pub fn sanitize_serial(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(*c as u32, 0x00..=0x1F | 0x7F..=0x9F))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Append-only serial -> device number map
#[derive(Debug)]
pub struct IdentityResolver {
    numbers: HashMap<String, DeviceNumber>,
    next: u32,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver {
    /// Create an empty resolver; the first serial gets number 1
    pub fn new() -> Self {
        Self {
            numbers: HashMap::new(),
            next: 1,
        }
    }

    /// Resolve a (sanitized) serial, allocating the next number on first sight
    pub fn resolve(&mut self, serial: &str) -> DeviceNumber {
        if let Some(&number) = self.numbers.get(serial) {
            return number;
        }

        let number = DeviceNumber(self.next);
        self.next += 1;
        self.numbers.insert(serial.to_string(), number);
        number
    }

    /// Look up without allocating
    pub fn lookup(&self, serial: &str) -> Option<DeviceNumber> {
        self.numbers.get(serial).copied()
    }

    /// Number of serials seen so far
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    /// True if no serial has been resolved yet
    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}
