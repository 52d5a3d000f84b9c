//! A single timestamped payload record.

use bytes::Bytes;
use chrono::{DateTime, Local};

/// `ctime`-style timestamp, e.g. `Wed Jun 30 21:49:08 1993`.
pub const TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Bytes received from one connection in one readiness event.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Wall-clock time the read completed.
    pub timestamp: DateTime<Local>,
    /// Connection the bytes came from. Used for lane routing only.
    pub source: usize,
    /// Owned copy of the received bytes.
    pub payload: Bytes,
}

impl LogRecord {
    /// Stamp `payload` with the current local time.
    pub fn new(source: usize, payload: &[u8]) -> Self {
        Self {
            timestamp: Local::now(),
            source,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Render as `<timestamp> <payload>\n`.
    ///
    /// The payload is copied verbatim; non-text bytes are not escaped.
    pub fn render(&self) -> Vec<u8> {
        let stamp = self.timestamp.format(TIMESTAMP_FORMAT).to_string();
        let mut line = Vec::with_capacity(stamp.len() + self.payload.len() + 2);
        line.extend_from_slice(stamp.as_bytes());
        line.push(b' ');
        line.extend_from_slice(&self.payload);
        line.push(b'\n');
        line
    }
}
