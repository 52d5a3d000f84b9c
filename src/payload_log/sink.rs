//! Record destinations.
//!
//! A `LogSink` accepts fully rendered lines and guarantees that two
//! concurrent `append` calls never interleave their bytes.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Append-only destination for rendered records.
pub trait LogSink: Send + Sync {
    /// Append one rendered line.
    fn append(&self, line: &[u8]) -> Result<(), SinkError>;
}

/// Sink failures. The record is dropped; callers report and move on.
#[derive(Debug)]
pub enum SinkError {
    /// The destination could not be opened for appending.
    CannotOpenDestination(PathBuf, io::Error),
    /// The destination was opened but the write failed.
    Write(PathBuf, io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::CannotOpenDestination(path, e) => {
                write!(f, "cannot open record log '{}': {}", path.display(), e)
            }
            SinkError::Write(path, e) => {
                write!(f, "failed to write record log '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::CannotOpenDestination(_, e) | SinkError::Write(_, e) => Some(e),
        }
    }
}

/// File-backed sink.
///
/// By default each append opens the file, writes the line and closes it
/// again while holding the gate. With `keep_open` the handle is cached
/// across appends and discarded after a write error so the next append
/// reopens it.
pub struct FileSink {
    path: PathBuf,
    keep_open: bool,
    gate: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, keep_open: bool) -> Self {
        Self {
            path: path.into(),
            keep_open,
            gate: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<File, SinkError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SinkError::CannotOpenDestination(self.path.clone(), e))
    }
}

impl LogSink for FileSink {
    fn append(&self, line: &[u8]) -> Result<(), SinkError> {
        // Poisoning leaves nothing half-written behind the gate.
        let mut cached = self.gate.lock().unwrap_or_else(PoisonError::into_inner);

        if !self.keep_open {
            let mut file = self.open()?;
            return file
                .write_all(line)
                .map_err(|e| SinkError::Write(self.path.clone(), e));
        }

        let file = match cached.take() {
            Some(file) => file,
            None => self.open()?,
        };
        let file = cached.insert(file);
        if let Err(e) = file.write_all(line) {
            *cached = None;
            return Err(SinkError::Write(self.path.clone(), e));
        }
        Ok(())
    }
}

/// In-memory sink for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<Vec<u8>>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn lines(&self) -> Vec<Vec<u8>> {
        self.lines.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn append(&self, line: &[u8]) -> Result<(), SinkError> {
        self.lines.lock().unwrap().push(line.to_vec());
        Ok(())
    }
}
