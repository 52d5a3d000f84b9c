//! Payload record log.
//!
//! Every successful read on a client connection produces one `LogRecord`.
//! Records are handed to a `Logger`, which queues them on bounded lanes and
//! lets background writer threads render and append them to a `LogSink`.
//!
//! ```text
//! event loop ──record()──▶ lane 0 ──▶ writer-0 ──┐
//!                          lane 1 ──▶ writer-1 ──┼──▶ LogSink::append (mutex)
//!                          ...                   ┘
//! ```
//!
//! Records from one connection always go to the same lane, so they reach the
//! sink in the order they were read. The sink's gate is the only lock.

mod logger;
mod record;
mod sink;

pub use logger::{Logger, LoggerSettings, OverflowPolicy};
pub use sink::FileSink;

#[cfg(test)]
pub use sink::{LogSink, MemorySink};
