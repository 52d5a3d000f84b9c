//! Fire-and-forget payload logger.
//!
//! `Logger::record` stamps a copy of the payload and pushes it onto a
//! bounded lane; it never waits for the sink. Each lane is drained by one
//! writer thread. Records are routed by source connection so one
//! connection's records stay in receive order.

use super::record::LogRecord;
use super::sink::LogSink;
use serde::Deserialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// What `record` does when the target lane is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the record and count it. The caller never blocks.
    #[default]
    Drop,
    /// Wait for the writer to make room.
    Block,
}

/// Writer pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct LoggerSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 4096,
            overflow: OverflowPolicy::Drop,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time logger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggerStats {
    /// Records accepted onto a lane.
    pub submitted: u64,
    /// Records the sink appended.
    pub written: u64,
    /// Records lost to sink errors.
    pub failed: u64,
    /// Records rejected because a lane was full or closed.
    pub dropped: u64,
}

/// Payload logger backed by a pool of writer threads.
///
/// Dropping the logger closes every lane and joins the writers once they
/// have drained what was already queued.
pub struct Logger {
    lanes: Vec<SyncSender<LogRecord>>,
    writers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
    overflow: OverflowPolicy,
}

impl Logger {
    /// Start `settings.workers` writer threads appending to `sink`.
    pub fn spawn(sink: Arc<dyn LogSink>, settings: LoggerSettings) -> io::Result<Self> {
        let workers = settings.workers.max(1);
        let counters = Arc::new(Counters::default());
        let mut lanes = Vec::with_capacity(workers);
        let mut writers = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = mpsc::sync_channel(settings.queue_capacity);
            let sink = Arc::clone(&sink);
            let counters = Arc::clone(&counters);

            let handle = thread::Builder::new()
                .name(format!("record-writer-{id}"))
                .spawn(move || write_loop(id, rx, sink, counters))?;

            lanes.push(tx);
            writers.push(handle);
        }

        debug!(
            workers,
            queue_capacity = settings.queue_capacity,
            overflow = ?settings.overflow,
            "Record writers started"
        );

        Ok(Self {
            lanes,
            writers,
            counters,
            overflow: settings.overflow,
        })
    }

    /// Submit the bytes read from connection `source`.
    ///
    /// Returns as soon as the record is queued (or dropped, under
    /// `OverflowPolicy::Drop`). Sink errors are never reported back here.
    pub fn record(&self, source: usize, payload: &[u8]) {
        let record = LogRecord::new(source, payload);
        let lane = &self.lanes[source % self.lanes.len()];

        let rejected = match self.overflow {
            OverflowPolicy::Drop => match lane.try_send(record) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => Some("queue full"),
                Err(TrySendError::Disconnected(_)) => Some("writer stopped"),
            },
            OverflowPolicy::Block => lane.send(record).err().map(|_| "writer stopped"),
        };

        match rejected {
            None => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Some(reason) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(source, dropped, reason, "Payload record dropped");
            }
        }
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.lanes.clear();
        for handle in self.writers.drain(..) {
            if handle.join().is_err() {
                warn!("Record writer panicked");
            }
        }
    }
}

fn write_loop(id: usize, rx: Receiver<LogRecord>, sink: Arc<dyn LogSink>, counters: Arc<Counters>) {
    for record in rx {
        match sink.append(&record.render()) {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                trace!(
                    writer = id,
                    source = record.source,
                    bytes = record.payload.len(),
                    "Payload recorded"
                );
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(writer = id, source = record.source, error = %e, "Payload record lost");
            }
        }
    }
    debug!(writer = id, "Record writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload_log::sink::{FileSink, MemorySink, SinkError};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn payloads(sink: &MemorySink) -> Vec<Vec<u8>> {
        // Strip "<24-char timestamp> " and the trailing newline.
        sink.lines()
            .into_iter()
            .map(|line| line[25..line.len() - 1].to_vec())
            .collect()
    }

    #[test]
    fn test_one_line_per_record() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::spawn(sink.clone(), LoggerSettings::default()).unwrap();

        logger.record(0, b"ping");
        logger.record(0, b"pong");
        logger.record(0, b"");
        drop(logger);

        assert_eq!(
            payloads(&sink),
            vec![b"ping".to_vec(), b"pong".to_vec(), Vec::new()]
        );
    }

    #[test]
    fn test_per_source_order_across_workers() {
        let sink = Arc::new(MemorySink::default());
        let settings = LoggerSettings {
            workers: 4,
            queue_capacity: 1024,
            overflow: OverflowPolicy::Block,
        };
        let logger = Logger::spawn(sink.clone(), settings).unwrap();

        for i in 0..100 {
            for source in 0..6 {
                logger.record(source, format!("{source}:{i}").as_bytes());
            }
        }
        let stats = logger.stats();
        drop(logger);

        assert_eq!(stats.submitted, 600);
        let recorded = payloads(&sink);
        assert_eq!(recorded.len(), 600);
        for source in 0..6 {
            let seq: Vec<usize> = recorded
                .iter()
                .map(|p| String::from_utf8(p.clone()).unwrap())
                .filter_map(|p| {
                    let (s, i) = p.split_once(':')?;
                    (s.parse::<usize>().ok()? == source).then(|| i.parse().unwrap())
                })
                .collect();
            assert_eq!(seq, (0..100).collect::<Vec<_>>());
        }
    }

    /// Holds every append until released.
    struct StallSink {
        entered: AtomicBool,
        released: AtomicBool,
        inner: MemorySink,
    }

    impl LogSink for StallSink {
        fn append(&self, line: &[u8]) -> Result<(), SinkError> {
            self.entered.store(true, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            self.inner.append(line)
        }
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let sink = Arc::new(StallSink {
            entered: AtomicBool::new(false),
            released: AtomicBool::new(false),
            inner: MemorySink::default(),
        });
        let settings = LoggerSettings {
            workers: 1,
            queue_capacity: 1,
            overflow: OverflowPolicy::Drop,
        };
        let logger = Logger::spawn(sink.clone(), settings).unwrap();

        logger.record(0, b"first");
        while !sink.entered.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        logger.record(0, b"second");
        logger.record(0, b"third");
        logger.record(0, b"fourth");

        let stats = logger.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.dropped, 2);

        sink.released.store(true, Ordering::SeqCst);
        drop(logger);
        assert_eq!(payloads(&sink.inner), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_sink_failure_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(dir.path().join("missing/records.log"), false));
        let logger = Logger::spawn(sink, LoggerSettings::default()).unwrap();

        logger.record(1, b"lost");
        logger.record(1, b"also lost");

        // Wait for the writer to attempt both appends.
        for _ in 0..200 {
            if logger.stats().failed == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let stats = logger.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.written, 0);
    }
}
