//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread owns the listener and every connection. Each turn:
//!
//! 1. snapshot the live connection ids
//! 2. wait for readiness (zero timeout if a connection still has input
//!    left over from a quota-limited read)
//! 3. accept everything pending on the listener
//! 4. for each snapshot id: flush queued echo bytes, then read up to one
//!    chunk, record it and echo it back
//!
//! Readiness is edge-triggered, so a connection whose read filled the chunk
//! quota keeps its `readable` flag and is read again next turn instead of
//! waiting for a new edge.

use crate::config::Config;
use crate::payload_log::Logger;
use crate::runtime::ConnectionSet;
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Wait between accept retries after a resource error (EMFILE and friends).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Event loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Upper bound on one readiness wait.
    pub poll_timeout: Duration,
    /// Readiness events collected per wait.
    pub events_capacity: usize,
    /// Bytes read from one connection per turn.
    pub read_chunk_size: usize,
    /// Unsent echo bytes above which a connection is not read.
    pub max_pending_write: usize,
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            events_capacity: config.events_capacity,
            read_chunk_size: config.read_chunk_size,
            max_pending_write: config.max_pending_write,
        }
    }
}

/// Single-threaded readiness loop serving echo connections.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionSet<TcpStream>,
    logger: Logger,
    settings: LoopSettings,
    read_buf: Vec<u8>,
    /// Accepting stopped on an error with connections possibly still queued.
    listener_pending: bool,
}

impl EventLoop {
    /// Take over a bound listener. The loop owns `logger` from here on.
    pub fn new(
        listener: std::net::TcpListener,
        logger: Logger,
        settings: LoopSettings,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let connections = ConnectionSet::new(poll.registry().try_clone()?);

        Ok(Self {
            poll,
            events: Events::with_capacity(settings.events_capacity),
            listener,
            connections,
            logger,
            settings,
            read_buf: vec![0u8; settings.read_chunk_size],
            listener_pending: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Serve forever.
    pub fn run(&mut self) -> ! {
        info!(
            read_chunk_size = self.settings.read_chunk_size,
            poll_timeout_secs = self.settings.poll_timeout.as_secs(),
            "Event loop running"
        );
        loop {
            self.turn();
        }
    }

    /// Run one wait-and-dispatch iteration.
    pub fn turn(&mut self) {
        let snapshot = self.connections.snapshot();
        let timeout = if self
            .connections
            .has_pending_input(self.settings.max_pending_write)
        {
            Duration::ZERO
        } else if self.listener_pending {
            self.settings.poll_timeout.min(ACCEPT_RETRY_DELAY)
        } else {
            self.settings.poll_timeout
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!(error = %e, "Readiness wait failed");
            }
            return;
        }

        if self.events.is_empty() && !timeout.is_zero() && !self.listener_pending {
            let stats = self.logger.stats();
            debug!(
                connections = self.connection_count(),
                records_written = stats.written,
                records_failed = stats.failed,
                records_dropped = stats.dropped,
                "Readiness wait timed out"
            );
            return;
        }

        let mut listener_ready = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => listener_ready = true,
                Token(conn_id) => {
                    if let Some(conn) = self.connections.get_mut(conn_id) {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            conn.readable = true;
                        }
                    }
                }
            }
        }

        if listener_ready || self.listener_pending {
            self.accept_connections();
        }

        for conn_id in snapshot {
            self.service(conn_id);
        }
    }

    fn accept_connections(&mut self) {
        let listener = &self.listener;
        let connections = &mut self.connections;
        let pending = drain_accepts(
            || listener.accept(),
            |stream, peer_addr| match connections.add(stream) {
                Ok(conn_id) => {
                    debug!(conn_id, peer = %peer_addr, "Accepted connection");
                }
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "Dropping accepted connection");
                }
            },
        );
        self.listener_pending = pending;
    }

    fn service(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        if let Err(e) = flush(&mut conn.stream, &mut conn.outbox) {
            warn!(conn_id, error = %e, "Echo write failed");
            self.evict(conn_id);
            return;
        }

        if !conn.readable || conn.outbox.len() >= self.settings.max_pending_write {
            return;
        }

        match read_chunk(&mut conn.stream, &mut self.read_buf) {
            ReadOutcome::WouldBlock => conn.readable = false,
            ReadOutcome::Closed => {
                debug!(conn_id, "Peer closed connection");
                self.evict(conn_id);
            }
            ReadOutcome::Failed(e) => {
                debug!(conn_id, error = %e, "Read error");
                self.evict(conn_id);
            }
            ReadOutcome::Data { len, more, closed } => {
                conn.readable = more;
                let payload = &self.read_buf[..len];

                // Recorded before the echo is issued.
                self.logger.record(conn_id, payload);

                conn.outbox.extend_from_slice(payload);
                if let Err(e) = flush(&mut conn.stream, &mut conn.outbox) {
                    warn!(conn_id, error = %e, "Echo write failed");
                    self.evict(conn_id);
                    return;
                }

                if closed {
                    debug!(conn_id, bytes = len, "Peer closed connection after sending");
                    self.evict(conn_id);
                }
            }
        }
    }

    fn evict(&mut self, conn_id: usize) {
        if self.connections.remove(conn_id) {
            debug!(
                conn_id,
                connections = self.connection_count(),
                "Connection closed"
            );
        }
    }
}

/// Accept until the listener reports `WouldBlock`, handing each stream to
/// `admit`.
///
/// Errors that belong to a single queued connection are reported and
/// skipped. Any other error stops the drain with connections possibly
/// still queued; the return value is then `true` and the caller must retry
/// on a later turn, since no new readiness edge will announce them.
fn drain_accepts<S>(
    mut accept: impl FnMut() -> io::Result<(S, SocketAddr)>,
    mut admit: impl FnMut(S, SocketAddr),
) -> bool {
    loop {
        match accept() {
            Ok((stream, peer_addr)) => admit(stream, peer_addr),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::PermissionDenied
                ) =>
            {
                warn!(error = %e, "Accept failed for one connection");
            }
            Err(e) => {
                error!(error = %e, "Accept error, retrying next turn");
                return true;
            }
        }
    }
}

/// Result of draining one readable connection.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// `len` bytes were read. `more` is set when the chunk filled before the
    /// socket drained; `closed` when EOF or an error followed the data.
    Data { len: usize, more: bool, closed: bool },
    /// Nothing to read yet.
    WouldBlock,
    /// EOF on the first read.
    Closed,
    /// Error on the first read.
    Failed(io::Error),
}

/// Read into `buf` until it is full, the source would block, or the source
/// reports EOF or an error.
pub(crate) fn read_chunk<R: Read>(src: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    loop {
        match src.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return ReadOutcome::Closed,
            Ok(0) => {
                return ReadOutcome::Data {
                    len: filled,
                    more: false,
                    closed: true,
                }
            }
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    return ReadOutcome::Data {
                        len: filled,
                        more: true,
                        closed: false,
                    };
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return if filled == 0 {
                    ReadOutcome::WouldBlock
                } else {
                    ReadOutcome::Data {
                        len: filled,
                        more: false,
                        closed: false,
                    }
                };
            }
            Err(e) if filled == 0 => return ReadOutcome::Failed(e),
            Err(e) => {
                debug!(error = %e, bytes = filled, "Read error after data");
                return ReadOutcome::Data {
                    len: filled,
                    more: false,
                    closed: true,
                };
            }
        }
    }
}

/// Write as much of `outbox` as the sink accepts without blocking.
/// Whatever is left stays queued for the next writable turn.
pub(crate) fn flush<W: Write>(dst: &mut W, outbox: &mut BytesMut) -> io::Result<()> {
    while !outbox.is_empty() {
        match dst.write(&outbox[..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => outbox.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
