//! Connection registry for the event loop.
//!
//! The set owns every accepted stream from accept until eviction and keeps
//! its readiness registration in step with membership: `add` registers,
//! `remove` deregisters and drops (closes) the stream.

use bytes::BytesMut;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::collections::HashSet;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::debug;

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Non-blocking stream handle.
    pub stream: S,
    /// Echo bytes the socket has not accepted yet.
    pub outbox: BytesMut,
    /// Input (or a pending EOF/error) may be waiting to be read.
    pub readable: bool,
}

impl<S> Connection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            outbox: BytesMut::new(),
            readable: false,
        }
    }
}

/// Errors from adding a connection.
#[derive(Debug)]
pub enum ConnectionError {
    /// A live entry already holds this OS handle.
    DuplicateHandle(RawFd),
    /// The poll registry refused the stream.
    Register(io::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::DuplicateHandle(fd) => write!(f, "handle {fd} is already registered"),
            ConnectionError::Register(e) => write!(f, "failed to register connection: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Registry of live connections keyed by poll token.
///
/// Ids are slab keys, so they are reused after removal. Callers iterate a
/// `snapshot()` and look each id up again, which keeps removal during
/// traversal safe.
pub struct ConnectionSet<S> {
    connections: Slab<Connection<S>>,
    handles: HashSet<RawFd>,
    registry: Registry,
}

impl<S: Source + AsRawFd> ConnectionSet<S> {
    /// Create an empty set registering streams with `registry`.
    pub fn new(registry: Registry) -> Self {
        Self {
            connections: Slab::new(),
            handles: HashSet::new(),
            registry,
        }
    }

    /// Take ownership of `stream` and register it for read and write
    /// readiness. Returns the connection id (also its poll token).
    pub fn add(&mut self, mut stream: S) -> Result<usize, ConnectionError> {
        let fd = stream.as_raw_fd();
        if self.handles.contains(&fd) {
            return Err(ConnectionError::DuplicateHandle(fd));
        }

        let entry = self.connections.vacant_entry();
        let id = entry.key();
        self.registry
            .register(
                &mut stream,
                Token(id),
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(ConnectionError::Register)?;

        entry.insert(Connection::new(stream));
        self.handles.insert(fd);
        Ok(id)
    }

    /// Deregister and close connection `id`.
    ///
    /// Returns `false` if `id` is not live; the handle is never closed twice.
    pub fn remove(&mut self, id: usize) -> bool {
        let Some(mut conn) = self.connections.try_remove(id) else {
            return false;
        };

        self.handles.remove(&conn.stream.as_raw_fd());
        if let Err(e) = self.registry.deregister(&mut conn.stream) {
            debug!(conn_id = id, error = %e, "Deregister failed");
        }
        true
    }

    /// Ids of all live connections, in ascending order.
    pub fn snapshot(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether any connection still has input to read and room to echo it.
    pub fn has_pending_input(&self, max_pending_write: usize) -> bool {
        self.connections
            .iter()
            .any(|(_, conn)| conn.readable && conn.outbox.len() < max_pending_write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UnixStream;
    use mio::{Events, Poll};
    use std::io::Write;
    use std::rc::Rc;
    use std::cell::Cell;
    use std::time::Duration;

    /// Handle with a chosen fd that counts how often it is closed.
    struct FakeHandle {
        fd: RawFd,
        closes: Rc<Cell<usize>>,
    }

    impl AsRawFd for FakeHandle {
        fn as_raw_fd(&self) -> RawFd {
            self.fd
        }
    }

    impl Source for FakeHandle {
        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    fn fake(fd: RawFd, closes: &Rc<Cell<usize>>) -> FakeHandle {
        FakeHandle {
            fd,
            closes: Rc::clone(closes),
        }
    }

    fn registry() -> (Poll, Registry) {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        (poll, registry)
    }

    #[test]
    fn test_add_and_snapshot() {
        let (_poll, registry) = registry();
        let closes = Rc::new(Cell::new(0));
        let mut set = ConnectionSet::new(registry);

        let a = set.add(fake(10, &closes)).unwrap();
        let b = set.add(fake(11, &closes)).unwrap();
        let c = set.add(fake(12, &closes)).unwrap();

        assert_eq!(set.snapshot(), vec![a, b, c]);
        assert_eq!(set.len(), 3);
        assert!(set.contains(b));
    }

    #[test]
    fn test_duplicate_handle() {
        let (_poll, registry) = registry();
        let closes = Rc::new(Cell::new(0));
        let mut set = ConnectionSet::new(registry);

        set.add(fake(10, &closes)).unwrap();
        match set.add(fake(10, &closes)) {
            Err(ConnectionError::DuplicateHandle(10)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_closes_once() {
        let (_poll, registry) = registry();
        let closes = Rc::new(Cell::new(0));
        let mut set = ConnectionSet::new(registry);

        let id = set.add(fake(10, &closes)).unwrap();
        assert!(set.remove(id));
        assert_eq!(closes.get(), 1);

        assert!(!set.remove(id));
        assert_eq!(closes.get(), 1);
        assert!(set.is_empty());

        // The handle value is free again once removed.
        set.add(fake(10, &closes)).unwrap();
    }

    #[test]
    fn test_remove_during_traversal() {
        let (_poll, registry) = registry();
        let closes = Rc::new(Cell::new(0));
        let mut set = ConnectionSet::new(registry);
        for fd in 20..25 {
            set.add(fake(fd, &closes)).unwrap();
        }

        let mut visited = Vec::new();
        for id in set.snapshot() {
            if !set.contains(id) {
                continue;
            }
            visited.push(id);
            if id % 2 == 0 {
                set.remove(id);
            }
        }

        assert_eq!(visited, vec![0, 1, 2, 3, 4]);
        assert_eq!(set.snapshot(), vec![1, 3]);
        assert_eq!(closes.get(), 3);
    }

    #[test]
    fn test_pending_input_respects_backpressure() {
        let (_poll, registry) = registry();
        let closes = Rc::new(Cell::new(0));
        let mut set = ConnectionSet::new(registry);
        let id = set.add(fake(30, &closes)).unwrap();

        assert!(!set.has_pending_input(16));
        set.get_mut(id).unwrap().readable = true;
        assert!(set.has_pending_input(16));

        set.get_mut(id).unwrap().outbox.extend_from_slice(&[0u8; 16]);
        assert!(!set.has_pending_input(16));
    }

    #[test]
    fn test_registered_stream_reports_readiness() {
        let (mut poll, registry) = registry();
        let mut set = ConnectionSet::new(registry);
        let (local, mut peer) = UnixStream::pair().unwrap();

        let id = set.add(local).unwrap();
        peer.write_all(b"ping").unwrap();

        let mut events = Events::with_capacity(8);
        let mut readable = false;
        for _ in 0..10 {
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
            readable |= events
                .iter()
                .any(|e| e.token() == Token(id) && e.is_readable());
            if readable {
                break;
            }
        }
        assert!(readable);

        assert!(set.remove(id));
    }
}
