//! Readiness-driven echo runtime.
//!
//! - `ConnectionSet`: owns accepted streams and their poll registration
//! - `EventLoop`: the single-threaded mio loop that accepts, reads,
//!   records and echoes
//!
//! `run` is the bootstrap: it binds the listener, opens the record log
//! pipeline and hands both to the event loop. Failures here are fatal;
//! failures inside the loop never are.

mod connection;
mod event_loop;

pub use connection::ConnectionSet;
pub use event_loop::{EventLoop, LoopSettings};

use crate::config::Config;
use crate::payload_log::{FileSink, Logger, LoggerSettings};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Bind the listener, start the record writers and serve forever.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = bind_listener(addr, config.backlog)?;

    let sink = Arc::new(FileSink::new(&config.record_log_path, config.log_keep_open));
    let logger = Logger::spawn(
        sink,
        LoggerSettings {
            workers: config.log_workers,
            queue_capacity: config.log_queue_capacity,
            overflow: config.log_overflow,
        },
    )?;

    let mut event_loop = EventLoop::new(listener, logger, LoopSettings::from(&config))?;

    info!(
        addr = %event_loop.local_addr()?,
        backlog = config.backlog,
        record_log = %config.record_log_path.display(),
        "Listening"
    );

    event_loop.run()
}

/// Create a non-blocking TCP listener with the given backlog.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
