//! echolog: a readiness-driven TCP echo server
//!
//! Every client connection is served by one mio event loop:
//! - Bytes received are echoed back unchanged
//! - Each read is recorded as a timestamped line in an append-only log
//! - Recording happens on background writers and never stalls the loop
//! - Configuration via CLI arguments or TOML file

mod config;
mod payload_log;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        read_chunk_size = config.read_chunk_size,
        record_log = %config.record_log_path.display(),
        log_workers = config.log_workers,
        log_overflow = ?config.log_overflow,
        "Starting echolog server"
    );

    runtime::run(config)?;
    Ok(())
}
