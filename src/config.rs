//! Configuration module for the echolog server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::payload_log::OverflowPolicy;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echolog")]
#[command(author = "echolog authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server that records every payload", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:5000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog passed to the kernel
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Maximum bytes read from one connection per readiness event
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Readiness wait timeout in seconds
    #[arg(long)]
    pub poll_timeout_secs: Option<u64>,

    /// File that receives one line per received payload
    #[arg(short = 'o', long)]
    pub record_log: Option<PathBuf>,

    /// Number of background threads writing payload records
    #[arg(short = 'w', long)]
    pub log_workers: Option<usize>,

    /// What to do with a payload record when the writer queue is full
    #[arg(long, value_enum)]
    pub log_overflow: Option<OverflowPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub record_log: RecordLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and event loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Readiness wait timeout in seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Capacity of the readiness event buffer
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            poll_timeout_secs: default_poll_timeout_secs(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Per-connection I/O configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Read quota per readiness event
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Unsent echo bytes above which reads pause
    #[serde(default = "default_max_pending_write")]
    pub max_pending_write: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: default_read_chunk_size(),
            max_pending_write: default_max_pending_write(),
        }
    }
}

/// Payload record log configuration
#[derive(Debug, Deserialize)]
pub struct RecordLogConfig {
    /// Destination file
    #[serde(default = "default_record_log_path")]
    pub path: PathBuf,
    /// Bounded queue length per writer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Number of writer threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Queue overflow policy
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Keep the destination open between records
    #[serde(default)]
    pub keep_open: bool,
}

impl Default for RecordLogConfig {
    fn default() -> Self {
        Self {
            path: default_record_log_path(),
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            overflow: OverflowPolicy::default(),
            keep_open: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_backlog() -> i32 {
    2
}

fn default_poll_timeout_secs() -> u64 {
    15_000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_read_chunk_size() -> usize {
    1024
}

fn default_max_pending_write() -> usize {
    64 * 1024 // 64 KB
}

fn default_record_log_path() -> PathBuf {
    PathBuf::from("log-file.txt")
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_workers() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub poll_timeout: Duration,
    pub events_capacity: usize,
    pub read_chunk_size: usize,
    pub max_pending_write: usize,
    pub record_log_path: PathBuf,
    pub log_queue_capacity: usize,
    pub log_workers: usize,
    pub log_overflow: OverflowPolicy,
    pub log_keep_open: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            poll_timeout: Duration::from_secs(
                cli.poll_timeout_secs
                    .unwrap_or(toml_config.server.poll_timeout_secs),
            ),
            events_capacity: toml_config.server.events_capacity,
            read_chunk_size: cli
                .read_chunk_size
                .unwrap_or(toml_config.connection.read_chunk_size),
            max_pending_write: toml_config.connection.max_pending_write,
            record_log_path: cli.record_log.unwrap_or(toml_config.record_log.path),
            log_queue_capacity: toml_config.record_log.queue_capacity,
            log_workers: cli.log_workers.unwrap_or(toml_config.record_log.workers),
            log_overflow: cli.log_overflow.unwrap_or(toml_config.record_log.overflow),
            log_keep_open: toml_config.record_log.keep_open,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("backlog", self.backlog.max(0) as usize),
            ("events_capacity", self.events_capacity),
            ("read_chunk_size", self.read_chunk_size),
            ("max_pending_write", self.max_pending_write),
            ("queue_capacity", self.log_queue_capacity),
            ("workers", self.log_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
