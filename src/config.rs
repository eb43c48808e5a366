//! Configuration for resp-pipeline.
//!
//! Library users build [`ClientConfig`] / [`PipelineConfig`] directly. The
//! binary loads them from command-line arguments and an optional TOML
//! file; CLI arguments take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::decoder::DEFAULT_READ_BUFFER_CAPACITY;
use crate::protocol::ParseLimits;

/// Tuning for one pipelined connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bound of the hand-off channel between callers and the connection task
    pub channel_capacity: usize,
    /// Initial size of the accumulation buffer and outbound buffer
    pub read_buffer_capacity: usize,
    /// Commands taken from the hand-off channel per wakeup
    pub max_batch: usize,
    /// Stop accepting commands while this many bytes are unwritten
    pub max_outbound_buffer: usize,
    pub limits: ParseLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            read_buffer_capacity: DEFAULT_READ_BUFFER_CAPACITY,
            max_batch: 64,
            max_outbound_buffer: 1024 * 1024, // 1 MB
            limits: ParseLimits::default(),
        }
    }
}

/// Settings for a TCP-backed [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server address (e.g., 127.0.0.1:6379)
    pub addr: String,
    pub connect_timeout: Option<Duration>,
    pub nodelay: bool,
    /// Idle time before TCP keepalive probes start
    pub keepalive: Option<Duration>,
    /// Deadline applied by the client to every call; elapsing closes the connection
    pub request_timeout: Option<Duration>,
    pub pipeline: PipelineConfig,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            connect_timeout: Some(Duration::from_millis(default_connect_timeout_ms())),
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
            request_timeout: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Command-line arguments for the resp-pipeline client
#[derive(Parser, Debug)]
#[command(name = "resp-pipeline")]
#[command(version = "0.1.0")]
#[command(about = "A pipelining RESP client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server address to connect to (e.g., 127.0.0.1:6379)
    #[arg(short = 'c', long)]
    pub connect: Option<String>,

    /// Connect timeout in milliseconds (0 = wait indefinitely)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Per-command timeout in milliseconds (0 = no timeout)
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Command to run; commands are read from stdin when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Address to connect to
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// TCP keepalive idle time in seconds (0 = disabled)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            connect_timeout_ms: default_connect_timeout_ms(),
            nodelay: true,
            keepalive_secs: default_keepalive_secs(),
            request_timeout_ms: 0,
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

fn default_addr() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Zero means "not set".
fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

/// Final resolved configuration for the binary
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub log_level: String,
    /// Positional command; empty means read commands from stdin
    pub command: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let connection = toml_config.connection;
        let connect_timeout_ms = cli
            .connect_timeout_ms
            .unwrap_or(connection.connect_timeout_ms);
        let request_timeout_ms = cli.timeout_ms.unwrap_or(connection.request_timeout_ms);

        Config {
            client: ClientConfig {
                addr: cli.connect.unwrap_or(connection.addr),
                connect_timeout: non_zero(Duration::from_millis(connect_timeout_ms)),
                nodelay: connection.nodelay,
                keepalive: non_zero(Duration::from_secs(connection.keepalive_secs)),
                request_timeout: non_zero(Duration::from_millis(request_timeout_ms)),
                pipeline: toml_config.pipeline,
            },
            log_level: if cli.log_level != default_log_level() {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            command: cli.command,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}
