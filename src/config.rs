//! Configuration module for the throughput harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Which end of the transfer this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Connect and push the payload
    Send,
    /// Listen and measure inbound transfers
    Receive,
}

/// How the sender waits for each unit's write acknowledgment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Await every acknowledgment before issuing the next unit
    #[default]
    Await,
    /// Issue the next unit from the acknowledgment's continuation
    Callback,
}

/// Wire framing shared by both peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Unframed bytes; the total is agreed out of band
    #[default]
    Raw,
    /// CRLF-terminated records closed by an END_OF_TRANSMISSION record
    Line,
}

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "tcp-throughput")]
#[command(author = "tcp-throughput authors")]
#[command(version = "0.1.0")]
#[command(about = "Chunked TCP bulk-transfer throughput harness", long_about = None)]
pub struct CliArgs {
    /// Run as sender or receiver
    #[arg(value_enum)]
    pub mode: Mode,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to connect to (send) or bind to (receive)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Size of the logical transfer in bytes
    #[arg(short = 'n', long)]
    pub expected_total_bytes: Option<u64>,

    /// Bytes per write unit
    #[arg(short, long)]
    pub unit_size: Option<NonZeroUsize>,

    /// Per-unit write acknowledgment timeout in milliseconds
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Acknowledgment strategy used by the sender
    #[arg(long, value_enum)]
    pub ack_mode: Option<AckMode>,

    /// Wire framing
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Maximum number of connections the receiver serves at once
    #[arg(long)]
    pub concurrency_limit: Option<usize>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Requested SO_SNDBUF/SO_RCVBUF; OS defaults when unset
    pub socket_buffer_size: Option<usize>,
    /// Number of runtime worker threads
    pub workers: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_buffer_size: None,
            workers: None,
        }
    }
}

/// Transfer-related configuration, shared by both peers
#[derive(Debug, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_expected_total_bytes")]
    pub expected_total_bytes: u64,
    #[serde(default = "default_unit_size")]
    pub unit_size: NonZeroUsize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Bound on the graceful close after the last unit
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default)]
    pub ack_mode: AckMode,
    #[serde(default)]
    pub framing: Framing,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            expected_total_bytes: default_expected_total_bytes(),
            unit_size: default_unit_size(),
            write_timeout_ms: default_write_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            ack_mode: AckMode::default(),
            framing: Framing::default(),
        }
    }
}

/// Receiver-related configuration
#[derive(Debug, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Upper bound on a single inbound segment
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Treat an empty read after data as end of transfer
    #[serde(default = "default_eof_heuristic")]
    pub eof_heuristic: bool,
    /// Log progress every this many segments
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u32,
    /// Longest line-framed record held while waiting for its terminator
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            read_buffer_size: default_read_buffer_size(),
            eof_heuristic: default_eof_heuristic(),
            progress_interval: default_progress_interval(),
            max_record_size: default_max_record_size(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    12345
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_expected_total_bytes() -> u64 {
    82_178_160
}

fn default_unit_size() -> NonZeroUsize {
    NonZeroUsize::new(64 * 1024).unwrap_or(NonZeroUsize::MIN)
}

fn default_write_timeout_ms() -> u64 {
    35_000 // connect timeout plus 5 seconds
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

fn default_concurrency_limit() -> usize {
    10
}

fn default_read_buffer_size() -> usize {
    128 * 1024
}

fn default_eof_heuristic() -> bool {
    true
}

fn default_progress_interval() -> u32 {
    100
}

fn default_max_record_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub socket_buffer_size: Option<usize>,
    pub expected_total_bytes: u64,
    pub unit_size: NonZeroUsize,
    pub write_timeout: Duration,
    pub close_timeout: Duration,
    pub ack_mode: AckMode,
    pub framing: Framing,
    pub concurrency_limit: usize,
    pub read_buffer_size: usize,
    pub eof_heuristic: bool,
    pub progress_interval: u32,
    pub max_record_size: usize,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            connection,
            transfer,
            receiver,
            logging,
        } = toml_config;

        let config = Config {
            mode: cli.mode,
            host: cli.host.unwrap_or(connection.host),
            port: cli.port.unwrap_or(connection.port),
            connect_timeout: Duration::from_millis(
                cli.connect_timeout_ms
                    .unwrap_or(connection.connect_timeout_ms),
            ),
            socket_buffer_size: connection.socket_buffer_size,
            expected_total_bytes: cli
                .expected_total_bytes
                .unwrap_or(transfer.expected_total_bytes),
            unit_size: cli.unit_size.unwrap_or(transfer.unit_size),
            write_timeout: Duration::from_millis(
                cli.write_timeout_ms.unwrap_or(transfer.write_timeout_ms),
            ),
            close_timeout: Duration::from_millis(transfer.close_timeout_ms),
            ack_mode: cli.ack_mode.unwrap_or(transfer.ack_mode),
            framing: cli.framing.unwrap_or(transfer.framing),
            concurrency_limit: cli
                .concurrency_limit
                .unwrap_or(receiver.concurrency_limit),
            read_buffer_size: receiver.read_buffer_size,
            eof_heuristic: receiver.eof_heuristic,
            progress_interval: receiver.progress_interval,
            max_record_size: receiver.max_record_size,
            workers: cli.workers.or(connection.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid("concurrency_limit must be at least 1"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be at least 1"));
        }
        if self.max_record_size == 0 {
            return Err(ConfigError::Invalid("max_record_size must be at least 1"));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("write_timeout_ms must be non-zero"));
        }
        if usize::try_from(self.expected_total_bytes).is_err() {
            return Err(ConfigError::Invalid(
                "expected_total_bytes does not fit in memory on this platform",
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        Ok(())
    }

    /// `host:port` as used for both bind and connect
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("tcp-throughput").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.connection.host, "127.0.0.1");
        assert_eq!(config.connection.port, 12345);
        assert_eq!(config.transfer.expected_total_bytes, 82_178_160);
        assert_eq!(config.transfer.unit_size.get(), 65536);
        assert_eq!(config.transfer.framing, Framing::Raw);
        assert_eq!(config.receiver.concurrency_limit, 10);
        assert!(config.receiver.eof_heuristic);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [connection]
            host = "0.0.0.0"
            port = 9000
            socket_buffer_size = 131072

            [transfer]
            expected_total_bytes = 1048576
            unit_size = 4096
            write_timeout_ms = 500
            ack_mode = "callback"
            framing = "line"

            [receiver]
            concurrency_limit = 2
            eof_heuristic = false
            max_record_size = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.host, "0.0.0.0");
        assert_eq!(config.connection.port, 9000);
        assert_eq!(config.connection.socket_buffer_size, Some(131072));
        assert_eq!(config.transfer.expected_total_bytes, 1048576);
        assert_eq!(config.transfer.unit_size.get(), 4096);
        assert_eq!(config.transfer.ack_mode, AckMode::Callback);
        assert_eq!(config.transfer.framing, Framing::Line);
        assert_eq!(config.receiver.concurrency_limit, 2);
        assert!(!config.receiver.eof_heuristic);
        assert_eq!(config.receiver.max_record_size, 4096);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_zero_unit_size_rejected() {
        let toml_str = r#"
            [transfer]
            unit_size = 0
        "#;
        assert!(toml::from_str::<TomlConfig>(toml_str).is_err());
        assert!(CliArgs::try_parse_from(["tcp-throughput", "send", "--unit-size", "0"]).is_err());
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [transfer]
            unit_size = 4096
            write_timeout_ms = 500
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["send", "--unit-size", "1024", "--port", "4000"]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Send);
        assert_eq!(config.unit_size.get(), 1024);
        assert_eq!(config.port, 4000);
        assert_eq!(config.write_timeout, Duration::from_millis(500));
        assert_eq!(config.address(), "127.0.0.1:4000");
    }

    #[test]
    fn test_invalid_concurrency_limit() {
        let result = Config::merge(
            cli(&["receive", "--concurrency-limit", "0"]),
            TomlConfig::default(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
