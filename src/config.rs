//! Configuration module for the blackhole SMTP server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use tokio_rustls::TlsAcceptor;

use crate::session::{DataScan, Latency, SessionConfig};

/// Largest latency accepted, in milliseconds. Anything outside
/// `0..=MAX_LATENCY_MS` falls back to no latency at all.
pub const MAX_LATENCY_MS: i64 = 1_000_000;

/// Command-line arguments for the SMTP server
#[derive(Parser, Debug)]
#[command(name = "smtp-blackhole")]
#[command(author = "smtp-blackhole authors")]
#[command(version = "0.1.0")]
#[command(about = "An SMTP server that accepts everything and delivers nothing", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Latency in milliseconds added before every reply
    #[arg(long, allow_negative_numbers = true)]
    pub latency: Option<i64>,

    /// Show the SMTP traffic
    #[arg(short, long)]
    pub verbose: bool,

    /// Certificate file (PEM encoded)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Private key file (PEM encoded), defaults to the certificate file
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Number of runtime worker threads (0 = one per core)
    #[arg(long)]
    pub cpus: Option<usize>,

    /// Close sessions that stay silent this many seconds (0 = never)
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// How the end of a DATA payload is detected
    #[arg(long, value_enum)]
    pub data_scan: Option<DataScan>,

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
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of runtime worker threads
    #[serde(default = "default_cpus")]
    pub cpus: usize,
    /// Idle read deadline in seconds
    #[serde(default)]
    pub read_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cpus: default_cpus(),
            read_timeout: 0,
        }
    }
}

/// Protocol emulation settings
#[derive(Debug, Deserialize, Default)]
pub struct SmtpConfig {
    /// Latency in milliseconds
    #[serde(default)]
    pub latency: i64,
    /// DATA terminator scanning policy
    #[serde(default)]
    pub data_scan: DataScan,
}

/// Certificate material for STARTTLS
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log every command and reply
    #[serde(default)]
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            verbose: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    25
}

fn default_cpus() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub latency: Duration,
    pub verbose: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub cpus: usize,
    pub read_timeout: Option<Duration>,
    pub data_scan: DataScan,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI arguments with the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let cert = cli.cert.or(toml_config.tls.cert);
        // A single PEM file may hold both the chain and the key
        let key = cli.key.or(toml_config.tls.key).or_else(|| cert.clone());

        let read_timeout = cli
            .read_timeout
            .unwrap_or(toml_config.server.read_timeout);

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            latency: clamp_latency(cli.latency.unwrap_or(toml_config.smtp.latency)),
            verbose: cli.verbose || toml_config.logging.verbose,
            cert,
            key,
            cpus: cli.cpus.unwrap_or(toml_config.server.cpus),
            read_timeout: (read_timeout > 0).then(|| Duration::from_secs(read_timeout)),
            data_scan: cli.data_scan.unwrap_or(toml_config.smtp.data_scan),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Address the listener binds to
    pub fn listen(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Worker thread count for the runtime
    pub fn worker_threads(&self) -> usize {
        if self.cpus == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.cpus
        }
    }

    /// Per-session settings shared by every connection
    pub fn session(&self, tls: Option<TlsAcceptor>) -> SessionConfig {
        SessionConfig {
            latency: Latency::new(self.latency),
            verbose: self.verbose,
            data_scan: self.data_scan,
            read_timeout: self.read_timeout,
            tls,
        }
    }
}

/// Convert a latency in milliseconds into a delay, treating out of range
/// values as zero.
pub fn clamp_latency(ms: i64) -> Duration {
    if (0..=MAX_LATENCY_MS).contains(&ms) {
        Duration::from_millis(ms as u64)
    } else {
        Duration::ZERO
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
