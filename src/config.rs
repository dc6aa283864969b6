//! Configuration module for the proverb server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the proverb server
#[derive(Parser, Debug)]
#[command(name = "proverb-server")]
#[command(author = "proverb-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Pushes a random proverb to every connected client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:12345)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Milliseconds between two messages on one connection
    #[arg(short = 'i', long)]
    pub interval_ms: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Listen backlog passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            backlog: default_backlog(),
        }
    }
}

/// Per-connection session configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Milliseconds between two messages
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

/// Message catalog configuration. `None` selects the built-in proverbs.
#[derive(Debug, Deserialize, Default)]
pub struct CatalogConfig {
    pub messages: Option<Vec<String>>,
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
    "0.0.0.0:12345".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_interval_ms() -> u64 {
    3000 // one message every 3 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub interval: Duration,
    pub workers: Option<usize>,
    pub messages: Option<Vec<String>>,
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
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen))?;

        let interval_ms = cli
            .interval_ms
            .unwrap_or(toml_config.session.interval_ms);
        if interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::ZeroWorkers);
        }

        Ok(Config {
            listen,
            backlog: toml_config.server.backlog,
            interval: Duration::from_millis(interval_ms),
            workers,
            messages: toml_config.catalog.messages,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    ZeroInterval,
    ZeroWorkers,
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
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{}': expected ip:port", addr)
            }
            ConfigError::ZeroInterval => write!(f, "Message interval must be greater than zero"),
            ConfigError::ZeroWorkers => write!(f, "Worker count must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
