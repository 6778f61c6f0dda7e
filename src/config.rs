//! Configuration module for the gatehouse server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(author = "gatehouse authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-driven TCP server with admission control", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Peer IP address admitted by the connection filter
    #[arg(short, long)]
    pub allow: Option<IpAddr>,

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
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrently admitted connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Admission filter configuration
#[derive(Debug, Deserialize)]
pub struct AdmissionConfig {
    /// The single peer IP address allowed to connect
    #[serde(default = "default_allow")]
    pub allow: IpAddr,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allow: default_allow(),
        }
    }
}

/// Join-notification broadcast configuration
#[derive(Debug, Deserialize)]
pub struct BroadcastConfig {
    /// Destination address for notification datagrams
    #[serde(default = "default_broadcast_host")]
    pub host: IpAddr,
    /// Destination UDP port for notification datagrams
    #[serde(default = "default_broadcast_port")]
    pub port: u16,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            host: default_broadcast_host(),
            port: default_broadcast_port(),
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_max_connections() -> usize {
    1024
}

fn default_allow() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_broadcast_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_broadcast_port() -> u16 {
    12345
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub allow: IpAddr,
    pub broadcast_host: IpAddr,
    pub broadcast_port: u16,
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

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: toml_config.server.max_connections,
            allow: cli.allow.unwrap_or(toml_config.admission.allow),
            broadcast_host: toml_config.broadcast.host,
            broadcast_port: toml_config.broadcast.port,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
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
