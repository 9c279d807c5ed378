//! Configuration management module for the relay.
//!
//! This module provides functionality for loading, parsing, and validating
//! the startup configuration. The configuration is read once and never
//! mutated afterwards; components borrow it or share it behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/goproxy/config.json";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing JSON configuration
    #[error("Failed to parse JSON config: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// Operating mode of the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    /// Open nothing and return immediately
    Stop,
    /// Terminate the tunnel and relay outbound connections
    Server,
    /// Local HTTP proxy forwarding through the tunnel
    Http,
    /// Any other value; logged and ignored at dispatch
    Unsupported(String),
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "stop" => Mode::Stop,
            "server" => Mode::Server,
            "http" => Mode::Http,
            _ => Mode::Unsupported(value),
        }
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Stop => write!(f, "stop"),
            Mode::Server => write!(f, "server"),
            Mode::Http => write!(f, "http"),
            Mode::Unsupported(name) => write!(f, "{}", name),
        }
    }
}

/// Main configuration structure.
///
/// Field names follow the on-disk JSON document (`Mode`, `Listen`, ...).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Operating mode
    pub mode: Mode,

    /// Local address to listen on (server and http modes)
    #[serde(default)]
    pub listen: String,

    /// Remote tunnel endpoint (http mode)
    #[serde(default)]
    pub server: String,

    /// Log file path; empty means standard output
    #[serde(default)]
    pub logfile: String,

    /// Log level name (default: "info")
    #[serde(default = "default_log_level")]
    pub loglevel: String,

    /// Cipher identifier for the encrypted transport
    #[serde(default)]
    pub cipher: String,

    /// Cipher key, hex or base64 encoded
    #[serde(default)]
    pub key: String,

    /// Blacklist file enabling split-tunnel routing; empty disables it
    #[serde(default)]
    pub blackfile: String,

    /// Explicit resolver configuration; empty uses the search path
    #[serde(default)]
    pub resolv_conf: String,

    /// Tunnel username (http mode)
    #[serde(default)]
    pub username: String,

    /// Tunnel password (http mode)
    #[serde(default)]
    pub password: String,

    /// Credential table for inbound tunnel clients (server mode)
    #[serde(default)]
    pub auth: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Parse and validate configuration from a JSON document
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required: Vec<(&str, &str)> = match self.mode {
            Mode::Server => vec![
                ("Listen", self.listen.as_str()),
                ("Cipher", self.cipher.as_str()),
                ("Key", self.key.as_str()),
            ],
            Mode::Http => vec![
                ("Listen", self.listen.as_str()),
                ("Server", self.server.as_str()),
                ("Cipher", self.cipher.as_str()),
                ("Key", self.key.as_str()),
                ("Username", self.username.as_str()),
                ("Password", self.password.as_str()),
            ],
            // Nothing is opened in these modes
            Mode::Stop | Mode::Unsupported(_) => Vec::new(),
        };

        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingValue(format!(
                    "{} is required in {} mode",
                    name, self.mode
                )));
            }
        }

        Ok(())
    }

    /// Blacklist path, if split-tunnel routing is enabled
    pub fn blackfile(&self) -> Option<&Path> {
        non_empty_path(&self.blackfile)
    }

    /// Explicit resolver configuration path, if one is set
    pub fn resolv_conf(&self) -> Option<&Path> {
        non_empty_path(&self.resolv_conf)
    }

    /// Log file path; `None` means standard output
    pub fn logfile(&self) -> Option<&Path> {
        non_empty_path(&self.logfile)
    }
}

fn non_empty_path(value: &str) -> Option<&Path> {
    if value.is_empty() {
        None
    } else {
        Some(Path::new(value))
    }
}
