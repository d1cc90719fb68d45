//! LocalBlobs Configuration
//!
//! Configuration structures for the blob storage emulation server,
//! loaded from TOML and overridable from the command line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Main LocalBlobs configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBlobsConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Blob server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Storage root directory
    pub directory: PathBuf,

    /// Host to bind the listener on
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (0 = ephemeral)
    #[serde(default)]
    pub port: u16,

    /// Shared secret; anonymous mode when unset
    #[serde(default)]
    pub token: Option<Secret>,

    /// Log every dispatched request through the log sink
    #[serde(default)]
    pub debug: bool,

    /// Maximum accepted PUT body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// A secret string that never shows up in Debug output
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_body_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServerConfig {
    /// Server configuration with defaults for everything but the storage root
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            host: default_host(),
            port: 0,
            token: None,
            debug: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Secret::new(token));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate the server section
    pub fn validate(&self) -> crate::Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(crate::Error::Config("server.directory cannot be empty".into()));
        }

        if self.host.is_empty() {
            return Err(crate::Error::Config("server.host cannot be empty".into()));
        }

        if matches!(&self.token, Some(t) if t.expose().is_empty()) {
            return Err(crate::Error::Config(
                "server.token cannot be empty; omit it for anonymous mode".into(),
            ));
        }

        if self.max_body_bytes == 0 {
            return Err(crate::Error::Config("server.max_body_bytes must be positive".into()));
        }

        Ok(())
    }
}

impl LocalBlobsConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LocalBlobsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.server.validate()?;

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(crate::Error::Config(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }
}
