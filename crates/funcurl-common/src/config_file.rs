//! Configuration file structures for the funcurl simulation server.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`SimulationConfig`]: Filesystem stand-ins for the network origins

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// This structure represents a complete TOML configuration file
/// that can be loaded at startup. A `[runtime]` table replaces the
/// configuration that would otherwise be read from the environment.
///
/// # Example
///
/// ```toml
/// [runtime.origin]
/// main = "s3"
/// request_path = "public"
///
/// [runtime.origin.object_store]
/// base_path = "my-bucket/app"
/// region = "ap-northeast-1"
///
/// [runtime.cache]
/// ttl_ms = 30000
///
/// [server]
/// bind_addr = "127.0.0.1:3210"
/// cors = true
/// clear_cache_per_request = true
///
/// [simulation]
/// object_store_root = "./s3"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration; `None` means "read it from the environment".
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Local simulation roots.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "127.0.0.1:3210").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,

    /// Add permissive CORS headers to every response.
    #[serde(default)]
    pub cors: bool,

    /// Drop the module cache before each request.
    #[serde(default)]
    pub clear_cache_per_request: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
            cors: false,
            clear_cache_per_request: false,
        }
    }
}

/// Filesystem directories standing in for the network origins.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Directory served in place of the object store.
    #[serde(default)]
    pub object_store_root: Option<PathBuf>,

    /// Directory served in place of the source host.
    #[serde(default)]
    pub source_host_root: Option<PathBuf>,
}

impl SimulationConfig {
    /// Returns `true` if any origin is replaced by a local directory.
    pub fn is_enabled(&self) -> bool {
        self.object_store_root.is_some() || self.source_host_root.is_some()
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "127.0.0.1:3210".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }
}
