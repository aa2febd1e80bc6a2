//! Common types, errors, and configuration for funcurl.
//!
//! This crate provides shared functionality used across the funcurl workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Runtime configuration read from the environment or TOML
//! - The simulation server's configuration file

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{
    CacheConfig, DispatchConfig, EngineConfig, ObjectStoreConfig, OriginConfig, OriginKind,
    RuntimeConfig, SourceHostConfig,
};
pub use config_file::{ConfigFile, ConfigFileError, ServerConfigFile, SimulationConfig};
pub use error::{OriginError, RuntimeError};
