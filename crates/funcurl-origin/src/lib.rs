//! Origin backends for funcurl.
//!
//! An origin is the remote source that code and content are pulled from on
//! demand. This crate defines the [`OriginBackend`] interface and its
//! implementations:
//!
//! - [`object_store`]: a bucket reached through its signed REST protocol
//! - [`source_host`]: a repository branch reached through its raw-content API
//! - [`fs`]: a local directory standing in for either, used in simulation
//! - [`memory`]: an in-memory map that counts fetches
//!
//! # Request Model
//!
//! Every call performs exactly one request. Status codes >= 400 surface as
//! [`OriginError::Status`](funcurl_common::OriginError::Status); retries are
//! the caller's responsibility.

pub mod backend;
pub mod client;
pub mod fs;
pub mod memory;
pub mod object_store;
pub mod sigv4;
pub mod source_host;

use std::path::Path;
use std::sync::Arc;

use funcurl_common::{RuntimeConfig, RuntimeError};

pub use backend::{Credential, HeadMeta, OriginBackend, OriginIdentity, OriginLocator};
pub use client::OriginClient;
pub use fs::FsOrigin;
pub use memory::MemoryOrigin;
pub use object_store::ObjectStoreOrigin;
pub use source_host::SourceHostOrigin;

/// Build the backend for the configured primary origin.
///
/// When `simulation_root` is given, a [`FsOrigin`] serving that directory
/// replaces the network backend.
///
/// # Errors
///
/// Returns [`RuntimeError::Config`] if the origin identity is incomplete or
/// the HTTP client cannot be created.
pub fn connect(
    config: &RuntimeConfig,
    simulation_root: Option<&Path>,
) -> Result<Arc<dyn OriginBackend>, RuntimeError> {
    let identity = OriginIdentity::from_config(config)?;
    identity.key_prefix()?;

    if let Some(root) = simulation_root {
        tracing::info!(root = %root.display(), "Serving origin from local directory");
        return Ok(Arc::new(FsOrigin::new(identity, root)));
    }

    let backend: Arc<dyn OriginBackend> = if identity.is_object_store() {
        Arc::new(ObjectStoreOrigin::new(identity)?)
    } else {
        Arc::new(SourceHostOrigin::new(identity)?)
    };
    Ok(backend)
}
