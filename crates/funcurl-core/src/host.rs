//! Loads requested by running scripts.
//!
//! Fetched code reaches the origin through three globals installed by the
//! prelude: `exrequire`, `excontents` and `exhead`. Each one is an async op
//! on the isolate thread that calls back into a [`ModuleHost`], normally the
//! process-wide [`RemoteModuleCache`](crate::RemoteModuleCache).
//!
//! The engine holds the host weakly so the cache, which owns the engine,
//! can still be dropped.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Deserialize;

use funcurl_common::RuntimeError;
use funcurl_origin::HeadMeta;

use crate::module::ModuleExports;

/// Arguments of `exrequire` as sent by the prelude.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequireArgs {
    /// Path relative to `current_path`.
    pub path: String,
    /// Directory to resolve against; the host default when absent.
    #[serde(default)]
    pub current_path: Option<String>,
    /// Bypass the cache; the host default when absent.
    #[serde(default)]
    pub no_cache: Option<bool>,
    /// Keys of the modules whose evaluation led to this load.
    #[serde(default)]
    pub parents: Vec<String>,
}

/// Arguments of `excontents` and `exhead`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentArgs {
    /// Path relative to `current_path`.
    pub path: String,
    /// Directory to resolve against; the host default when absent.
    #[serde(default)]
    pub current_path: Option<String>,
}

/// Origin access for scripts running in the engine.
#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// Load and execute a module, honoring the cache.
    async fn require(&self, args: RequireArgs) -> Result<Arc<ModuleExports>, RuntimeError>;

    /// Raw bytes of an object. Never cached.
    async fn contents(&self, args: ContentArgs) -> Result<Bytes, RuntimeError>;

    /// Metadata of an object. Never cached.
    async fn head(&self, args: ContentArgs) -> Result<HeadMeta, RuntimeError>;
}

/// Late-bound host reference shared with the isolate thread.
#[derive(Clone, Default)]
pub struct HostSlot {
    inner: Arc<RwLock<Option<Weak<dyn ModuleHost>>>>,
}

impl HostSlot {
    /// Point the slot at `host`.
    pub fn attach(&self, host: Weak<dyn ModuleHost>) {
        *self.inner.write() = Some(host);
    }

    /// The attached host, if it is still alive.
    pub fn get(&self) -> Option<Arc<dyn ModuleHost>> {
        self.inner.read().as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for HostSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSlot")
            .field("attached", &self.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoHost;

    #[async_trait]
    impl ModuleHost for NoHost {
        async fn require(&self, args: RequireArgs) -> Result<Arc<ModuleExports>, RuntimeError> {
            Err(RuntimeError::invalid_request(args.path))
        }

        async fn contents(&self, args: ContentArgs) -> Result<Bytes, RuntimeError> {
            Err(RuntimeError::invalid_request(args.path))
        }

        async fn head(&self, args: ContentArgs) -> Result<HeadMeta, RuntimeError> {
            Err(RuntimeError::invalid_request(args.path))
        }
    }

    #[test]
    fn test_slot_is_weak() {
        let slot = HostSlot::default();
        assert!(slot.get().is_none());

        let host: Arc<dyn ModuleHost> = Arc::new(NoHost);
        slot.attach(Arc::downgrade(&host));
        assert!(slot.get().is_some());

        drop(host);
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_require_args_defaults() {
        let args: RequireArgs = serde_json::from_str(r#"{"path":"lib.js"}"#).unwrap();
        assert_eq!(args.path, "lib.js");
        assert!(args.current_path.is_none());
        assert!(args.no_cache.is_none());
        assert!(args.parents.is_empty());
    }
}
