//! Shared application state.
//!
//! This module provides [`AppState`], which holds shared resources
//! across all HTTP request handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use funcurl_common::{RuntimeConfig, RuntimeError};
use funcurl_core::{RemoteModuleCache, ScriptEngine};
use funcurl_origin::OriginBackend;

use crate::dispatcher::EdgeRequestDispatcher;

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// Dispatcher (and through it the module cache).
    dispatcher: Arc<EdgeRequestDispatcher>,

    /// Drop the module cache before each request.
    clear_cache_per_request: bool,

    /// When the state was created.
    started_at: Instant,
}

impl AppState {
    /// Create state for the configured origin.
    ///
    /// # Arguments
    ///
    /// * `config` - Runtime configuration
    /// * `simulation_root` - Directory standing in for the network origin
    ///
    /// # Errors
    ///
    /// Returns an error if the origin identity is incomplete or the script
    /// engine cannot start.
    pub fn new(config: &RuntimeConfig, simulation_root: Option<&Path>) -> Result<Self, RuntimeError> {
        let origin = funcurl_origin::connect(config, simulation_root)?;
        if simulation_root.is_some() {
            // The local tree synthesizes validators, so static responses carry them.
            let mut config = config.clone();
            config.dispatch.static_validators = true;
            return Self::with_origin(&config, origin);
        }
        Self::with_origin(config, origin)
    }

    /// Create state over an explicit origin backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the script engine cannot start.
    pub fn with_origin(config: &RuntimeConfig, origin: Arc<dyn OriginBackend>) -> Result<Self, RuntimeError> {
        let engine = ScriptEngine::new(&config.engine)?;
        let cache = RemoteModuleCache::new(origin, engine, &config.cache)
            .with_current_path(config.origin.current_path())
            .into_shared();
        Ok(Self::from_dispatcher(EdgeRequestDispatcher::new(cache, config)))
    }

    /// Wrap an already configured dispatcher.
    pub fn from_dispatcher(dispatcher: EdgeRequestDispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            clear_cache_per_request: false,
            started_at: Instant::now(),
        }
    }

    /// Clear the module cache before each request.
    #[must_use]
    pub fn with_clear_cache_per_request(mut self, enabled: bool) -> Self {
        self.clear_cache_per_request = enabled;
        self
    }

    /// Get the dispatcher.
    pub fn dispatcher(&self) -> &EdgeRequestDispatcher {
        &self.dispatcher
    }

    /// Get the module cache.
    pub fn cache(&self) -> &RemoteModuleCache {
        self.dispatcher.cache()
    }

    /// Whether the cache is cleared before each request.
    pub fn clear_cache_per_request(&self) -> bool {
        self.clear_cache_per_request
    }

    /// Seconds since the state was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("cached_modules", &self.cache().len())
            .field("clear_cache_per_request", &self.clear_cache_per_request)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use funcurl_origin::{MemoryOrigin, OriginIdentity};

    use super::*;

    fn memory_state() -> AppState {
        let origin = MemoryOrigin::new(OriginIdentity::object_store("bucket", "ap-northeast-1"));
        AppState::with_origin(&RuntimeConfig::default(), Arc::new(origin)).unwrap()
    }

    #[tokio::test]
    async fn test_app_state_creation() {
        let state = memory_state();
        assert!(state.cache().is_empty());
        assert!(!state.clear_cache_per_request());
        assert_eq!(state.cache().identity().key_prefix().unwrap(), "bucket");
    }

    #[tokio::test]
    async fn test_clear_cache_flag() {
        let state = memory_state().with_clear_cache_per_request(true);
        assert!(state.clear_cache_per_request());
    }

    #[test]
    fn test_missing_origin_is_config_error() {
        let err = AppState::new(&RuntimeConfig::default(), None).unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
    }
}
