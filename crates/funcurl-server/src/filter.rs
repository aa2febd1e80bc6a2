//! Pre-dispatch request filters.
//!
//! A [`RequestFilter`] runs after normalization and before routing. It may
//! adjust the response state and headers, and it may answer the request
//! itself by returning [`FilterOutcome::Handled`], in which case routing is
//! skipped and the value is coerced into the envelope like a handler result.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use funcurl_common::RuntimeError;
use funcurl_core::{
    Invocation, ModuleKey, RemoteModuleCache, RequestContext, ResponseHeaders, ResponseState,
    ScriptValue, resolve_entry_point,
};

/// What a filter decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Route the request normally.
    Continue,
    /// Answer with this value.
    Handled(ScriptValue),
}

/// Hook invoked before extension routing.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    /// Inspect the request.
    ///
    /// # Errors
    ///
    /// Any error is handled like a dispatch failure and becomes a generic 500.
    async fn filter(
        &self,
        request: &RequestContext,
        state: &mut ResponseState,
        headers: &mut ResponseHeaders,
    ) -> Result<FilterOutcome, RuntimeError>;
}

/// A filter implemented by a script module on the origin.
///
/// The module's entry point is called with the same arguments as a handler.
/// Returning nothing lets the request through; anything else answers it.
pub struct ModuleFilter {
    cache: Arc<RemoteModuleCache>,
    key: ModuleKey,
}

impl ModuleFilter {
    /// Create a filter running the module at `key`.
    pub fn new(cache: Arc<RemoteModuleCache>, key: ModuleKey) -> Self {
        Self { cache, key }
    }
}

impl std::fmt::Debug for ModuleFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFilter")
            .field("key", &self.key.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestFilter for ModuleFilter {
    async fn filter(
        &self,
        request: &RequestContext,
        state: &mut ResponseState,
        headers: &mut ResponseHeaders,
    ) -> Result<FilterOutcome, RuntimeError> {
        let exports = self
            .cache
            .load_module(&self.key, self.cache.default_no_cache())
            .await?;
        let entry = resolve_entry_point(&exports)?;
        let script = exports
            .as_script()
            .ok_or_else(|| RuntimeError::handler_contract(self.key.as_str()))?;

        let invocation = Invocation {
            request: request.clone(),
            state: state.clone(),
            headers: headers.clone(),
        };
        let outcome = self.cache.engine().invoke(script, entry, &invocation).await?;
        *state = outcome.state;
        *headers = outcome.headers;

        match outcome.value {
            ScriptValue::None => Ok(FilterOutcome::Continue),
            value => {
                debug!(filter = %self.key, "Request answered by filter");
                Ok(FilterOutcome::Handled(value))
            }
        }
    }
}
