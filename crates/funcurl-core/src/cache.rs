//! Remote module cache.
//!
//! [`RemoteModuleCache`] turns canonical keys into module exports, fetching
//! source from the origin and evaluating it in the [`ScriptEngine`] on a
//! miss. Entries live for the configured TTL and are replaced lazily once
//! expired; nothing sweeps them in the background.
//!
//! # Concurrency
//!
//! The table is shared by every request. Concurrent misses on one key are
//! collapsed by a per-key async mutex, so a module is fetched and evaluated
//! once per fill even when many requests race for it. The lock is dropped
//! from the table once no caller holds it. The no-cache path and raw loads
//! never take the lock.
//!
//! # Script Loads
//!
//! Once shared through [`RemoteModuleCache::into_shared`] the cache is also
//! the engine's [`ModuleHost`], so `exrequire` in fetched code goes through
//! the same table and single-flight as the dispatcher. A module that
//! requires itself through the global `exrequire` while it is being
//! evaluated waits on its own fill; the module-local `require` detects that
//! cycle and fails instead.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace};

use funcurl_common::{CacheConfig, RuntimeError};
use funcurl_origin::{HeadMeta, OriginBackend, OriginIdentity};

use crate::engine::ScriptEngine;
use crate::host::{ContentArgs, ModuleHost, RequireArgs};
use crate::key::ModuleKey;
use crate::module::ModuleExports;

/// A cached module and its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Shared, immutable exports.
    pub value: Arc<ModuleExports>,
    /// Instant after which the entry is stale.
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Summary of one cached module, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedModule {
    /// Canonical key.
    pub key: String,
    /// Hash of the evaluated source.
    pub content_hash: String,
    /// Milliseconds since the module was evaluated.
    pub age_ms: u64,
    /// Milliseconds until the entry goes stale, zero once stale.
    pub expires_in_ms: u64,
}

type FillLocks = DashMap<String, Arc<Mutex<()>>>;

/// Removes a key's fill lock once nobody else holds it.
struct FillGuard<'a> {
    locks: &'a FillLocks,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl Drop for FillGuard<'_> {
    fn drop(&mut self) {
        // Only the table and this guard still reference the lock.
        let ours = &self.lock;
        self.locks
            .remove_if(self.key, |_, lock| Arc::ptr_eq(lock, ours) && Arc::strong_count(lock) == 2);
    }
}

/// Process-wide cache of executed modules, backed by one origin.
pub struct RemoteModuleCache {
    origin: Arc<dyn OriginBackend>,
    engine: ScriptEngine,
    ttl: Duration,
    no_cache: bool,
    current_path: String,
    entries: DashMap<String, CacheEntry>,
    inflight: FillLocks,
}

impl RemoteModuleCache {
    /// Create a cache over `origin`, evaluating scripts in `engine`.
    pub fn new(origin: Arc<dyn OriginBackend>, engine: ScriptEngine, config: &CacheConfig) -> Self {
        Self {
            origin,
            engine,
            ttl: config.ttl(),
            no_cache: config.no_cache,
            current_path: String::new(),
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Directory script loads resolve against when they name none.
    #[must_use]
    pub fn with_current_path(mut self, current_path: impl Into<String>) -> Self {
        self.current_path = current_path.into();
        self
    }

    /// Share the cache and attach it to its engine as the module host.
    pub fn into_shared(self) -> Arc<Self> {
        let shared = Arc::new(self);
        let host: Weak<dyn ModuleHost> = Arc::<Self>::downgrade(&shared);
        shared.engine.attach_host(host);
        shared
    }

    /// Identity of the backing origin.
    pub fn identity(&self) -> &OriginIdentity {
        self.origin.identity()
    }

    /// The engine scripts are evaluated in.
    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    /// The configured default for `no_cache`.
    pub fn default_no_cache(&self) -> bool {
        self.no_cache
    }

    /// The configured entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Default directory for script loads.
    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    /// Derive the canonical key for `relative_path` seen from `current_path`.
    ///
    /// # Errors
    ///
    /// See [`ModuleKey::resolve`].
    pub fn resolve(&self, current_path: &str, relative_path: &str) -> Result<ModuleKey, RuntimeError> {
        ModuleKey::resolve(self.identity(), current_path, relative_path)
    }

    /// Derive the key of an object that is only read.
    ///
    /// # Errors
    ///
    /// See [`ModuleKey::content`].
    pub fn resolve_content(&self, current_path: &str, relative_path: &str) -> Result<ModuleKey, RuntimeError> {
        ModuleKey::content(self.identity(), current_path, relative_path)
    }

    /// Return the exports for `key`, from the cache when fresh.
    ///
    /// With `no_cache` the cache is neither read nor written. Data modules
    /// (`.json`) are parsed on every call and never cached.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::ForbiddenModule`] for reserved bootstrap names,
    ///   before any origin call
    /// - [`RuntimeError::OriginFetch`] when the origin does not resolve
    /// - [`RuntimeError::Script`] when evaluation or data parsing fails
    pub async fn load_module(
        &self,
        key: &ModuleKey,
        no_cache: bool,
    ) -> Result<Arc<ModuleExports>, RuntimeError> {
        self.load_module_from(key, no_cache, &[]).await
    }

    #[instrument(skip(self, parents), fields(key = %key, depth = parents.len()))]
    async fn load_module_from(
        &self,
        key: &ModuleKey,
        no_cache: bool,
        parents: &[String],
    ) -> Result<Arc<ModuleExports>, RuntimeError> {
        if key.is_reserved() {
            return Err(RuntimeError::forbidden_module(key.requested()));
        }

        if key.is_data() {
            let bytes = self.fetch(key).await?;
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| RuntimeError::script(key.as_str(), format!("invalid data module: {e}")))?;
            return Ok(Arc::new(ModuleExports::Data(value)));
        }

        if parents.iter().any(|parent| parent == key.as_str()) {
            return Err(RuntimeError::script(
                key.as_str(),
                format!("circular require through {}", parents.join(" -> ")),
            ));
        }

        if no_cache {
            return self.fetch_and_evaluate(key, parents).await;
        }

        if let Some(hit) = self.lookup(key.as_str()) {
            debug!("Cache hit");
            return Ok(hit);
        }

        let lock = self
            .inflight
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let fill = FillGuard {
            locks: &self.inflight,
            key: key.as_str(),
            lock,
        };
        let _guard = fill.lock.lock().await;

        // Another caller may have filled the entry while we waited.
        if let Some(hit) = self.lookup(key.as_str()) {
            debug!("Cache filled by concurrent load");
            return Ok(hit);
        }
        self.fill(key, parents).await
    }

    async fn fill(&self, key: &ModuleKey, parents: &[String]) -> Result<Arc<ModuleExports>, RuntimeError> {
        let value = self.fetch_and_evaluate(key, parents).await?;
        self.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                value: Arc::clone(&value),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!(ttl_ms = self.ttl.as_millis(), "Cache filled");
        Ok(value)
    }

    /// Fetch raw bytes for `key`, always bypassing the cache.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::OriginFetch`] when the origin does not resolve.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn load_raw(&self, key: &ModuleKey) -> Result<Bytes, RuntimeError> {
        self.fetch(key).await
    }

    /// Fetch the origin's metadata for `key`. Never cached.
    ///
    /// A missing object is reported through the status, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::OriginFetch`] if no answer arrived.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn head_meta(&self, key: &ModuleKey) -> Result<HeadMeta, RuntimeError> {
        let meta = self.origin.head_meta(key.as_str()).await?;
        trace!(status = meta.status, "Head from origin");
        Ok(meta)
    }

    /// Drop every cached entry.
    ///
    /// Fills in progress keep their locks and still insert their result.
    pub fn clear_cache(&self) {
        let dropped = self.entries.len();
        self.entries.clear();
        info!(dropped, "Module cache cleared");
    }

    /// Number of entries, fresh or stale.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summaries of the cached scripts, sorted by key.
    pub fn modules(&self) -> Vec<CachedModule> {
        let now = Instant::now();
        let mut modules: Vec<CachedModule> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let script = entry.value().value.as_script()?;
                Some(CachedModule {
                    key: entry.key().clone(),
                    content_hash: script.content_hash().to_string(),
                    age_ms: millis(now.saturating_duration_since(script.loaded_at())),
                    expires_in_ms: millis(entry.value().expires_at.saturating_duration_since(now)),
                })
            })
            .collect();
        modules.sort_by(|a, b| a.key.cmp(&b.key));
        modules
    }

    fn lookup(&self, key: &str) -> Option<Arc<ModuleExports>> {
        let entry = self.entries.get(key)?;
        entry
            .is_fresh(Instant::now())
            .then(|| Arc::clone(&entry.value))
    }

    async fn fetch(&self, key: &ModuleKey) -> Result<Bytes, RuntimeError> {
        let start = Instant::now();
        let bytes = self.origin.fetch_bytes(key.as_str()).await?;
        debug!(
            size = bytes.len(),
            duration_ms = start.elapsed().as_millis(),
            "Fetched from origin"
        );
        Ok(bytes)
    }

    async fn fetch_and_evaluate(
        &self,
        key: &ModuleKey,
        parents: &[String],
    ) -> Result<Arc<ModuleExports>, RuntimeError> {
        let bytes = self.fetch(key).await?;
        let source = String::from_utf8_lossy(&bytes);
        let exports = self.engine.evaluate_in(key.as_str(), &source, parents).await?;
        Ok(Arc::new(ModuleExports::Script(exports)))
    }

    fn current_or_default<'a>(&'a self, current_path: Option<&'a str>) -> &'a str {
        current_path.unwrap_or(&self.current_path)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl ModuleHost for RemoteModuleCache {
    async fn require(&self, args: RequireArgs) -> Result<Arc<ModuleExports>, RuntimeError> {
        let key = self.resolve(self.current_or_default(args.current_path.as_deref()), &args.path)?;
        let no_cache = args.no_cache.unwrap_or(self.no_cache);
        self.load_module_from(&key, no_cache, &args.parents).await
    }

    async fn contents(&self, args: ContentArgs) -> Result<Bytes, RuntimeError> {
        let key = self.resolve_content(self.current_or_default(args.current_path.as_deref()), &args.path)?;
        self.load_raw(&key).await
    }

    async fn head(&self, args: ContentArgs) -> Result<HeadMeta, RuntimeError> {
        let key = self.resolve_content(self.current_or_default(args.current_path.as_deref()), &args.path)?;
        self.head_meta(&key).await
    }
}

impl std::fmt::Debug for RemoteModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteModuleCache")
            .field("identity", self.identity())
            .field("ttl", &self.ttl)
            .field("no_cache", &self.no_cache)
            .field("current_path", &self.current_path)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funcurl_common::EngineConfig;
    use funcurl_origin::MemoryOrigin;

    fn setup(ttl_ms: u64) -> (RemoteModuleCache, MemoryOrigin) {
        let origin = MemoryOrigin::new(OriginIdentity::object_store("b", "us-east-1"));
        let engine = ScriptEngine::new(&EngineConfig::default()).unwrap();
        let cache = RemoteModuleCache::new(
            Arc::new(origin.clone()),
            engine,
            &CacheConfig {
                ttl_ms,
                no_cache: false,
            },
        );
        (cache, origin)
    }

    #[tokio::test]
    async fn test_ttl_hit_then_refetch() {
        let (cache, origin) = setup(150);
        origin.put("b/app/a.js", "exports.handler = () => 1;");
        let key = cache.resolve("app", "a.js").unwrap();

        let first = cache.load_module(&key, false).await.unwrap();
        let second = cache.load_module(&key, false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(origin.fetch_count("b/app/a.js"), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let third = cache.load_module(&key, false).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(origin.fetch_count("b/app/a.js"), 2);
    }

    #[tokio::test]
    async fn test_no_cache_bypass() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/a.js", "exports.handler = () => 1;");
        let key = cache.resolve("app", "a.js").unwrap();

        cache.load_module(&key, true).await.unwrap();
        cache.load_module(&key, true).await.unwrap();
        assert_eq!(origin.fetch_count("b/app/a.js"), 2);
        assert!(cache.is_empty());

        // A no-cache load does not read a cached entry either.
        cache.load_module(&key, false).await.unwrap();
        cache.load_module(&key, true).await.unwrap();
        assert_eq!(origin.fetch_count("b/app/a.js"), 4);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_data_modules_are_never_cached() {
        let (cache, origin) = setup(60_000);
        let key = cache.resolve("a", "b.json").unwrap();

        origin.put("b/a/b.json", r#"{"v":1}"#);
        let first = cache.load_module(&key, false).await.unwrap();
        assert_eq!(first.as_data().unwrap()["v"], 1);

        origin.put("b/a/b.json", r#"{"v":2}"#);
        let second = cache.load_module(&key, false).await.unwrap();
        assert_eq!(second.as_data().unwrap()["v"], 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_data_module() {
        let (cache, origin) = setup(60_000);
        origin.put("b/a/bad.json", "{nope");
        let key = cache.resolve("a", "bad.json").unwrap();
        let err = cache.load_module(&key, false).await.unwrap_err();
        assert!(err.is_script());
    }

    #[tokio::test]
    async fn test_missing_module_carries_status() {
        let (cache, origin) = setup(60_000);
        let key = cache.resolve("app", "missing.js").unwrap();
        let err = cache.load_module(&key, false).await.unwrap_err();
        assert!(matches!(err, RuntimeError::OriginFetch { status: 404, .. }));
        assert_eq!(origin.total_fetches(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_names_skip_origin() {
        let (cache, origin) = setup(60_000);
        let err = cache.resolve("app", "/index").unwrap_err();
        assert!(matches!(err, RuntimeError::ForbiddenModule { .. }));
        assert_eq!(origin.total_fetches(), 0);
    }

    #[tokio::test]
    async fn test_script_error_is_not_cached() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/bad.js", "throw new Error('init failed');");
        let key = cache.resolve("app", "bad.js").unwrap();

        assert!(cache.load_module(&key, false).await.unwrap_err().is_script());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_single_flight() {
        let (cache, origin) = setup(60_000);
        origin.put(
            "b/app/slow.js",
            "await new Promise((r) => r()); exports.handler = () => 1;",
        );
        let cache = Arc::new(cache);
        let key = cache.resolve("app", "slow.js").unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let key = key.clone();
                tokio::spawn(async move { cache.load_module(&key, false).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(origin.fetch_count("b/app/slow.js"), 1);
    }

    #[tokio::test]
    async fn test_load_raw_and_clear() {
        let (cache, origin) = setup(60_000);
        origin.put("b/site/logo.png", vec![0x89, 0x50]);
        origin.put("b/site/a.js", "exports.handler = () => 1;");

        let raw_key = cache.resolve("site", "logo.png").unwrap();
        cache.load_raw(&raw_key).await.unwrap();
        cache.load_raw(&raw_key).await.unwrap();
        assert_eq!(origin.fetch_count("b/site/logo.png"), 2);

        let key = cache.resolve("site", "a.js").unwrap();
        cache.load_module(&key, false).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.clear_cache();
        assert!(cache.is_empty());
        cache.load_module(&key, false).await.unwrap();
        assert_eq!(origin.fetch_count("b/site/a.js"), 2);
    }

    #[tokio::test]
    async fn test_fill_locks_are_dropped_after_use() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/a.js", "exports.handler = () => 1;");
        origin.put("b/app/bad.js", "throw new Error('nope');");

        let key = cache.resolve("app", "a.js").unwrap();
        cache.load_module(&key, false).await.unwrap();
        let bad = cache.resolve("app", "bad.js").unwrap();
        assert!(cache.load_module(&bad, false).await.is_err());

        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_clear_keeps_held_fill_lock() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/a.js", "exports.handler = () => 1;");
        let cache = cache.into_shared();
        let key = cache.resolve("app", "a.js").unwrap();

        // Stands in for a fill that is still running.
        let lock = cache
            .inflight
            .entry(key.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let held = lock.lock().await;

        cache.clear_cache();
        assert!(cache.inflight.contains_key(key.as_str()));

        let waiter = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            tokio::spawn(async move { cache.load_module(&key, false).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(origin.fetch_count("b/app/a.js"), 0);

        drop(held);
        drop(lock);
        waiter.await.unwrap().unwrap();
        assert_eq!(origin.fetch_count("b/app/a.js"), 1);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_module_summaries() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/b.js", "exports.handler = () => 2;");
        origin.put("b/app/a.js", "exports.handler = () => 1;");
        origin.put("b/app/c.json", "{}");

        for path in ["b.js", "a.js", "c.json"] {
            let key = cache.resolve("app", path).unwrap();
            cache.load_module(&key, false).await.unwrap();
        }

        let modules = cache.modules();
        let keys: Vec<&str> = modules.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, ["b/app/a.js", "b/app/b.js"]);
        assert_eq!(modules[0].content_hash.len(), 16);
        assert_ne!(modules[0].content_hash, modules[1].content_hash);
        assert!(modules[0].expires_in_ms > 59_000);
        assert!(modules[0].age_ms < 1_000);
    }

    #[tokio::test]
    async fn test_exrequire_shares_the_table() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/lib.js", "exports.greet = (n) => `hi ${n}`;");
        origin.put(
            "b/app/a.js",
            "exports.handler = async () => (await exrequire('lib.js')).greet('edge');",
        );
        let cache = cache.with_current_path("app").into_shared();
        let key = cache.resolve("app", "a.js").unwrap();

        let handler = cache.load_module(&key, false).await.unwrap();
        let script = handler.as_script().unwrap();
        let invocation = crate::Invocation::new(crate::RequestContext::new("GET", "/a"));
        for _ in 0..2 {
            let outcome = cache
                .engine()
                .invoke(script, crate::EntryPoint::Handler, &invocation)
                .await
                .unwrap();
            assert_eq!(outcome.value, crate::ScriptValue::Text("hi edge".into()));
        }
        assert_eq!(origin.fetch_count("b/app/lib.js"), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_module_require_rejects_cycles() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/x.js", "exports.y = await require('y.js');");
        origin.put("b/app/y.js", "exports.x = await require('x.js');");
        let cache = cache.with_current_path("app").into_shared();
        let key = cache.resolve("app", "x.js").unwrap();

        let err = cache.load_module(&key, false).await.unwrap_err();
        assert!(err.to_string().contains("circular require"), "{err}");
        assert!(cache.is_empty());
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_excontents_reads_reserved_names_raw() {
        let (cache, origin) = setup(60_000);
        origin.put("b/app/index.js", "bootstrap");
        origin.put(
            "b/app/h.js",
            "exports.handler = async () => String.fromCharCode(...(await excontents('index.js')));",
        );
        let cache = cache.with_current_path("app").into_shared();
        let key = cache.resolve("app", "h.js").unwrap();
        let handler = cache.load_module(&key, false).await.unwrap();

        let outcome = cache
            .engine()
            .invoke(
                handler.as_script().unwrap(),
                crate::EntryPoint::Handler,
                &crate::Invocation::new(crate::RequestContext::new("GET", "/h")),
            )
            .await
            .unwrap();
        assert_eq!(outcome.value, crate::ScriptValue::Text("bootstrap".into()));
    }
}
