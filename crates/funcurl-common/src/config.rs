//! Configuration structures for funcurl.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`OriginConfig`]: Which origin serves code and content, and how to reach it
//! - [`CacheConfig`]: Module cache TTL and no-cache mode
//! - [`DispatchConfig`]: Response compression and template routing
//! - [`EngineConfig`]: Script engine thread settings
//!
//! Deployments configure the runtime through environment variables (see
//! [`RuntimeConfig::from_env`]); the simulation server can additionally load
//! the same structure from TOML.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Environment variable selecting the primary origin (`s3` or `git`).
pub const ENV_MAIN_EXTERNAL: &str = "MAIN_EXTERNAL";
/// Environment variable holding the request current path.
pub const ENV_REQUEST_PATH: &str = "REQUEST_PATH";
/// Environment variable holding `"basePath, region"` for the object store.
pub const ENV_S3_CONNECT: &str = "S3_CONNECT";
/// Environment variable holding `"organization, repo, branch, basePath, token"`.
pub const ENV_GIT_CONNECT: &str = "GIT_CONNECT";
/// Environment variable holding the cache TTL in milliseconds.
pub const ENV_TIMEOUT: &str = "TIMEOUT";
/// Environment variable disabling the module cache when `true`.
pub const ENV_NONE_CACHE: &str = "NONE_CACHE";
/// Environment variable disabling response compression when `true`.
pub const ENV_NONE_GZIP: &str = "NONE_GZIP";
/// Object-store access key id.
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// Object-store secret access key.
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Optional object-store session token.
pub const ENV_AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for funcurl.
/// It can be loaded from environment variables or TOML files.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Origin selection and connection parameters.
    #[serde(default)]
    pub origin: OriginConfig,

    /// Module cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Dispatcher configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Script engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Which origin backend serves requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    /// Object store reached through its signed REST protocol.
    #[default]
    #[serde(alias = "s3")]
    ObjectStore,
    /// Source-hosting service reached through its raw-content API.
    #[serde(alias = "git")]
    SourceHost,
}

impl OriginKind {
    /// Parse the `MAIN_EXTERNAL` value (case-insensitive, trimmed).
    pub fn parse(value: &str) -> Result<Self, RuntimeError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "s3" | "object_store" => Ok(Self::ObjectStore),
            "git" | "source_host" => Ok(Self::SourceHost),
            other => Err(RuntimeError::config(format!(
                "Setting {ENV_MAIN_EXTERNAL}: {other} is out of scope"
            ))),
        }
    }
}

/// Origin configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OriginConfig {
    /// The origin that serves requests.
    #[serde(default)]
    pub main: OriginKind,

    /// Current path that request paths are resolved against.
    ///
    /// It is itself relative to the connection's base path.
    #[serde(default)]
    pub request_path: String,

    /// Object-store connection, required when `main` is the object store.
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,

    /// Source-host connection, required when `main` is the source host.
    #[serde(default)]
    pub source_host: Option<SourceHostConfig>,
}

impl OriginConfig {
    /// The connection base path of the selected origin.
    pub fn base_path(&self) -> Option<&str> {
        match self.main {
            OriginKind::ObjectStore => self.object_store.as_ref().map(|c| c.base_path.as_str()),
            OriginKind::SourceHost => self.source_host.as_ref().map(|c| c.base_path.as_str()),
        }
    }

    /// The path request paths are resolved against: the connection's base
    /// path (without the bucket for the object store) joined with
    /// `request_path`.
    pub fn current_path(&self) -> String {
        let base = match self.main {
            OriginKind::ObjectStore => self.object_store.as_ref().map(ObjectStoreConfig::prefix),
            OriginKind::SourceHost => self.source_host.as_ref().map(|c| c.base_path.as_str()),
        };
        [base.unwrap_or_default(), self.request_path.as_str()]
            .iter()
            .map(|p| p.trim().trim_matches('/'))
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Check that the selected origin has its connection parameters.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] naming the missing setting.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        match self.main {
            OriginKind::ObjectStore => {
                let conn = self.object_store.as_ref().ok_or_else(|| {
                    RuntimeError::config(format!("{ENV_S3_CONNECT} is a required setting"))
                })?;
                if conn.bucket().is_none() {
                    return Err(RuntimeError::config(format!(
                        "{ENV_S3_CONNECT}.basePath must start with a bucket name"
                    )));
                }
            }
            OriginKind::SourceHost => {
                let conn = self.source_host.as_ref().ok_or_else(|| {
                    RuntimeError::config(format!("{ENV_GIT_CONNECT} is a required setting"))
                })?;
                for (field, value) in [
                    ("organization", &conn.organization),
                    ("repo", &conn.repository),
                    ("branch", &conn.branch),
                ] {
                    if value.trim().is_empty() {
                        return Err(RuntimeError::config(format!(
                            "{ENV_GIT_CONNECT}.{field} is a required setting"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Object-store connection parameters.
#[derive(Clone, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    /// `bucket[/prefix]`; the first segment names the bucket.
    pub base_path: String,

    /// Region of the bucket.
    #[serde(default = "defaults::region")]
    pub region: String,

    /// Access key id used for request signing.
    #[serde(default, skip_serializing)]
    pub access_key_id: Option<String>,

    /// Secret access key used for request signing.
    #[serde(default, skip_serializing)]
    pub secret_access_key: Option<String>,

    /// Optional short-lived session token.
    #[serde(default, skip_serializing)]
    pub session_token: Option<String>,
}

impl ObjectStoreConfig {
    /// The bucket named by the first segment of the base path.
    pub fn bucket(&self) -> Option<&str> {
        self.base_path
            .trim_start_matches("s3://")
            .split('/')
            .find(|s| !s.trim().is_empty())
            .map(str::trim)
    }

    /// The base path with the bucket segment removed.
    pub fn prefix(&self) -> &str {
        let path = self.base_path.trim().trim_start_matches("s3://");
        let path = path.trim_start_matches('/');
        path.split_once('/').map_or("", |(_, rest)| rest)
    }
}

impl fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("base_path", &self.base_path)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Source-host connection parameters.
#[derive(Clone, Deserialize, Serialize)]
pub struct SourceHostConfig {
    /// Organization (or user) owning the repository.
    pub organization: String,

    /// Repository name.
    pub repository: String,

    /// Branch to read from.
    pub branch: String,

    /// Path inside the repository that requests are resolved under.
    #[serde(default)]
    pub base_path: String,

    /// Personal access token for private repositories.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl fmt::Debug for SourceHostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHostConfig")
            .field("organization", &self.organization)
            .field("repository", &self.repository)
            .field("branch", &self.branch)
            .field("base_path", &self.base_path)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Module cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Time a cached module stays valid, in milliseconds.
    #[serde(default = "defaults::ttl_ms")]
    pub ttl_ms: u64,

    /// Bypass the cache for every load by default.
    #[serde(default)]
    pub no_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: defaults::ttl_ms(),
            no_cache: false,
        }
    }
}

impl CacheConfig {
    /// Get the TTL as a `Duration`.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Compress static and template responses when the client accepts it.
    #[serde(default = "defaults::compression")]
    pub compression: bool,

    /// Bodies must be strictly larger than this to be compressed.
    #[serde(default = "defaults::compress_min_bytes")]
    pub compress_min_bytes: usize,

    /// Extension routed through the template compiler.
    #[serde(default = "defaults::template_extension")]
    pub template_extension: String,

    /// Copy the origin's `etag` and `last-modified` onto static responses.
    /// Costs one metadata request per static response.
    #[serde(default)]
    pub static_validators: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            compression: defaults::compression(),
            compress_min_bytes: defaults::compress_min_bytes(),
            template_extension: defaults::template_extension(),
            static_validators: false,
        }
    }
}

/// Script engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum number of queued jobs before callers wait.
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Name of the engine thread.
    #[serde(default = "defaults::thread_name")]
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::queue_capacity(),
            thread_name: defaults::thread_name(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if a required variable is missing or
    /// a value cannot be parsed.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Arguments
    ///
    /// * `lookup` - Returns the value of a variable, or `None` if unset
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if a required variable is missing or
    /// a value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let main = lookup(ENV_MAIN_EXTERNAL)
            .ok_or_else(|| required(ENV_MAIN_EXTERNAL))
            .and_then(|v| OriginKind::parse(&v))?;

        let request_path = lookup(ENV_REQUEST_PATH)
            .ok_or_else(|| required(ENV_REQUEST_PATH))?
            .trim()
            .to_string();

        let object_store = match lookup(ENV_S3_CONNECT) {
            Some(raw) => {
                let mut parts = parse_comma(&raw).into_iter();
                let base_path = parts
                    .next()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| required(&format!("{ENV_S3_CONNECT}.basePath")))?;
                let region = parts
                    .next()
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(defaults::region);
                Some(ObjectStoreConfig {
                    base_path,
                    region,
                    access_key_id: lookup(ENV_AWS_ACCESS_KEY_ID),
                    secret_access_key: lookup(ENV_AWS_SECRET_ACCESS_KEY),
                    session_token: lookup(ENV_AWS_SESSION_TOKEN).filter(|t| !t.is_empty()),
                })
            }
            None => None,
        };

        let source_host = match lookup(ENV_GIT_CONNECT) {
            Some(raw) => {
                let parts = parse_comma(&raw);
                let field = |idx: usize, name: &str| {
                    parts
                        .get(idx)
                        .filter(|p| !p.is_empty())
                        .cloned()
                        .ok_or_else(|| required(&format!("{ENV_GIT_CONNECT}.{name}")))
                };
                Some(SourceHostConfig {
                    organization: field(0, "organization")?,
                    repository: field(1, "repo")?,
                    branch: field(2, "branch")?,
                    base_path: field(3, "basePath")?,
                    token: parts.get(4).filter(|t| !t.is_empty()).cloned(),
                })
            }
            None => None,
        };

        let mut cache = CacheConfig::default();
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            let ttl_ms: u64 = raw.trim().parse().map_err(|_| {
                RuntimeError::config(format!("{ENV_TIMEOUT} must be numeric"))
            })?;
            // Zero keeps the default lifetime.
            if ttl_ms > 0 {
                cache.ttl_ms = ttl_ms;
            }
        }
        cache.no_cache = lookup(ENV_NONE_CACHE).is_some_and(|v| is_true(&v));

        let dispatch = DispatchConfig {
            compression: !lookup(ENV_NONE_GZIP).is_some_and(|v| is_true(&v)),
            ..DispatchConfig::default()
        };

        let config = Self {
            origin: OriginConfig {
                main,
                request_path,
                object_store,
                source_host,
            },
            cache,
            dispatch,
            engine: EngineConfig::default(),
        };
        config.origin.validate()?;
        tracing::debug!(
            origin = ?config.origin.main,
            request_path = %config.origin.request_path,
            ttl_ms = config.cache.ttl_ms,
            no_cache = config.cache.no_cache,
            compression = config.dispatch.compression,
            "Runtime configuration read from environment"
        );
        Ok(config)
    }
}

fn required(name: &str) -> RuntimeError {
    RuntimeError::config(format!("{name} is a required setting"))
}

fn parse_comma(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).collect()
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Default value functions for serde.
mod defaults {
    pub fn region() -> String {
        "ap-northeast-1".to_string()
    }

    pub const fn ttl_ms() -> u64 {
        30_000
    }

    pub const fn compression() -> bool {
        true
    }

    pub const fn compress_min_bytes() -> usize {
        1024
    }

    pub fn template_extension() -> String {
        "jhtml".to_string()
    }

    pub const fn queue_capacity() -> usize {
        256
    }

    pub fn thread_name() -> String {
        "funcurl-js".to_string()
    }
}
