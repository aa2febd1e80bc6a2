//! The origin abstraction shared by every backend.
//!
//! An origin is a remote source of code and content. Each backend is
//! addressed with canonical keys whose leading segments name the origin
//! itself (see [`OriginIdentity::key_prefix`]).

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use funcurl_common::{OriginError, OriginKind, RuntimeConfig, RuntimeError};

/// Immutable descriptor of a code/content source.
///
/// Set once at startup and shared by every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginIdentity {
    /// Where the content lives.
    pub locator: OriginLocator,
    /// Optional credential used to authenticate each call.
    pub credential: Option<Credential>,
}

/// The two kinds of origin location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginLocator {
    /// A bucket in an object store.
    ObjectStore {
        /// Bucket name.
        bucket: String,
        /// Region hosting the bucket.
        region: String,
    },
    /// A branch of a repository on a source-hosting service.
    SourceHost {
        /// Organization (or user) owning the repository.
        organization: String,
        /// Repository name.
        repository: String,
        /// Branch name.
        branch: String,
    },
}

/// Credential attached to origin calls.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Long-lived key pair with an optional short-lived session token.
    AccessKey {
        /// Access key id.
        access_key_id: String,
        /// Secret access key.
        secret_access_key: String,
        /// Optional session token.
        session_token: Option<String>,
    },
    /// Bearer-style personal access token.
    Token(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessKey {
                access_key_id,
                session_token,
                ..
            } => f
                .debug_struct("AccessKey")
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"<redacted>")
                .field("session_token", &session_token.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
        }
    }
}

impl OriginIdentity {
    /// Identity of an object-store bucket.
    pub fn object_store(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            locator: OriginLocator::ObjectStore {
                bucket: bucket.into(),
                region: region.into(),
            },
            credential: None,
        }
    }

    /// Identity of a source-host repository branch.
    pub fn source_host(
        organization: impl Into<String>,
        repository: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            locator: OriginLocator::SourceHost {
                organization: organization.into(),
                repository: repository.into(),
                branch: branch.into(),
            },
            credential: None,
        }
    }

    /// Attach a credential.
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Build the identity of the configured primary origin.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the selected origin's connection
    /// parameters are missing.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        config.origin.validate()?;
        match config.origin.main {
            OriginKind::ObjectStore => {
                let conn = config
                    .origin
                    .object_store
                    .as_ref()
                    .ok_or_else(|| RuntimeError::config("object store connection missing"))?;
                let bucket = conn
                    .bucket()
                    .ok_or_else(|| RuntimeError::config("object store bucket missing"))?;
                let identity = Self::object_store(bucket, conn.region.clone());
                Ok(match (&conn.access_key_id, &conn.secret_access_key) {
                    (Some(id), Some(secret)) => identity.with_credential(Credential::AccessKey {
                        access_key_id: id.clone(),
                        secret_access_key: secret.clone(),
                        session_token: conn.session_token.clone(),
                    }),
                    _ => identity,
                })
            }
            OriginKind::SourceHost => {
                let conn = config
                    .origin
                    .source_host
                    .as_ref()
                    .ok_or_else(|| RuntimeError::config("source host connection missing"))?;
                let identity = Self::source_host(
                    conn.organization.clone(),
                    conn.repository.clone(),
                    conn.branch.clone(),
                );
                Ok(match &conn.token {
                    Some(token) => identity.with_credential(Credential::Token(token.clone())),
                    None => identity,
                })
            }
        }
    }

    /// Leading key segments naming this origin: `bucket` or `org/repo/branch`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if any identity field is blank.
    pub fn key_prefix(&self) -> Result<String, RuntimeError> {
        match &self.locator {
            OriginLocator::ObjectStore { bucket, .. } => {
                let bucket = bucket.trim().trim_matches('/');
                if bucket.is_empty() {
                    return Err(RuntimeError::config("object store bucket is not set"));
                }
                Ok(bucket.to_string())
            }
            OriginLocator::SourceHost {
                organization,
                repository,
                branch,
            } => {
                let parts = [organization, repository, branch]
                    .map(|p| p.trim().trim_matches('/').to_string());
                if let Some(idx) = parts.iter().position(String::is_empty) {
                    let field = ["organization", "repository", "branch"][idx];
                    return Err(RuntimeError::config(format!(
                        "source host {field} is not set"
                    )));
                }
                Ok(parts.join("/"))
            }
        }
    }

    /// Returns `true` for object-store identities.
    pub fn is_object_store(&self) -> bool {
        matches!(self.locator, OriginLocator::ObjectStore { .. })
    }
}

/// Result of a metadata-only request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadMeta {
    /// Upstream HTTP status.
    pub status: u16,
    /// Response headers with lower-cased names.
    pub headers: Vec<(String, String)>,
}

impl HeadMeta {
    /// Look up a header value by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A remote source of code and content.
///
/// Implementations perform exactly one request per call and never retry.
#[async_trait]
pub trait OriginBackend: Send + Sync {
    /// The identity this backend serves.
    fn identity(&self) -> &OriginIdentity;

    /// Fetch the object at a canonical key.
    ///
    /// # Errors
    ///
    /// Returns [`OriginError::Status`] when the origin answers with a
    /// non-success status, or another [`OriginError`] if no answer arrived.
    async fn fetch_bytes(&self, path: &str) -> Result<Bytes, OriginError>;

    /// Fetch only the metadata of the object at a canonical key.
    ///
    /// A missing object is reported through [`HeadMeta::status`], not as an error.
    async fn head_meta(&self, path: &str) -> Result<HeadMeta, OriginError>;
}

/// Split a canonical key into its identity prefix and the remainder.
///
/// # Errors
///
/// Returns [`OriginError::InvalidPath`] if the key does not start with the
/// identity's prefix.
pub fn strip_identity_prefix<'a>(
    identity: &OriginIdentity,
    path: &'a str,
) -> Result<&'a str, OriginError> {
    let prefix = identity
        .key_prefix()
        .map_err(|_| OriginError::InvalidPath { path: path.into() })?;
    let trimmed = path.trim_start_matches('/');
    trimmed
        .strip_prefix(prefix.as_str())
        .and_then(|rest| {
            if rest.is_empty() {
                Some(rest)
            } else {
                rest.strip_prefix('/')
            }
        })
        .ok_or_else(|| OriginError::InvalidPath { path: path.into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefix() {
        let id = OriginIdentity::object_store("bucket", "us-east-1");
        assert_eq!(id.key_prefix().unwrap(), "bucket");

        let id = OriginIdentity::source_host("acme", "site", "main");
        assert_eq!(id.key_prefix().unwrap(), "acme/site/main");
    }

    #[test]
    fn test_key_prefix_requires_fields() {
        let id = OriginIdentity::object_store("  ", "us-east-1");
        assert!(matches!(id.key_prefix(), Err(RuntimeError::Config { .. })));

        let id = OriginIdentity::source_host("acme", "", "main");
        let err = id.key_prefix().unwrap_err();
        assert!(err.to_string().contains("repository"));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::AccessKey {
            access_key_id: "AKID".into(),
            secret_access_key: "secret-value".into(),
            session_token: Some("token-value".into()),
        };
        let debug = format!("{cred:?}");
        assert!(debug.contains("AKID"));
        assert!(!debug.contains("secret-value"));
        assert!(!debug.contains("token-value"));

        assert!(!format!("{:?}", Credential::Token("ghp_abc".into())).contains("ghp_abc"));
    }

    #[test]
    fn test_strip_identity_prefix() {
        let id = OriginIdentity::source_host("acme", "site", "main");
        assert_eq!(
            strip_identity_prefix(&id, "acme/site/main/src/a.js").unwrap(),
            "src/a.js"
        );
        assert!(strip_identity_prefix(&id, "acme/site/mainline/a.js").is_err());
        assert!(strip_identity_prefix(&id, "other/site/main/a.js").is_err());
    }

    #[test]
    fn test_from_config() {
        let config = RuntimeConfig::from_lookup(|name| match name {
            "MAIN_EXTERNAL" => Some("s3".into()),
            "REQUEST_PATH" => Some("public".into()),
            "S3_CONNECT" => Some("bucket/app, us-east-1".into()),
            "AWS_ACCESS_KEY_ID" => Some("AKID".into()),
            "AWS_SECRET_ACCESS_KEY" => Some("secret".into()),
            _ => None,
        })
        .unwrap();

        let id = OriginIdentity::from_config(&config).unwrap();
        assert!(id.is_object_store());
        assert_eq!(id.key_prefix().unwrap(), "bucket");
        assert!(matches!(id.credential, Some(Credential::AccessKey { .. })));
    }

    #[test]
    fn test_head_meta_header_lookup() {
        let meta = HeadMeta {
            status: 200,
            headers: vec![("etag".into(), "abc".into())],
        };
        assert_eq!(meta.header("ETag"), Some("abc"));
        assert_eq!(meta.header("last-modified"), None);
    }
}
