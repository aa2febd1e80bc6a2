//! Source-host origin reached through its raw-content API.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

use funcurl_common::OriginError;

use crate::backend::{HeadMeta, OriginBackend, OriginIdentity};
use crate::client::{HttpMethod, OriginClient, OriginRequest};
use crate::Credential;

/// Default raw-content endpoint.
pub const RAW_CONTENT_BASE: &str = "https://raw.githubusercontent.com";

/// Origin backed by a repository branch on a source-hosting service.
///
/// Canonical keys (`org/repo/branch/path`) map directly onto the
/// raw-content URL space.
pub struct SourceHostOrigin {
    identity: OriginIdentity,
    client: OriginClient,
    base_url: String,
}

impl SourceHostOrigin {
    /// Create a backend for a source-host identity.
    ///
    /// # Errors
    ///
    /// Returns [`OriginError::InvalidPath`] if the identity is not a source
    /// host, or a transport error if the HTTP client cannot be built.
    pub fn new(identity: OriginIdentity) -> Result<Self, OriginError> {
        Self::with_client(identity, OriginClient::new()?)
    }

    /// Create with a custom HTTP client.
    pub fn with_client(identity: OriginIdentity, client: OriginClient) -> Result<Self, OriginError> {
        if identity.is_object_store() {
            return Err(OriginError::InvalidPath {
                path: "identity is not a source host".into(),
            });
        }
        Ok(Self {
            identity,
            client,
            base_url: RAW_CONTENT_BASE.to_string(),
        })
    }

    /// Override the raw-content base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request(&self, method: HttpMethod, path: &str) -> Result<OriginRequest, OriginError> {
        let canonical = path.trim_start_matches('/');
        if canonical.is_empty() || canonical.split('/').any(|s| s == "..") {
            return Err(OriginError::InvalidPath { path: path.into() });
        }
        let url = url::Url::parse(&format!(
            "{}/{canonical}",
            self.base_url.trim_end_matches('/')
        ))
        .map_err(|_| OriginError::InvalidPath { path: path.into() })?;

        let mut headers = Vec::new();
        if let Some(Credential::Token(token)) = &self.identity.credential {
            headers.push(("authorization".to_string(), format!("token {token}")));
        }
        Ok(OriginRequest {
            method,
            url: url.to_string(),
            headers,
        })
    }
}

#[async_trait]
impl OriginBackend for SourceHostOrigin {
    fn identity(&self) -> &OriginIdentity {
        &self.identity
    }

    #[instrument(skip(self), fields(origin = "source_host"))]
    async fn fetch_bytes(&self, path: &str) -> Result<Bytes, OriginError> {
        let request = self.request(HttpMethod::Get, path)?;
        self.client.get(path, request.url, request.headers).await
    }

    #[instrument(skip(self), fields(origin = "source_host"))]
    async fn head_meta(&self, path: &str) -> Result<HeadMeta, OriginError> {
        let request = self.request(HttpMethod::Head, path)?;
        let response = self.client.send(path, request).await?;
        Ok(HeadMeta {
            status: response.status,
            headers: response.headers,
        })
    }
}
