//! Object-store origin reached through its signed REST protocol.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::instrument;

use funcurl_common::OriginError;

use crate::backend::{HeadMeta, OriginBackend, OriginIdentity, OriginLocator, strip_identity_prefix};
use crate::client::{HttpMethod, OriginClient, OriginRequest};
use crate::sigv4::{self, SigningKeys, SigningRequest};
use crate::Credential;

/// Origin backed by an object-store bucket.
///
/// Canonical keys look like `bucket/path/to/object`; the first segment must
/// be the identity's bucket.
pub struct ObjectStoreOrigin {
    identity: OriginIdentity,
    client: OriginClient,
    endpoint: Option<String>,
}

impl ObjectStoreOrigin {
    /// Create a backend for an object-store identity.
    ///
    /// # Errors
    ///
    /// Returns [`OriginError::InvalidPath`] if the identity is not an object
    /// store, or a transport error if the HTTP client cannot be built.
    pub fn new(identity: OriginIdentity) -> Result<Self, OriginError> {
        Self::with_client(identity, OriginClient::new()?)
    }

    /// Create with a custom HTTP client.
    pub fn with_client(identity: OriginIdentity, client: OriginClient) -> Result<Self, OriginError> {
        if !identity.is_object_store() {
            return Err(OriginError::InvalidPath {
                path: "identity is not an object store".into(),
            });
        }
        Ok(Self {
            identity,
            client,
            endpoint: None,
        })
    }

    /// Send requests to `endpoint` (scheme and host) instead of the
    /// virtual-hosted bucket address.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn bucket_and_region(&self) -> (&str, &str) {
        match &self.identity.locator {
            OriginLocator::ObjectStore { bucket, region } => (bucket, region),
            OriginLocator::SourceHost { .. } => ("", ""),
        }
    }

    /// Virtual-hosted host name of the bucket.
    pub fn host(&self) -> String {
        let (bucket, region) = self.bucket_and_region();
        if region == "us-east-1" {
            format!("{bucket}.s3.amazonaws.com")
        } else {
            format!("{bucket}.s3-{region}.amazonaws.com")
        }
    }

    fn request(&self, method: HttpMethod, path: &str) -> Result<OriginRequest, OriginError> {
        let key = strip_identity_prefix(&self.identity, path)?;
        if key.is_empty() {
            return Err(OriginError::InvalidPath { path: path.into() });
        }
        let host = self.host();
        let object_path = sigv4::canonical_uri(key);
        let headers = match &self.identity.credential {
            Some(Credential::AccessKey {
                access_key_id,
                secret_access_key,
                session_token,
            }) => sigv4::sign(
                &SigningRequest {
                    method: method.as_str(),
                    host: &host,
                    path: key,
                    region: self.bucket_and_region().1,
                    service: "s3",
                },
                SigningKeys {
                    access_key_id,
                    secret_access_key,
                    session_token: session_token.as_deref(),
                },
                Utc::now(),
            )?,
            Some(Credential::Token(_)) | None => {
                return Err(OriginError::Credentials {
                    reason: "object store requests need an access key".into(),
                });
            }
        };
        let base = self
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{host}"));
        Ok(OriginRequest {
            method,
            url: format!("{}{object_path}", base.trim_end_matches('/')),
            headers,
        })
    }
}

#[async_trait]
impl OriginBackend for ObjectStoreOrigin {
    fn identity(&self) -> &OriginIdentity {
        &self.identity
    }

    #[instrument(skip(self), fields(origin = "object_store"))]
    async fn fetch_bytes(&self, path: &str) -> Result<Bytes, OriginError> {
        let request = self.request(HttpMethod::Get, path)?;
        self.client.get(path, request.url, request.headers).await
    }

    #[instrument(skip(self), fields(origin = "object_store"))]
    async fn head_meta(&self, path: &str) -> Result<HeadMeta, OriginError> {
        let request = self.request(HttpMethod::Head, path)?;
        let response = self.client.send(path, request).await?;
        Ok(HeadMeta {
            status: response.status,
            headers: response.headers,
        })
    }
}
