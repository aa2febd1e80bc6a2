//! Shared HTTP client for the network origins.
//!
//! Both network backends send their requests through [`OriginClient`],
//! which owns a pooled `reqwest` client and turns every exchange into
//! exactly one request.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, info};

use funcurl_common::OriginError;

/// Pooled HTTP client used by the network origins.
#[derive(Debug, Clone)]
pub struct OriginClient {
    /// HTTP client (shared, connection pooled).
    client: Client,
}

/// Request sent to an origin.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Target URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
}

/// Response received from an origin.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lower-cased names.
    pub headers: Vec<(String, String)>,
    /// Response body (empty for HEAD).
    pub body: Bytes,
}

/// Methods used against origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
}

impl HttpMethod {
    /// Convert to reqwest method.
    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    /// Upper-case method name, as used in request signing.
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl OriginClient {
    /// Create a new client with reasonable defaults.
    ///
    /// # Errors
    ///
    /// Returns [`OriginError::Transport`] if the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, OriginError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("funcurl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OriginError::transport("", e.to_string()))?;

        Ok(Self { client })
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Perform one request.
    ///
    /// # Arguments
    ///
    /// * `path` - Canonical key the request is for (used in errors and logs)
    /// * `request` - The request to send
    ///
    /// # Returns
    ///
    /// The response whatever its status; callers decide what counts as
    /// success.
    pub async fn send(
        &self,
        path: &str,
        request: OriginRequest,
    ) -> Result<OriginResponse, OriginError> {
        debug!(
            method = request.method.as_str(),
            url = %request.url,
            "Executing origin request"
        );

        let mut req_builder = self
            .client
            .request(request.method.to_reqwest(), &request.url);
        for (key, value) in &request.headers {
            req_builder = req_builder.header(key, value);
        }

        let response = req_builder.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                format!("connection failed: {e}")
            } else {
                e.to_string()
            };
            OriginError::transport(path, reason)
        })?;

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = if request.method == HttpMethod::Head {
            Bytes::new()
        } else {
            response
                .bytes()
                .await
                .map_err(|e| OriginError::transport(path, e.to_string()))?
        };

        info!(
            path,
            status,
            body_size = body.len(),
            "Origin request completed"
        );

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }

    /// GET a canonical key, mapping status >= 400 to [`OriginError::Status`].
    pub async fn get(
        &self,
        path: &str,
        url: String,
        headers: Vec<(String, String)>,
    ) -> Result<Bytes, OriginError> {
        let response = self
            .send(
                path,
                OriginRequest {
                    method: HttpMethod::Get,
                    url,
                    headers,
                },
            )
            .await?;

        if response.status >= 400 {
            return Err(OriginError::status(path, response.status));
        }
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_method_conversion() {
        assert_eq!(HttpMethod::Get.to_reqwest(), reqwest::Method::GET);
        assert_eq!(HttpMethod::Head.to_reqwest(), reqwest::Method::HEAD);
        assert_eq!(HttpMethod::Head.as_str(), "HEAD");
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_transport_error() {
        let client = OriginClient::new().unwrap();

        // Port 9 on the loopback interface has no listener.
        let result = client
            .get("bucket/a.js", "http://127.0.0.1:9/a.js".into(), vec![])
            .await;

        assert!(matches!(result, Err(OriginError::Transport { .. })));
    }
}
