//! Function URL response envelopes.
//!
//! A [`ResponseEnvelope`] is what one invocation returns: status, headers,
//! cookies and an optional body that is base64 when `is_base64_encoded`.
//! The simulation server turns it into an HTTP response with
//! [`ResponseEnvelope::into_axum_response`].

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use funcurl_core::ResponseHeaders;
use funcurl_core::mime;

use crate::status::{error_body, not_found_body};

/// The outbound envelope of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lower-cased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// `set-cookie` values.
    #[serde(default)]
    pub cookies: Vec<String>,
    /// Whether `body` is base64.
    #[serde(default)]
    pub is_base64_encoded: bool,
    /// Body, absent for redirects and empty responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ResponseEnvelope {
    /// Build an envelope from response headers and a body.
    ///
    /// Text bodies are carried as-is, binary bodies base64-encoded.
    pub fn new(status_code: u16, headers: &ResponseHeaders, body: EnvelopeBody) -> Self {
        let (body, is_base64_encoded) = match body {
            EnvelopeBody::Empty => (None, false),
            EnvelopeBody::Text(text) => (Some(text), false),
            EnvelopeBody::Binary(data) => (Some(STANDARD.encode(&data)), true),
        };
        Self {
            status_code,
            headers: headers.to_headers(),
            cookies: headers.to_cookies(),
            is_base64_encoded,
            body,
        }
    }

    /// A plain-text response with fresh headers.
    pub fn text(status_code: u16, body: String) -> Self {
        let mut headers = ResponseHeaders::new();
        headers.set_content_type(plain_text());
        headers.put("content-length", body.len().to_string());
        Self::new(status_code, &headers, EnvelopeBody::Text(body))
    }

    /// The generic 404 for missing static content.
    pub fn not_found() -> Self {
        Self::text(404, not_found_body())
    }

    /// The generic 500; never carries error detail.
    pub fn internal_error() -> Self {
        Self::text(500, error_body(500))
    }

    /// Get a header by lower-case name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Decode the body to bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if a base64 body is malformed.
    pub fn body_bytes(&self) -> Result<Bytes, base64::DecodeError> {
        match &self.body {
            None => Ok(Bytes::new()),
            Some(body) if self.is_base64_encoded => Ok(Bytes::from(STANDARD.decode(body)?)),
            Some(body) => Ok(Bytes::from(body.clone())),
        }
    }

    /// Convert to an Axum response.
    ///
    /// Invalid header names or values are skipped with a warning; every
    /// cookie becomes its own `set-cookie` header.
    pub fn into_axum_response(self) -> Response<Body> {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match self.body_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Envelope body is not valid base64");
                return Self::internal_error().into_axum_response();
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid response header"),
            }
        }
        for cookie in &self.cookies {
            match HeaderValue::try_from(cookie.as_str()) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(_) => warn!("Skipping invalid set-cookie value"),
            }
        }

        response
    }
}

/// Body handed to [`ResponseEnvelope::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeBody {
    /// No body.
    Empty,
    /// UTF-8 text.
    Text(String),
    /// Arbitrary bytes.
    Binary(Bytes),
}

impl EnvelopeBody {
    /// Length in bytes.
    pub fn len(&self) -> usize {
        match self {
            EnvelopeBody::Empty => 0,
            EnvelopeBody::Text(text) => text.len(),
            EnvelopeBody::Binary(data) => data.len(),
        }
    }

    /// Returns `true` if the body has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The `text` MIME type.
pub(crate) fn plain_text() -> String {
    mime::resolve(None, "text").content_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_envelope() {
        let envelope = ResponseEnvelope::text(200, "Hello".into());
        assert_eq!(envelope.status_code, 200);
        assert_eq!(envelope.header("content-type"), Some("text/plain"));
        assert_eq!(envelope.header("content-length"), Some("5"));
        assert_eq!(envelope.body.as_deref(), Some("Hello"));
        assert!(!envelope.is_base64_encoded);
    }

    #[test]
    fn test_generic_errors() {
        assert_eq!(ResponseEnvelope::not_found().body.as_deref(), Some("[error]404 Not Found"));
        let err = ResponseEnvelope::internal_error();
        assert_eq!(err.status_code, 500);
        assert_eq!(err.body.as_deref(), Some("error 500: Internal Server Error"));
    }

    #[test]
    fn test_binary_body_roundtrip() {
        let envelope = ResponseEnvelope::new(
            200,
            &ResponseHeaders::new(),
            EnvelopeBody::Binary(Bytes::from_static(&[0, 1, 2, 255])),
        );
        assert!(envelope.is_base64_encoded);
        assert_eq!(envelope.body_bytes().unwrap(), Bytes::from_static(&[0, 1, 2, 255]));
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(ResponseEnvelope::new(
            302,
            &ResponseHeaders::new(),
            EnvelopeBody::Empty,
        ))
        .unwrap();
        assert_eq!(json["statusCode"], 302);
        assert_eq!(json["isBase64Encoded"], false);
        assert!(json.get("body").is_none());
    }

    #[test]
    fn test_into_axum_response() {
        let mut headers = ResponseHeaders::new();
        headers.put("x-a", "1");
        headers.put_cookie_str("a", "1; Path=/");
        headers.put_cookie_str("b", "2");
        let envelope = ResponseEnvelope::new(201, &headers, EnvelopeBody::Text("ok".into()));

        let response = envelope.into_axum_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-a"], "1");
        assert_eq!(response.headers().get_all(SET_COOKIE).iter().count(), 2);
    }
}
