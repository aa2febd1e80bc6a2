//! Inbound Function URL events and their normalization.
//!
//! An [`InboundEvent`] is the JSON payload delivered for one invocation.
//! [`normalize`] turns it into a [`RequestContext`], classifying the body as
//! absent, form, structured data, text or binary.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use funcurl_common::RuntimeError;
use funcurl_core::context::{RequestBody, RequestContext, parse_cookies, parse_form};

/// Content type of url-encoded forms.
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Content type of structured data.
pub const JSON: &str = "application/json";

/// HTTP details of the invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpDetails {
    /// Request method.
    #[serde(default)]
    pub method: String,
    /// Request path.
    #[serde(default)]
    pub path: String,
}

/// Invocation context carried with the event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// HTTP details.
    #[serde(default)]
    pub http: HttpDetails,
}

/// One inbound Function URL event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Path without the query string.
    #[serde(default)]
    pub raw_path: String,
    /// Raw query string without the leading `?`.
    #[serde(default)]
    pub raw_query_string: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Cookies, one `name=value` per entry.
    #[serde(default)]
    pub cookies: Vec<String>,
    /// Decoded query parameters, used when `raw_query_string` is empty.
    #[serde(default)]
    pub query_string_parameters: Option<BTreeMap<String, String>>,
    /// Invocation context.
    #[serde(default)]
    pub request_context: EventContext,
    /// Body, base64 when `is_base64_encoded`.
    #[serde(default)]
    pub body: Option<String>,
    /// Whether `body` is base64.
    #[serde(default)]
    pub is_base64_encoded: bool,
}

impl InboundEvent {
    /// Create a bodyless event.
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            raw_path: path.to_string(),
            request_context: EventContext {
                http: HttpDetails {
                    method: method.to_string(),
                    path: path.to_string(),
                },
            },
            ..Self::default()
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Set the raw query string.
    #[must_use]
    pub fn with_query(mut self, query: &str) -> Self {
        self.raw_query_string = query.trim_start_matches('?').to_string();
        self
    }

    /// Set a text body.
    #[must_use]
    pub fn with_text_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self.is_base64_encoded = false;
        self
    }

    /// Set a binary body, base64-encoded.
    #[must_use]
    pub fn with_binary_body(mut self, body: &[u8]) -> Self {
        self.body = Some(STANDARD.encode(body));
        self.is_base64_encoded = true;
        self
    }

    fn method(&self) -> String {
        let method = self.request_context.http.method.trim();
        if method.is_empty() {
            "GET".to_string()
        } else {
            method.to_ascii_uppercase()
        }
    }

    fn path(&self) -> &str {
        if self.raw_path.is_empty() {
            &self.request_context.http.path
        } else {
            &self.raw_path
        }
    }
}

/// Methods whose body is ignored.
fn is_bodyless(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS")
}

/// Text-safe bytes: valid UTF-8 without control characters other than
/// whitespace.
pub fn is_text_safe(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok_and(|text| {
        text.chars()
            .all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
    })
}

/// Build the request context for an event.
///
/// # Errors
///
/// Returns [`RuntimeError::InvalidRequest`] if a base64 body does not decode
/// or a structured-data body does not parse.
pub fn normalize(event: &InboundEvent) -> Result<RequestContext, RuntimeError> {
    let method = event.method();
    let mut request = RequestContext::new(&method, event.path());

    for (name, value) in &event.headers {
        request = request.with_header(name, value.clone());
    }

    let cookies = if event.cookies.is_empty() {
        parse_cookies(request.header("cookie"))
    } else {
        parse_cookies(event.cookies.iter().map(String::as_str))
    };
    request = request.with_cookies(cookies);

    let query = if event.raw_query_string.is_empty() {
        event.query_string_parameters.clone().unwrap_or_default()
    } else {
        parse_form(&event.raw_query_string)
    };
    request = request.with_query(query);

    if is_bodyless(&method) {
        return Ok(request);
    }
    let Some(raw) = event.body.as_deref().filter(|b| !b.is_empty()) else {
        return Ok(request);
    };

    let data = if event.is_base64_encoded {
        Bytes::from(
            STANDARD
                .decode(raw.trim())
                .map_err(|e| RuntimeError::invalid_request(format!("bad base64 body: {e}")))?,
        )
    } else {
        Bytes::from(raw.to_string())
    };

    let body = classify_body(request.content_type().as_deref(), data)?;
    Ok(request.with_body(body))
}

fn classify_body(content_type: Option<&str>, data: Bytes) -> Result<RequestBody, RuntimeError> {
    let content_type = content_type.unwrap_or_default();

    if content_type == FORM_URLENCODED {
        return Ok(RequestBody::Form {
            fields: parse_form(&String::from_utf8_lossy(&data)),
        });
    }

    if content_type == JSON || content_type.ends_with("+json") {
        let value = serde_json::from_slice(&data)
            .map_err(|e| RuntimeError::invalid_request(format!("bad structured body: {e}")))?;
        return Ok(RequestBody::Json { value });
    }

    if content_type.starts_with("text/") || is_text_safe(&data) {
        let text = String::from_utf8_lossy(&data).into_owned();
        let fields = parse_form(&text);
        return Ok(RequestBody::Text { text, fields });
    }

    Ok(RequestBody::Binary { data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_ignores_body() {
        let event = InboundEvent::new("get", "/hello")
            .with_query("a=1&b=x%20y")
            .with_text_body("ignored=1");
        let request = normalize(&event).unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/hello");
        assert_eq!(request.body, RequestBody::None);
        assert_eq!(request.params["b"], "x y");
    }

    #[test]
    fn test_query_parameters_fallback() {
        let mut event = InboundEvent::new("GET", "/q");
        event.query_string_parameters = Some([("k".to_string(), "v".to_string())].into());
        assert_eq!(normalize(&event).unwrap().query["k"], "v");
    }

    #[test]
    fn test_form_body() {
        let event = InboundEvent::new("POST", "/form")
            .with_header("Content-Type", "application/x-www-form-urlencoded; charset=utf-8")
            .with_text_body("name=a+b&n=1");
        let request = normalize(&event).unwrap();

        assert!(matches!(request.body, RequestBody::Form { .. }));
        assert_eq!(request.params["name"], "a b");
    }

    #[test]
    fn test_json_body_from_base64() {
        let event = InboundEvent::new("POST", "/api")
            .with_header("content-type", "application/json")
            .with_binary_body(br#"{"a":1}"#);
        let request = normalize(&event).unwrap();

        assert_eq!(
            request.body,
            RequestBody::Json {
                value: serde_json::json!({"a": 1})
            }
        );
        assert_eq!(request.params["a"], 1);
    }

    #[test]
    fn test_invalid_json_body() {
        let event = InboundEvent::new("POST", "/api")
            .with_header("content-type", "application/json")
            .with_text_body("{oops");
        assert!(matches!(
            normalize(&event),
            Err(RuntimeError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_text_and_binary_bodies() {
        let text = InboundEvent::new("PUT", "/t").with_binary_body(b"k=v\nplain text");
        let request = normalize(&text).unwrap();
        assert!(matches!(request.body, RequestBody::Text { .. }));
        assert!(!request.is_binary);

        let binary = InboundEvent::new("PUT", "/b").with_binary_body(&[0x89, b'P', b'N', b'G', 0, 1]);
        let request = normalize(&binary).unwrap();
        assert!(request.is_binary);
        assert_eq!(
            request.body,
            RequestBody::Binary {
                data: Bytes::from_static(&[0x89, b'P', b'N', b'G', 0, 1])
            }
        );
    }

    #[test]
    fn test_cookies_from_list_or_header() {
        let mut event = InboundEvent::new("GET", "/");
        event.cookies = vec!["a=1".into(), "b=x%3Dy".into()];
        let request = normalize(&event).unwrap();
        assert_eq!(request.cookie("b"), Some("x=y"));

        let event = InboundEvent::new("GET", "/").with_header("Cookie", "c=3; d=4");
        let request = normalize(&event).unwrap();
        assert_eq!(request.cookie("d"), Some("4"));
    }

    #[test]
    fn test_deserializes_function_url_payload() {
        let event: InboundEvent = serde_json::from_value(serde_json::json!({
            "rawPath": "/hello",
            "rawQueryString": "x=1",
            "headers": {"accept-encoding": "gzip"},
            "requestContext": {"http": {"method": "POST", "path": "/hello"}},
            "body": "aGk=",
            "isBase64Encoded": true
        }))
        .unwrap();
        let request = normalize(&event).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.query["x"], "1");
        assert!(matches!(request.body, RequestBody::Text { ref text, .. } if text == "hi"));
    }

    #[test]
    fn test_is_text_safe() {
        assert!(is_text_safe("héllo\r\n\tworld".as_bytes()));
        assert!(!is_text_safe(b"a\0b"));
        assert!(!is_text_safe(&[0xff, 0xfe]));
    }
}
