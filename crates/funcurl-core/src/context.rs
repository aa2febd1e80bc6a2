//! Per-request state handed to handlers and templates.
//!
//! - [`RequestContext`]: the normalized inbound request
//! - [`RequestBody`]: the classified request body
//! - [`ResponseState`]: status code and redirect target set by the handler
//!
//! All three are built fresh for each request and dropped once the response
//! envelope is assembled.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::mime::MimeResolver;

/// Default response status.
pub const DEFAULT_STATUS: u16 = 200;

/// Default status for redirects that do not name one.
pub const DEFAULT_REDIRECT_STATUS: u16 = 301;

/// A classified request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequestBody {
    /// No body was sent.
    None,
    /// A url-encoded form.
    Form {
        /// Decoded fields.
        fields: BTreeMap<String, String>,
    },
    /// A structured-data document.
    Json {
        /// Parsed value.
        value: Value,
    },
    /// A text body of another type, also read as form-encoded text.
    Text {
        /// The raw text.
        text: String,
        /// Fields found when reading the text as a form.
        fields: BTreeMap<String, String>,
    },
    /// Raw bytes that are not safe to treat as text.
    Binary {
        /// The body.
        #[serde(rename = "base64", serialize_with = "serialize_base64")]
        data: Bytes,
    },
}

fn serialize_base64<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

impl RequestBody {
    /// Returns `true` for [`RequestBody::Binary`].
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary { .. })
    }

    /// Fields this body contributes to the merged parameters.
    fn param_fields(&self) -> Map<String, Value> {
        match self {
            Self::Form { fields } | Self::Text { fields, .. } => fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            Self::Json {
                value: Value::Object(map),
            } => map.clone(),
            _ => Map::new(),
        }
    }
}

/// The normalized inbound request.
#[derive(Clone, Serialize)]
pub struct RequestContext {
    /// Upper-cased HTTP method.
    pub method: String,
    /// Request path, always starting with `/`.
    pub path: String,
    /// Headers with lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Inbound cookies; `None` marks a bare flag cookie.
    pub cookies: BTreeMap<String, Option<String>>,
    /// Decoded query parameters.
    pub query: BTreeMap<String, String>,
    /// Query parameters merged with body fields, body fields winning.
    pub params: Map<String, Value>,
    /// The classified body.
    pub body: RequestBody,
    /// `true` when the body is raw binary.
    #[serde(rename = "isBinary")]
    pub is_binary: bool,
    /// Lower-cased extension of the last path segment.
    pub extension: Option<String>,
    /// Optional lookup consulted before the built-in MIME table.
    #[serde(skip)]
    pub mime_resolver: Option<Arc<dyn MimeResolver>>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Create a bodyless request.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        let extension = crate::key::extension_of(&path);
        Self {
            method: method.into().to_ascii_uppercase(),
            path,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            query: BTreeMap::new(),
            params: Map::new(),
            body: RequestBody::None,
            is_binary: false,
            extension,
            mime_resolver: None,
        }
    }

    /// Add a header; the name is trimmed and lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.trim().to_ascii_lowercase(), value.into());
        self
    }

    /// Replace the inbound cookies.
    #[must_use]
    pub fn with_cookies(mut self, cookies: BTreeMap<String, Option<String>>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Replace the query parameters and recompute the merged parameters.
    #[must_use]
    pub fn with_query(mut self, query: BTreeMap<String, String>) -> Self {
        self.query = query;
        self.merge_params();
        self
    }

    /// Replace the body and recompute the merged parameters.
    #[must_use]
    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.is_binary = body.is_binary();
        self.body = body;
        self.merge_params();
        self
    }

    /// Attach a custom MIME resolver.
    #[must_use]
    pub fn with_mime_resolver(mut self, resolver: Arc<dyn MimeResolver>) -> Self {
        self.mime_resolver = Some(resolver);
        self
    }

    fn merge_params(&mut self) {
        let mut params: Map<String, Value> = self
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        params.extend(self.body.param_fields());
        self.params = params;
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Lower-cased media type of the request, without parameters.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Value of an inbound cookie; flag cookies yield `Some("")`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .get(name)
            .map(|v| v.as_deref().unwrap_or_default())
    }
}

/// Parse inbound cookie strings (`a=b` or bare `flag`), url-decoding both
/// name and value. Each string may hold several `;`-separated pairs.
pub fn parse_cookies<'a>(
    list: impl IntoIterator<Item = &'a str>,
) -> BTreeMap<String, Option<String>> {
    let mut cookies = BTreeMap::new();
    for entry in list {
        for pair in entry.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((name, value)) => {
                    cookies.insert(decode(name.trim()), Some(decode(value.trim())));
                }
                None => {
                    cookies.insert(decode(pair), None);
                }
            }
        }
    }
    cookies
}

/// Parse a url-encoded form or query string.
pub fn parse_form(input: &str) -> BTreeMap<String, String> {
    input
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(&k.replace('+', " ")), decode(&v.replace('+', " ")))
        })
        .collect()
}

fn decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// Status and redirect target set by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseState {
    /// HTTP status code.
    pub status: u16,
    /// Redirect target, when one was requested.
    pub redirect: Option<String>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status: DEFAULT_STATUS,
            redirect: None,
        }
    }
}

impl ResponseState {
    /// Set the status code.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Request a redirect; `status` defaults to 301.
    pub fn redirect(&mut self, url: impl Into<String>, status: Option<u16>) {
        self.redirect = Some(url.into());
        self.status = status.unwrap_or(DEFAULT_REDIRECT_STATUS);
    }

    /// Returns `true` if a redirect was requested.
    pub fn is_redirect(&self) -> bool {
        self.redirect.is_some()
    }

    /// The redirect target, if any.
    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect.as_deref()
    }
}
