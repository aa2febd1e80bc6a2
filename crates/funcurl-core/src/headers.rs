//! Response headers and cookies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attribute appended when a cookie does not set `SameSite` itself.
pub const DEFAULT_SAME_SITE: &str = "SameSite=Lax";

/// Value of a cookie attribute: bare flag or `key=value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// A flag attribute such as `HttpOnly`; `false` omits it.
    Flag(bool),
    /// A valued attribute such as `Path=/`.
    Text(String),
}

/// A cookie to be set on the response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CookieSpec {
    /// Cookie value, not yet url-encoded.
    pub value: String,
    /// Attributes in insertion order.
    #[serde(default)]
    pub attributes: Vec<(String, AttrValue)>,
}

impl CookieSpec {
    /// Parse `"value; Path=/; HttpOnly"`.
    pub fn parse(spec: &str) -> Self {
        let mut parts = spec.split(';');
        let value = parts.next().unwrap_or_default().trim().to_string();
        let attributes = parts
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), AttrValue::Text(v.trim().to_string())),
                None => (p.to_string(), AttrValue::Flag(true)),
            })
            .collect();
        Self { value, attributes }
    }

    fn has_same_site(&self) -> bool {
        self.attributes
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("samesite"))
    }

    /// Serialize as a `set-cookie` value for `name`.
    pub fn to_set_cookie(&self, name: &str) -> String {
        let mut out = format!(
            "{}={}",
            urlencoding::encode(name),
            urlencoding::encode(&self.value)
        );
        for (key, value) in &self.attributes {
            match value {
                AttrValue::Flag(true) => {
                    out.push_str("; ");
                    out.push_str(key);
                }
                AttrValue::Flag(false) => {}
                AttrValue::Text(text) => {
                    out.push_str("; ");
                    out.push_str(key);
                    out.push('=');
                    out.push_str(text);
                }
            }
        }
        if !self.has_same_site() {
            out.push_str("; ");
            out.push_str(DEFAULT_SAME_SITE);
        }
        out
    }
}

/// Mutable, case-insensitive response header and cookie collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseHeaders {
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, CookieSpec>,
}

fn header_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

impl ResponseHeaders {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Header value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&header_key(name)).map(String::as_str)
    }

    /// Set a header, replacing any previous value.
    pub fn put(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(header_key(name), value.into());
    }

    /// Set a header only if it is not already present.
    pub fn put_if_absent(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(header_key(name))
            .or_insert_with(|| value.into());
    }

    /// Remove a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&header_key(name))
    }

    /// Returns `true` if the header is set.
    pub fn contains(&self, name: &str) -> bool {
        self.headers.contains_key(&header_key(name))
    }

    /// Header names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.headers.keys().map(String::as_str)
    }

    /// The `content-type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    /// Set the `content-type` header.
    pub fn set_content_type(&mut self, value: impl Into<String>) {
        self.put("content-type", value);
    }

    /// A cookie previously set on this response.
    pub fn cookie(&self, name: &str) -> Option<&CookieSpec> {
        self.cookies.get(name)
    }

    /// Set a cookie from structured parts.
    pub fn put_cookie(&mut self, name: impl Into<String>, cookie: CookieSpec) {
        self.cookies.insert(name.into(), cookie);
    }

    /// Set a cookie from a `"value; Attr=x; Flag"` string.
    pub fn put_cookie_str(&mut self, name: impl Into<String>, spec: &str) {
        self.put_cookie(name, CookieSpec::parse(spec));
    }

    /// Remove a cookie.
    pub fn remove_cookie(&mut self, name: &str) -> Option<CookieSpec> {
        self.cookies.remove(name)
    }

    /// Cookie names in sorted order.
    pub fn cookie_keys(&self) -> impl Iterator<Item = &str> {
        self.cookies.keys().map(String::as_str)
    }

    /// Plain headers as `(name, value)` pairs.
    pub fn to_headers(&self) -> BTreeMap<String, String> {
        self.headers.clone()
    }

    /// Cookies serialized as `set-cookie` values.
    pub fn to_cookies(&self) -> Vec<String> {
        self.cookies
            .iter()
            .map(|(name, spec)| spec.to_set_cookie(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_headers() {
        let mut headers = ResponseHeaders::new();
        headers.put(" Content-Type ", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.content_type(), Some("text/plain"));

        headers.put_if_absent("CONTENT-TYPE", "text/html");
        assert_eq!(headers.content_type(), Some("text/plain"));

        assert_eq!(headers.remove("Content-type").as_deref(), Some("text/plain"));
        assert!(!headers.contains("content-type"));
    }

    #[test]
    fn test_cookie_string_spec() {
        let mut headers = ResponseHeaders::new();
        headers.put_cookie_str("sid", "a b; Path=/; HttpOnly");

        assert_eq!(
            headers.to_cookies(),
            vec!["sid=a%20b; Path=/; HttpOnly; SameSite=Lax".to_string()]
        );
    }

    #[test]
    fn test_cookie_keeps_explicit_same_site() {
        let mut headers = ResponseHeaders::new();
        headers.put_cookie(
            "t",
            CookieSpec {
                value: "1".into(),
                attributes: vec![
                    ("samesite".into(), AttrValue::Text("Strict".into())),
                    ("Secure".into(), AttrValue::Flag(true)),
                    ("Partitioned".into(), AttrValue::Flag(false)),
                ],
            },
        );
        assert_eq!(headers.to_cookies(), vec!["t=1; samesite=Strict; Secure".to_string()]);
    }

    #[test]
    fn test_cookie_removal() {
        let mut headers = ResponseHeaders::new();
        headers.put_cookie_str("a", "1");
        headers.put_cookie_str("b", "2");
        headers.remove_cookie("a");
        assert_eq!(headers.cookie_keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(headers.cookie("b").unwrap().value, "2");
    }

    #[test]
    fn test_deserializes_script_dump() {
        let dump = serde_json::json!({
            "headers": {"x-a": "1"},
            "cookies": {"s": {"value": "v", "attributes": [["Path", "/"], ["HttpOnly", true]]}}
        });
        let headers: ResponseHeaders = serde_json::from_value(dump).unwrap();
        assert_eq!(headers.get("X-A"), Some("1"));
        assert_eq!(headers.to_cookies(), vec!["s=v; Path=/; HttpOnly; SameSite=Lax".to_string()]);
    }
}
