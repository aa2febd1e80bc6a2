//! Extension to content-type table.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Serialize;

/// Content type used when an extension is unknown.
pub const FALLBACK_MIME: &str = "application/octet-stream";

/// A resolved content type and whether it is worth compressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MimeEntry {
    /// The `content-type` value.
    #[serde(rename = "type")]
    pub content_type: String,
    /// `true` if the payload compresses well.
    pub gz: bool,
}

impl MimeEntry {
    fn new(content_type: &str, gz: bool) -> Self {
        Self {
            content_type: content_type.to_string(),
            gz,
        }
    }

    /// The entry served for unknown extensions.
    pub fn fallback() -> Self {
        Self::new(FALLBACK_MIME, false)
    }
}

static TABLE: LazyLock<HashMap<&'static str, MimeEntry>> = LazyLock::new(|| {
    [
        ("txt", "text/plain", true),
        ("text", "text/plain", true),
        ("htm", "text/html", true),
        ("html", "text/html", true),
        ("xhtml", "application/xhtml+xml", true),
        ("xml", "text/xml", true),
        ("json", "application/json", true),
        ("rss", "application/rss+xml", true),
        ("css", "text/css", true),
        ("js", "text/javascript", true),
        ("csv", "text/csv", true),
        ("svg", "image/svg+xml", true),
        ("gif", "image/gif", false),
        ("jpg", "image/jpeg", false),
        ("jpeg", "image/jpeg", false),
        ("png", "image/png", false),
        ("ico", "image/vnd.microsoft.icon", false),
        ("webp", "image/webp", false),
        ("pdf", "application/pdf", false),
        ("zip", "application/zip", false),
        ("woff", "font/woff", false),
        ("woff2", "font/woff2", false),
    ]
    .into_iter()
    .map(|(ext, ty, gz)| (ext, MimeEntry::new(ty, gz)))
    .collect()
});

/// Look up an extension (with or without the leading dot) in the table.
pub fn lookup(extension: &str) -> Option<MimeEntry> {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    TABLE.get(ext.as_str()).cloned()
}

/// Caller-supplied MIME lookup consulted before the built-in table.
pub trait MimeResolver: Send + Sync {
    /// Return an entry for `extension`, or `None` to defer to the table.
    fn resolve(&self, extension: &str) -> Option<MimeEntry>;
}

/// Resolve an extension: custom resolver, then the table, then the
/// octet-stream fallback.
pub fn resolve(custom: Option<&dyn MimeResolver>, extension: &str) -> MimeEntry {
    custom
        .and_then(|r| r.resolve(extension))
        .or_else(|| lookup(extension))
        .unwrap_or_else(MimeEntry::fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Custom;

    impl MimeResolver for Custom {
        fn resolve(&self, extension: &str) -> Option<MimeEntry> {
            (extension == "wasm").then(|| MimeEntry::new("application/wasm", true))
        }
    }

    #[test]
    fn test_table_lookup() {
        let html = lookup(".HTML").unwrap();
        assert_eq!(html.content_type, "text/html");
        assert!(html.gz);

        let png = lookup("png").unwrap();
        assert_eq!(png.content_type, "image/png");
        assert!(!png.gz);

        assert!(lookup("unknown").is_none());
    }

    #[test]
    fn test_resolution_order() {
        assert_eq!(resolve(Some(&Custom), "wasm").content_type, "application/wasm");
        assert_eq!(resolve(Some(&Custom), "css").content_type, "text/css");
        assert_eq!(resolve(None, "wasm"), MimeEntry::fallback());
    }

    #[test]
    fn test_entry_serializes_as_script_shape() {
        let json = serde_json::to_value(lookup("png").unwrap()).unwrap();
        assert_eq!(json["type"], "image/png");
        assert_eq!(json["gz"], false);
    }
}
