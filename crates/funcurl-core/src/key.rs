//! Canonical module keys.
//!
//! A [`ModuleKey`] addresses both the cache table and the origin. It is
//! derived from the origin identity, the caller's current path and the
//! requested relative path, so any two requests naming the same absolute
//! object share one key.

use std::fmt;

use funcurl_common::RuntimeError;
use funcurl_origin::OriginIdentity;

/// Suffix of modules that are parsed as data instead of executed.
pub const DATA_SUFFIX: &str = ".json";

/// Bootstrap module names that must never load through the cache.
pub const RESERVED_MODULES: [&str; 5] = [
    "freqreg.js",
    "s3reqreg.js",
    "greqreg.js",
    "LFUSetup.js",
    "index.js",
];

/// Canonical, slash-normalized key of a module or content object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    canonical: String,
    requested: String,
}

impl ModuleKey {
    /// Derive the key for `relative_path` seen from `current_path`.
    ///
    /// A leading `/` on `relative_path` does not make it absolute: it is
    /// always resolved below `current_path`, which is itself below the
    /// identity's key prefix. `..` segments never climb above the prefix.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::Config`] if identity fields are missing or the
    ///   normalized path is empty
    /// - [`RuntimeError::ForbiddenModule`] if `relative_path` names a
    ///   reserved bootstrap module
    pub fn resolve(
        identity: &OriginIdentity,
        current_path: &str,
        relative_path: &str,
    ) -> Result<Self, RuntimeError> {
        let key = Self::content(identity, current_path, relative_path)?;
        if key.is_reserved() {
            return Err(RuntimeError::forbidden_module(key.requested));
        }
        Ok(key)
    }

    /// Derive the key of an object that is read, never executed.
    ///
    /// Same normalization as [`ModuleKey::resolve`], without the reserved
    /// name check: a static `index.js` is ordinary content.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if identity fields are missing or
    /// the normalized path is empty.
    pub fn content(
        identity: &OriginIdentity,
        current_path: &str,
        relative_path: &str,
    ) -> Result<Self, RuntimeError> {
        let prefix = identity.key_prefix()?;

        let requested = normalize_segments(&[relative_path]).join("/");
        let path = normalize_segments(&[current_path, relative_path]);
        if path.is_empty() || requested.is_empty() {
            return Err(RuntimeError::config(format!(
                "module path resolves to nothing: current={current_path:?} relative={relative_path:?}"
            )));
        }

        Ok(Self {
            canonical: format!("{prefix}/{}", path.join("/")),
            requested,
        })
    }

    /// The canonical key, `prefix/path/to/object`.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The normalized relative path the key was requested with.
    pub fn requested(&self) -> &str {
        &self.requested
    }

    /// Returns `true` if the key names a data module.
    pub fn is_data(&self) -> bool {
        self.canonical.to_ascii_lowercase().ends_with(DATA_SUFFIX)
    }

    /// Returns `true` if the requested path is a reserved bootstrap module.
    pub fn is_reserved(&self) -> bool {
        is_reserved(&self.requested)
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl AsRef<str> for ModuleKey {
    fn as_ref(&self) -> &str {
        &self.canonical
    }
}

fn normalize_segments(parts: &[&str]) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for part in parts {
        for segment in part.trim().split('/') {
            match segment.trim() {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s.to_string()),
            }
        }
    }
    segments
}

/// Check a normalized relative path against the reserved bootstrap names.
///
/// The whole path must match; a bare name without an extension is treated
/// as its `.js` module.
pub fn is_reserved(relative: &str) -> bool {
    let relative = relative.trim().trim_start_matches('/');
    let with_ext = if extension_of(relative).is_some() {
        relative.to_string()
    } else {
        format!("{relative}.js")
    };
    RESERVED_MODULES.contains(&with_ext.as_str())
}

/// Lower-cased extension of the last path segment, if any.
pub fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() && ext.is_empty() {
        return None;
    }
    let ext = ext.trim().to_ascii_lowercase();
    (!ext.is_empty()).then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> OriginIdentity {
        OriginIdentity::source_host("acme", "site", "main")
    }

    #[test]
    fn test_slash_variants_collide() {
        let a = ModuleKey::resolve(&identity(), "cur", "x.js").unwrap();
        let b = ModuleKey::resolve(&identity(), "cur/", "/x.js").unwrap();
        let c = ModuleKey::resolve(&identity(), "/cur//", "./x.js").unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.as_str(), "acme/site/main/cur/x.js");
    }

    #[test]
    fn test_parent_segments() {
        let key = ModuleKey::resolve(&identity(), "cur/sub", "../lib/y.js").unwrap();
        assert_eq!(key.as_str(), "acme/site/main/cur/lib/y.js");

        // Never climbs above the identity prefix.
        let key = ModuleKey::resolve(&identity(), "cur", "../../../z.js").unwrap();
        assert_eq!(key.as_str(), "acme/site/main/z.js");
    }

    #[test]
    fn test_object_store_prefix() {
        let id = OriginIdentity::object_store("bucket", "ap-northeast-1");
        let key = ModuleKey::resolve(&id, "app/public", "/hello.js").unwrap();
        assert_eq!(key.as_str(), "bucket/app/public/hello.js");
        assert_eq!(key.requested(), "hello.js");
    }

    #[test]
    fn test_missing_identity_fields() {
        let id = OriginIdentity::source_host("acme", "", "main");
        let err = ModuleKey::resolve(&id, "cur", "x.js").unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));

        let id = OriginIdentity::object_store("", "us-east-1");
        assert!(ModuleKey::resolve(&id, "cur", "x.js").is_err());
    }

    #[test]
    fn test_empty_path() {
        let err = ModuleKey::resolve(&identity(), "", "/").unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));

        let err = ModuleKey::resolve(&identity(), "cur", "").unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
    }

    #[test]
    fn test_reserved_names() {
        for name in ["index.js", "/index", "LFUSetup.js", "./freqreg.js", "greqreg"] {
            let err = ModuleKey::resolve(&identity(), "cur", name).unwrap_err();
            assert!(
                matches!(err, RuntimeError::ForbiddenModule { .. }),
                "{name} should be forbidden"
            );
        }
        assert!(ModuleKey::resolve(&identity(), "cur", "docs/index.js").is_ok());
        assert!(ModuleKey::resolve(&identity(), "cur", "index.json").is_ok());
    }

    #[test]
    fn test_content_keys_allow_reserved_names() {
        let key = ModuleKey::content(&identity(), "cur", "/index.js").unwrap();
        assert_eq!(key.as_str(), "acme/site/main/cur/index.js");
        assert!(key.is_reserved());

        let err = ModuleKey::content(&identity(), "cur", "/").unwrap_err();
        assert!(matches!(err, RuntimeError::Config { .. }));
    }

    #[test]
    fn test_data_suffix() {
        let key = ModuleKey::resolve(&identity(), "a", "b.JSON").unwrap();
        assert!(key.is_data());
        let key = ModuleKey::resolve(&identity(), "a", "b.js").unwrap();
        assert!(!key.is_data());
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("/a/b/c.PNG").as_deref(), Some("png"));
        assert_eq!(extension_of("/a/page.jhtml").as_deref(), Some("jhtml"));
        assert_eq!(extension_of("/a.d/hello"), None);
        assert_eq!(extension_of("/hello."), None);
        assert_eq!(extension_of("/"), None);
    }
}
