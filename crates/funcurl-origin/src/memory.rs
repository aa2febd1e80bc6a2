//! In-memory origin.
//!
//! Objects live in a map keyed by canonical path, and every fetch is
//! counted, which makes cache behavior observable.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use funcurl_common::OriginError;

use crate::backend::{HeadMeta, OriginBackend, OriginIdentity};

/// Origin backed by a concurrent map.
#[derive(Clone)]
pub struct MemoryOrigin {
    identity: OriginIdentity,
    objects: Arc<DashMap<String, Bytes>>,
    fetches: Arc<DashMap<String, usize>>,
    total: Arc<AtomicUsize>,
}

impl MemoryOrigin {
    /// Create an empty origin for an identity.
    pub fn new(identity: OriginIdentity) -> Self {
        Self {
            identity,
            objects: Arc::new(DashMap::new()),
            fetches: Arc::new(DashMap::new()),
            total: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Store (or replace) an object.
    pub fn put(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.insert(normalize(&path.into()), data.into());
    }

    /// Remove an object.
    pub fn remove(&self, path: &str) {
        self.objects.remove(&normalize(path));
    }

    /// Number of `fetch_bytes` calls made for a path, hits and misses alike.
    pub fn fetch_count(&self, path: &str) -> usize {
        self.fetches.get(&normalize(path)).map_or(0, |c| *c)
    }

    /// Number of `fetch_bytes` calls made for any path.
    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[async_trait]
impl OriginBackend for MemoryOrigin {
    fn identity(&self) -> &OriginIdentity {
        &self.identity
    }

    async fn fetch_bytes(&self, path: &str) -> Result<Bytes, OriginError> {
        let key = normalize(path);
        *self.fetches.entry(key.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        self.objects
            .get(&key)
            .map(|data| data.clone())
            .ok_or_else(|| OriginError::status(path, 404))
    }

    async fn head_meta(&self, path: &str) -> Result<HeadMeta, OriginError> {
        Ok(match self.objects.get(&normalize(path)) {
            Some(data) => HeadMeta {
                status: 200,
                headers: vec![("content-length".into(), data.len().to_string())],
            },
            None => HeadMeta {
                status: 404,
                headers: Vec::new(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_fetches() {
        let origin = MemoryOrigin::new(OriginIdentity::object_store("b", "us-east-1"));
        origin.put("b/a.js", "exports.a = 1;");

        origin.fetch_bytes("b/a.js").await.unwrap();
        origin.fetch_bytes("/b/a.js").await.unwrap();
        assert!(origin.fetch_bytes("b/missing.js").await.is_err());

        assert_eq!(origin.fetch_count("b/a.js"), 2);
        assert_eq!(origin.fetch_count("b/missing.js"), 1);
        assert_eq!(origin.total_fetches(), 3);
    }

    #[tokio::test]
    async fn test_head_and_replace() {
        let origin = MemoryOrigin::new(OriginIdentity::object_store("b", "us-east-1"));
        origin.put("b/data.json", r#"{"v":1}"#);
        assert_eq!(origin.head_meta("b/data.json").await.unwrap().status, 200);

        origin.put("b/data.json", r#"{"v":22}"#);
        let data = origin.fetch_bytes("b/data.json").await.unwrap();
        assert_eq!(&data[..], br#"{"v":22}"#);

        origin.remove("b/data.json");
        assert_eq!(origin.head_meta("b/data.json").await.unwrap().status, 404);
        // Metadata requests are not counted as fetches.
        assert_eq!(origin.fetch_count("b/data.json"), 1);
    }

    #[test]
    fn test_identity_is_reported() {
        let origin = MemoryOrigin::new(OriginIdentity::object_store("b", "us-east-1"));
        origin.put("b/index.js", "exports.handler = () => 'hi';");
        let data = tokio_test::block_on(origin.fetch_bytes("b/index.js")).unwrap();
        assert_eq!(&data[..], b"exports.handler = () => 'hi';");
        assert_eq!(origin.identity().key_prefix().unwrap(), "b");
    }
}
