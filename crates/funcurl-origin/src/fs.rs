//! Filesystem stand-in for the network origins.
//!
//! Used by the local simulation server: a directory plays the part of a
//! bucket or a repository branch, so edits are visible without uploading.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use funcurl_common::OriginError;

use crate::backend::{HeadMeta, OriginBackend, OriginIdentity, strip_identity_prefix};

/// Value of the `server` header on synthesized metadata.
pub const SERVER_NAME: &str = concat!("funcurl-sim/", env!("CARGO_PKG_VERSION"));

/// Origin serving files from a local directory.
pub struct FsOrigin {
    identity: OriginIdentity,
    root: PathBuf,
}

impl FsOrigin {
    /// Serve `root` under the given identity.
    pub fn new(identity: OriginIdentity, root: impl Into<PathBuf>) -> Self {
        Self {
            identity,
            root: root.into(),
        }
    }

    /// The directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a canonical key onto a file below the root.
    ///
    /// # Errors
    ///
    /// Returns [`OriginError::InvalidPath`] for keys outside this identity
    /// or keys that would escape the root.
    pub fn file_path(&self, path: &str) -> Result<PathBuf, OriginError> {
        let relative = strip_identity_prefix(&self.identity, path)?;
        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(OriginError::InvalidPath { path: path.into() }),
            }
        }
        if resolved == self.root {
            return Err(OriginError::InvalidPath { path: path.into() });
        }
        Ok(resolved)
    }
}

/// Synthesize an entity tag from a file's name, length and modification time.
///
/// The tag is the base64 SHA-256 of `"name\nlength\nmtime_ms"` with the
/// padding removed.
pub fn synthesize_etag(name: &str, length: u64, mtime_ms: u128) -> String {
    let digest = Sha256::digest(format!("{name}\n{length}\n{mtime_ms}").as_bytes());
    STANDARD.encode(digest).trim_end_matches('=').to_string()
}

fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn map_io(path: &str, err: &io::Error) -> OriginError {
    if err.kind() == io::ErrorKind::NotFound {
        OriginError::status(path, 404)
    } else {
        OriginError::transport(path, err.to_string())
    }
}

#[async_trait]
impl OriginBackend for FsOrigin {
    fn identity(&self) -> &OriginIdentity {
        &self.identity
    }

    #[instrument(skip(self), fields(origin = "fs"))]
    async fn fetch_bytes(&self, path: &str) -> Result<Bytes, OriginError> {
        let file = self.file_path(path)?;
        let meta = tokio::fs::metadata(&file)
            .await
            .map_err(|e| map_io(path, &e))?;
        if !meta.is_file() {
            return Err(OriginError::status(path, 404));
        }
        let data = tokio::fs::read(&file).await.map_err(|e| map_io(path, &e))?;
        debug!(file = %file.display(), size = data.len(), "Read simulated object");
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(origin = "fs"))]
    async fn head_meta(&self, path: &str) -> Result<HeadMeta, OriginError> {
        let now = http_date(Utc::now());
        let file = self.file_path(path)?;
        let meta = match tokio::fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(not_found(now)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(not_found(now)),
            Err(e) => return Err(OriginError::transport(path, e.to_string())),
        };

        let modified = meta
            .modified()
            .map_err(|e| OriginError::transport(path, e.to_string()))?;
        let mtime_ms = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let etag = synthesize_etag(&file.display().to_string(), meta.len(), mtime_ms);

        Ok(HeadMeta {
            status: 200,
            headers: vec![
                ("server".into(), SERVER_NAME.into()),
                ("date".into(), now),
                ("content-length".into(), meta.len().to_string()),
                (
                    "last-modified".into(),
                    http_date(DateTime::<Utc>::from(modified)),
                ),
                ("etag".into(), etag),
            ],
        })
    }
}

fn not_found(now: String) -> HeadMeta {
    HeadMeta {
        status: 404,
        headers: vec![
            ("server".into(), SERVER_NAME.into()),
            ("date".into(), now),
        ],
    }
}
