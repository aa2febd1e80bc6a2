//! Executed module exports.
//!
//! Fetched scripts are evaluated once per cache fill. Their `module.exports`
//! object stays inside the isolate; the Rust side holds a [`ScriptExports`]
//! handle naming it. Data modules (`.json`) are plain parsed values.
//!
//! # Entry Points
//!
//! A handler module must export `handler`, or failing that `execute`.
//! [`resolve_entry_point`] makes that choice.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::trace;

use funcurl_common::RuntimeError;

/// The result of loading a module.
#[derive(Debug)]
pub enum ModuleExports {
    /// An executed script.
    Script(ScriptExports),
    /// A parsed data module.
    Data(serde_json::Value),
}

impl ModuleExports {
    /// The script handle, if this is a script.
    pub fn as_script(&self) -> Option<&ScriptExports> {
        match self {
            Self::Script(script) => Some(script),
            Self::Data(_) => None,
        }
    }

    /// The parsed value, if this is a data module.
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Script(_) => None,
            Self::Data(value) => Some(value),
        }
    }
}

/// Handle to a `module.exports` object living in the isolate.
///
/// Shared immutably through the cache; dropping the last handle frees the
/// isolate-side object.
pub struct ScriptExports {
    id: u64,
    name: String,
    functions: Vec<String>,
    content_hash: String,
    loaded_at: Instant,
    releaser: mpsc::UnboundedSender<u64>,
}

impl ScriptExports {
    pub(crate) fn new(
        id: u64,
        name: String,
        source: &str,
        functions: Vec<String>,
        releaser: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            id,
            name,
            functions,
            content_hash: compute_hash(source.as_bytes()),
            loaded_at: Instant::now(),
            releaser,
        }
    }

    /// Isolate-side id of the exports object.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name (canonical key) the script was loaded under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the exported functions.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// Returns `true` if `name` is an exported function.
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f == name)
    }

    /// Hash of the evaluated source.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// When the script was evaluated.
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

impl Drop for ScriptExports {
    fn drop(&mut self) {
        trace!(id = self.id, name = %self.name, "Releasing script exports");
        // The engine may already be gone, in which case there is nothing to free.
        let _ = self.releaser.send(self.id);
    }
}

impl std::fmt::Debug for ScriptExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptExports")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("functions", &self.functions)
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// The export a handler module is invoked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// The `handler` export.
    Handler,
    /// The `execute` export.
    Execute,
}

impl EntryPoint {
    /// Export name in the script.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryPoint::Handler => "handler",
            EntryPoint::Execute => "execute",
        }
    }
}

/// Pick `handler`, then `execute`.
///
/// # Errors
///
/// Returns [`RuntimeError::HandlerContract`] when neither is an exported
/// function, including for data modules.
pub fn resolve_entry_point(exports: &ModuleExports) -> Result<EntryPoint, RuntimeError> {
    match exports {
        ModuleExports::Script(script) => [EntryPoint::Handler, EntryPoint::Execute]
            .into_iter()
            .find(|entry| script.has_function(entry.as_str()))
            .ok_or_else(|| RuntimeError::handler_contract(script.name())),
        ModuleExports::Data(_) => Err(RuntimeError::handler_contract("<data module>")),
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(functions: &[&str]) -> (ModuleExports, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let exports = ScriptExports::new(
            7,
            "b/hello.js".into(),
            "exports.x = 1;",
            functions.iter().map(|f| f.to_string()).collect(),
            tx,
        );
        (ModuleExports::Script(exports), rx)
    }

    #[test]
    fn test_prefers_handler() {
        let (exports, _rx) = script(&["execute", "handler"]);
        assert_eq!(resolve_entry_point(&exports).unwrap(), EntryPoint::Handler);
    }

    #[test]
    fn test_falls_back_to_execute() {
        let (exports, _rx) = script(&["helper", "execute"]);
        assert_eq!(resolve_entry_point(&exports).unwrap(), EntryPoint::Execute);
    }

    #[test]
    fn test_no_entry_point() {
        let (exports, _rx) = script(&["helper"]);
        let err = resolve_entry_point(&exports).unwrap_err();
        assert!(matches!(err, RuntimeError::HandlerContract { .. }));

        let data = ModuleExports::Data(serde_json::json!({"handler": 1}));
        assert!(resolve_entry_point(&data).is_err());
    }

    #[test]
    fn test_drop_releases_id() {
        let (exports, mut rx) = script(&["handler"]);
        drop(exports);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }
}
