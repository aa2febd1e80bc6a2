//! Error types for funcurl.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors raised while loading code and serving requests
//! - [`OriginError`]: Errors from origin backends (object store, source host, filesystem)

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors travel unchanged from the module cache, the template compiler
/// and the script engine up to the dispatcher, which is the only place that
/// turns them into a response.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Required configuration or origin identity fields are missing or invalid.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error.
        reason: String,
    },

    /// A reserved bootstrap module name was requested through the loader.
    #[error("Forbidden module: {name}")]
    ForbiddenModule {
        /// The rejected module name.
        name: String,
    },

    /// The origin could not deliver the requested object.
    #[error("Origin fetch failed: {path} (status: {status})")]
    OriginFetch {
        /// Canonical path that was requested.
        path: String,
        /// Upstream HTTP status (0 if no response was received).
        status: u16,
    },

    /// Fetched or compiled code failed to compile or run.
    #[error("Script error in {name}: {message}")]
    Script {
        /// Module key or template name of the offending code.
        name: String,
        /// Engine-provided failure description.
        message: String,
    },

    /// A handler module exposes neither `handler` nor `execute`.
    #[error("No handler or execute export in {path}")]
    HandlerContract {
        /// Path of the module that was loaded.
        path: String,
    },

    /// The inbound event could not be normalized.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Description of what was malformed.
        reason: String,
    },

    /// The script engine thread has stopped.
    #[error("Script engine unavailable")]
    EngineUnavailable,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from origin backend implementations.
///
/// Backends attempt exactly one request per call; retry policy belongs to
/// the caller.
#[derive(Error, Debug)]
pub enum OriginError {
    /// The origin answered with a non-success status.
    #[error("Origin returned {status} for {path}")]
    Status {
        /// Canonical path that was requested.
        path: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The request never produced a response.
    #[error("Origin request failed for {path}: {reason}")]
    Transport {
        /// Canonical path that was requested.
        path: String,
        /// Description of the transport failure.
        reason: String,
    },

    /// Signing credentials are missing or unusable.
    #[error("Origin credentials unavailable: {reason}")]
    Credentials {
        /// Description of the credential problem.
        reason: String,
    },

    /// The canonical path cannot be mapped onto this origin.
    #[error("Invalid origin path: {path}")]
    InvalidPath {
        /// The offending path.
        path: String,
    },
}

impl OriginError {
    /// Create a new `Status` error.
    pub fn status(path: impl Into<String>, status: u16) -> Self {
        Self::Status {
            path: path.into(),
            status,
        }
    }

    /// Create a new `Transport` error.
    pub fn transport(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if the origin reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

impl From<OriginError> for RuntimeError {
    fn from(err: OriginError) -> Self {
        match err {
            OriginError::Status { path, status } => RuntimeError::OriginFetch { path, status },
            OriginError::Transport { path, .. } => RuntimeError::OriginFetch { path, status: 0 },
            OriginError::Credentials { reason } => RuntimeError::Config { reason },
            OriginError::InvalidPath { path } => RuntimeError::Config {
                reason: format!("path cannot be mapped onto the origin: {path}"),
            },
        }
    }
}

impl RuntimeError {
    /// Create a new `Config` error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a new `ForbiddenModule` error.
    pub fn forbidden_module(name: impl Into<String>) -> Self {
        Self::ForbiddenModule { name: name.into() }
    }

    /// Create a new `Script` error.
    pub fn script(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a new `HandlerContract` error.
    pub fn handler_contract(path: impl Into<String>) -> Self {
        Self::HandlerContract { path: path.into() }
    }

    /// Create a new `InvalidRequest` error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error came from an origin fetch.
    pub fn is_origin_fetch(&self) -> bool {
        matches!(self, Self::OriginFetch { .. })
    }

    /// Returns `true` if this error was raised by fetched or compiled code.
    pub fn is_script(&self) -> bool {
        matches!(self, Self::Script { .. })
    }

    /// The response status this error maps to on the dynamic handler path.
    ///
    /// Static content paths translate [`RuntimeError::OriginFetch`] into a
    /// 404 themselves; every error reaching the top-level catch is a 500.
    pub fn status_hint(&self) -> u16 {
        500
    }
}
