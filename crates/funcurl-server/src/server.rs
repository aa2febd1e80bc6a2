//! HTTP server implementation.
//!
//! This module provides the main [`EdgeServer`] struct for running
//! the local Function URL simulation server.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use funcurl_common::{RuntimeError, ServerConfigFile};

use crate::router::{RouterOptions, build_router};
use crate::state::AppState;

/// Default bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3210";

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Add permissive CORS headers.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3210)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
            cors: false,
        }
    }
}

impl ServerConfig {
    /// Build from the `[server]` table of a config file.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if the bind address does not parse.
    pub fn from_file(file: &ServerConfigFile) -> Result<Self, RuntimeError> {
        Ok(Self {
            bind_addr: parse_bind_addr(&file.bind_addr)?,
            request_timeout_secs: file.request_timeout_secs,
            graceful_shutdown: file.graceful_shutdown,
            cors: file.cors,
        })
    }

    /// Create a new server config with custom bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    #[must_use]
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Enable or disable CORS headers.
    #[must_use]
    pub fn with_cors(mut self, cors: bool) -> Self {
        self.cors = cors;
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn router_options(&self) -> RouterOptions {
        RouterOptions {
            request_timeout: self.request_timeout(),
            cors: self.cors,
        }
    }
}

/// Parse a bind address.
///
/// # Errors
///
/// Returns [`RuntimeError::Config`] if `addr` is not `host:port`.
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr, RuntimeError> {
    addr.trim()
        .parse()
        .map_err(|e| RuntimeError::config(format!("invalid bind address {addr:?}: {e}")))
}

/// Function URL simulation server.
///
/// # Example
///
/// ```ignore
/// use funcurl_server::{AppState, EdgeServer, ServerConfig};
/// use funcurl_common::RuntimeConfig;
///
/// let runtime_config = RuntimeConfig::from_env()?;
/// let state = AppState::new(&runtime_config, Some("./site".as_ref()))?;
///
/// EdgeServer::new(state, ServerConfig::default()).run().await?;
/// ```
pub struct EdgeServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
}

impl EdgeServer {
    /// Create a new server instance.
    ///
    /// # Arguments
    ///
    /// * `state` - Shared application state
    /// * `config` - Configuration for the HTTP server
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// This will block until the server is shut down via signal
    /// (SIGTERM/SIGINT) if graceful shutdown is enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let app = build_router(self.state, &self.config.router_options());

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RuntimeError::config(format!("Failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        if self.config.graceful_shutdown {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        } else {
            axum::serve(listener, app).await?;
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Start the server and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0) and
    /// returns a handle that can be used to get the actual address
    /// and shut down the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn start_test(state: AppState) -> Result<TestHandle, RuntimeError> {
        let app = build_router(state.clone(), &RouterOptions::default());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| RuntimeError::config(format!("Failed to bind: {e}")))?;

        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state.
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
