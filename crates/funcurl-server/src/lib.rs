//! Function URL dispatcher and local simulation server for funcurl.
//!
//! This crate turns inbound Function URL events into responses. It handles:
//!
//! - Event normalization and body classification
//! - Routing by extension to static content, templates or handler modules
//! - Response compression and envelope assembly
//! - A local axum server that replays HTTP requests as events
//!
//! # Quick Start
//!
//! ```ignore
//! use funcurl_server::{AppState, EdgeServer, ServerConfig};
//! use funcurl_common::RuntimeConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime_config = RuntimeConfig::from_env()?;
//!     let state = AppState::new(&runtime_config, None)?;
//!
//!     EdgeServer::new(state, ServerConfig::default()).run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod compress;
pub mod dispatcher;
pub mod event;
pub mod filter;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;
pub mod status;

pub use dispatcher::{EdgeRequestDispatcher, assemble};
pub use event::{InboundEvent, normalize};
pub use filter::{FilterOutcome, ModuleFilter, RequestFilter};
pub use response::{EnvelopeBody, ResponseEnvelope};
pub use router::{RouterOptions, build_router};
pub use server::{EdgeServer, ServerConfig};
pub use state::AppState;
