//! Module cache, template compiler and script sandbox for funcurl.
//!
//! This crate provides the dynamic half of the runtime:
//! - [`ModuleKey`]: canonical keys derived from the origin identity
//! - [`ScriptEngine`]: the embedded isolate fetched code runs in
//! - [`RemoteModuleCache`]: TTL cache of executed modules over an origin
//! - [`TemplateCompiler`]: translator and runner for tag-annotated templates
//! - [`ModuleHost`]: origin access for running scripts (`exrequire` and friends)
//! - [`RequestContext`], [`ResponseState`], [`ResponseHeaders`]: per-request state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  RemoteModuleCache                      │
//! │  (Process-wide, shared by every request)                │
//! │  - ModuleKey -> CacheEntry { exports, expires_at }      │
//! │  - Per-key single-flight on misses                      │
//! └─────────────────────────────────────────────────────────┘
//!              │ fetch_bytes                 │ evaluate
//!              ▼                             ▼
//! ┌──────────────────────────┐ ┌────────────────────────────┐
//! │      OriginBackend       │ │        ScriptEngine        │
//! │  object store / source   │ │  one isolate on its own    │
//! │  host / fs / memory      │ │  thread, job queue         │
//! └──────────────────────────┘ └────────────────────────────┘
//!                                            ▲
//!                                            │ render
//!                              ┌────────────────────────────┐
//!                              │      TemplateCompiler      │
//!                              └────────────────────────────┘
//! ```

pub mod cache;
pub mod console;
pub mod context;
pub mod engine;
pub mod headers;
pub mod host;
pub mod key;
pub mod mime;
pub mod module;
mod ops;
pub mod template;

pub use cache::{CacheEntry, CachedModule, RemoteModuleCache};
pub use context::{RequestBody, RequestContext, ResponseState};
pub use engine::{Invocation, InvokeOutcome, RenderOutcome, ScriptEngine, ScriptValue};
pub use headers::{AttrValue, CookieSpec, ResponseHeaders};
pub use host::{ContentArgs, HostSlot, ModuleHost, RequireArgs};
pub use key::ModuleKey;
pub use mime::{MimeEntry, MimeResolver};
pub use module::{EntryPoint, ModuleExports, ScriptExports, resolve_entry_point};
pub use template::{TemplateCompiler, TemplateProgram};
