//! Request handlers for the simulation server.
//!
//! Every request outside `/_funcurl` becomes an inbound event and goes
//! through the dispatcher exactly as a deployed invocation would.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, ETAG, EXPIRES, LAST_MODIFIED, PRAGMA};
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use tracing::{debug, warn};

use crate::request::event_from_http;
use crate::response::ResponseEnvelope;
use crate::state::AppState;

/// Largest request body the simulation server accepts.
pub const MAX_BODY_BYTES: usize = 6 * 1024 * 1024;

/// Dispatch an HTTP request as an inbound event.
///
/// This handler:
/// 1. Optionally clears the module cache so origin edits show up at once
/// 2. Converts the request into an inbound event
/// 3. Dispatches it and converts the envelope back into a response
/// 4. Marks the response uncacheable unless it carries validators
pub async fn handle_request(State(state): State<AppState>, req: Request) -> Response<Body> {
    if state.clear_cache_per_request() {
        state.cache().clear_cache();
    }

    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return ResponseEnvelope::text(413, crate::status::error_body(413)).into_axum_response();
        }
    };
    let event = event_from_http(&axum::http::Request::from_parts(parts, ()), body);

    let envelope = state.dispatcher().dispatch(&event).await;
    debug!(status = envelope.status_code, "Writing envelope");

    let mut response = envelope.into_axum_response();
    apply_no_cache(&mut response);
    response
}

/// Add no-cache headers unless the response carries `etag` or
/// `last-modified`.
pub fn apply_no_cache(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    if headers.contains_key(ETAG) || headers.contains_key(LAST_MODIFIED) {
        return;
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("-1"));
}

/// Health check handler.
///
/// Returns 200 OK if the server is running.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine_running = state.cache().engine().is_running();
    let status = if engine_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if engine_running { "ok" } else { "engine stopped" },
        "uptime_secs": state.uptime_secs(),
    });
    (status, axum::Json(body))
}

/// Module cache statistics.
pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.cache();
    axum::Json(serde_json::json!({
        "entries": cache.len(),
        "ttl_ms": cache.ttl().as_millis(),
        "no_cache": cache.default_no_cache(),
        "origin": cache.identity().key_prefix().unwrap_or_default(),
        "modules": cache.modules(),
    }))
}

/// Drop every cached module.
pub async fn clear_cache(State(state): State<AppState>) -> impl IntoResponse {
    state.cache().clear_cache();
    StatusCode::NO_CONTENT
}
