//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::{delete, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handler::{cache_stats, clear_cache, handle_request, health_check};
use crate::state::AppState;

/// Prefix of the server's own routes.
pub const CONTROL_PREFIX: &str = "/_funcurl";

/// Router options.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Request timeout.
    pub request_timeout: Duration,
    /// Add permissive CORS headers.
    pub cors: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            cors: false,
        }
    }
}

/// Build the main application router.
///
/// Routes:
/// - `GET /_funcurl/health` - Health check
/// - `GET /_funcurl/cache` - Module cache statistics
/// - `DELETE /_funcurl/cache` - Drop every cached module
/// - anything else - Dispatched as a Function URL event
pub fn build_router(state: AppState, options: &RouterOptions) -> Router {
    let control_routes = Router::new()
        .route("/health", get(health_check))
        .route("/cache", get(cache_stats))
        .route("/cache", delete(clear_cache));

    let router = Router::new()
        .nest(CONTROL_PREFIX, control_routes)
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(options.request_timeout));

    let router = if options.cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use funcurl_common::RuntimeConfig;
    use funcurl_origin::{MemoryOrigin, OriginIdentity};
    use tower::util::ServiceExt;

    use super::*;

    fn setup_router(cors: bool) -> (Router, MemoryOrigin) {
        let origin = MemoryOrigin::new(OriginIdentity::object_store("bucket", "ap-northeast-1"));
        let state = AppState::with_origin(&RuntimeConfig::default(), Arc::new(origin.clone())).unwrap();
        let options = RouterOptions {
            cors,
            ..RouterOptions::default()
        };
        (build_router(state, &options), origin)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = setup_router(false);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_funcurl/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cache_stats_empty() {
        let (app, _) = setup_router(false);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_funcurl/cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["entries"], 0);
    }

    #[tokio::test]
    async fn test_static_content_through_fallback() {
        let (app, origin) = setup_router(false);
        origin.put("bucket/style.css", "body { color: red }");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/style.css")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/css");
        assert_eq!(response.headers()["cache-control"], "no-cache");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"body { color: red }");
    }

    #[tokio::test]
    async fn test_missing_content_not_found() {
        let (app, _) = setup_router(false);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/missing.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let (app, origin) = setup_router(true);
        origin.put("bucket/a.txt", "a");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/a.txt")
                    .header("origin", "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_cache_stats_list_modules() {
        let (app, origin) = setup_router(false);
        origin.put("bucket/hello.js", "exports.handler = () => 'hi';");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_funcurl/cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["entries"], 1);
        assert_eq!(json["modules"][0]["key"], "bucket/hello.js");
        assert_eq!(json["modules"][0]["content_hash"].as_str().unwrap().len(), 16);
        assert!(json["modules"][0]["expires_in_ms"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_static_reserved_name_is_content() {
        let (app, origin) = setup_router(false);
        origin.put("bucket/index.js", "console.log('client side');");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/index.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/javascript");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"console.log('client side');");
    }
}
