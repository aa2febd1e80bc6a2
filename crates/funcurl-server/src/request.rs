//! HTTP request conversion into inbound events.
//!
//! The simulation server builds the same event a Function URL would deliver,
//! so requests take the exact path they take in a deployment.

use std::collections::BTreeMap;

use axum::http::Request;
use axum::http::header::COOKIE;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use funcurl_core::context::parse_form;

use crate::event::{EventContext, HttpDetails, InboundEvent};

/// Build an inbound event from an HTTP request and its collected body.
///
/// # Arguments
///
/// * `req` - The HTTP request (headers and metadata)
/// * `body` - The request body as bytes
///
/// Header values that are not visible ASCII are dropped. The `cookie`
/// header is split into the event's cookie list, and a non-empty body is
/// always carried base64-encoded.
pub fn event_from_http<B>(req: &Request<B>, body: Bytes) -> InboundEvent {
    let path = req.uri().path().to_string();
    let raw_query = req.uri().query().unwrap_or_default().to_string();

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in req.headers() {
        if name == COOKIE {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let cookies: Vec<String> = req
        .headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    let query_string_parameters = (!raw_query.is_empty()).then(|| parse_form(&raw_query));

    let (body, is_base64_encoded) = if body.is_empty() {
        (None, false)
    } else {
        (Some(STANDARD.encode(&body)), true)
    };

    InboundEvent {
        raw_path: path.clone(),
        raw_query_string: raw_query,
        headers,
        cookies,
        query_string_parameters,
        request_context: EventContext {
            http: HttpDetails {
                method: req.method().to_string(),
                path,
            },
        },
        body,
        is_base64_encoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_http() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/users?id=1&name=a%20b")
            .header("Content-Type", "application/json")
            .header("Cookie", "a=1; b=2")
            .body(())
            .unwrap();

        let event = event_from_http(&req, Bytes::from(r#"{"name": "test"}"#));

        assert_eq!(event.raw_path, "/api/users");
        assert_eq!(event.raw_query_string, "id=1&name=a%20b");
        assert_eq!(event.request_context.http.method, "POST");
        assert_eq!(event.headers["content-type"], "application/json");
        assert!(!event.headers.contains_key("cookie"));
        assert_eq!(event.cookies, vec!["a=1", "b=2"]);
        assert_eq!(event.query_string_parameters.unwrap()["name"], "a b");
        assert!(event.is_base64_encoded);
        assert_eq!(
            STANDARD.decode(event.body.unwrap()).unwrap(),
            br#"{"name": "test"}"#
        );
    }

    #[test]
    fn test_empty_body_is_absent() {
        let req = Request::builder().uri("/hello").body(()).unwrap();
        let event = event_from_http(&req, Bytes::new());

        assert_eq!(event.request_context.http.method, "GET");
        assert!(event.body.is_none());
        assert!(!event.is_base64_encoded);
        assert!(event.query_string_parameters.is_none());
    }
}
