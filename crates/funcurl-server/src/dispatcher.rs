//! The per-request dispatcher.
//!
//! [`EdgeRequestDispatcher::dispatch`] is the single entry point for an
//! inbound event:
//!
//! 1. normalize the event into a [`RequestContext`]
//! 2. run the optional [`RequestFilter`], which may answer the request
//! 3. route by extension: templates are rendered, other extensions are
//!    served raw from the origin, extensionless paths run `<path>.js`
//! 4. compress static and template bodies when allowed
//! 5. coerce the result into a [`ResponseEnvelope`]
//!
//! Every failure surfaces as a typed [`RuntimeError`] and is turned into a
//! generic 500 in one place; error detail is logged, never returned.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{Span, debug, error, info, instrument};
use uuid::Uuid;

use funcurl_common::{DispatchConfig, RuntimeConfig, RuntimeError};
use funcurl_core::mime::{self, MimeResolver};
use funcurl_core::{
    Invocation, ModuleKey, RemoteModuleCache, RequestContext, ResponseHeaders, ResponseState,
    ScriptValue, TemplateCompiler, resolve_entry_point,
};

use crate::compress::{CompressPolicy, maybe_compress};
use crate::event::{InboundEvent, is_text_safe, normalize};
use crate::filter::{FilterOutcome, RequestFilter};
use crate::response::{EnvelopeBody, ResponseEnvelope, plain_text};

/// Suffix of the source backing a template request.
pub const TEMPLATE_SOURCE_SUFFIX: &str = ".js.html";

/// Suffix appended to extensionless paths to find their handler module.
pub const HANDLER_SUFFIX: &str = ".js";

/// Origin headers copied onto static responses when validators are enabled.
const VALIDATOR_HEADERS: [&str; 2] = ["etag", "last-modified"];

/// Routes inbound events to static content, templates or handler modules.
///
/// The dispatcher keeps no per-request state; one instance serves every
/// request concurrently.
pub struct EdgeRequestDispatcher {
    cache: Arc<RemoteModuleCache>,
    templates: TemplateCompiler,
    current_path: String,
    config: DispatchConfig,
    filter: Option<Arc<dyn RequestFilter>>,
    mime_resolver: Option<Arc<dyn MimeResolver>>,
}

impl EdgeRequestDispatcher {
    /// Create a dispatcher over `cache`.
    ///
    /// # Arguments
    ///
    /// * `cache` - Module cache shared with any other front-end
    /// * `config` - Runtime configuration; the origin's current path and
    ///   the dispatch settings are taken from it
    pub fn new(cache: Arc<RemoteModuleCache>, config: &RuntimeConfig) -> Self {
        let templates = TemplateCompiler::new(cache.engine().clone());
        Self {
            cache,
            templates,
            current_path: config.origin.current_path(),
            config: config.dispatch.clone(),
            filter: None,
            mime_resolver: None,
        }
    }

    /// Install a pre-dispatch filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Install a MIME resolver consulted before the built-in table.
    #[must_use]
    pub fn with_mime_resolver(mut self, resolver: Arc<dyn MimeResolver>) -> Self {
        self.mime_resolver = Some(resolver);
        self
    }

    /// The module cache.
    pub fn cache(&self) -> &Arc<RemoteModuleCache> {
        &self.cache
    }

    /// The path request paths are resolved against.
    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    /// Handle one inbound event.
    ///
    /// Never fails: any error is logged with the request id and becomes a
    /// generic 500 envelope.
    #[instrument(
        skip(self, event),
        fields(request_id = tracing::field::Empty, method = tracing::field::Empty, path = %event.raw_path)
    )]
    pub async fn dispatch(&self, event: &InboundEvent) -> ResponseEnvelope {
        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        Span::current().record("request_id", request_id.as_str());

        match self.try_dispatch(event).await {
            Ok(envelope) => {
                info!(
                    status = envelope.status_code,
                    duration_ms = start.elapsed().as_millis(),
                    "Request completed"
                );
                envelope
            }
            Err(e) => {
                error!(
                    request_id = %request_id,
                    method = %event.request_context.http.method,
                    path = %event.raw_path,
                    error = %e,
                    duration_ms = start.elapsed().as_millis(),
                    "Request failed"
                );
                ResponseEnvelope::internal_error()
            }
        }
    }

    async fn try_dispatch(&self, event: &InboundEvent) -> Result<ResponseEnvelope, RuntimeError> {
        let mut request = normalize(event)?;
        if let Some(resolver) = &self.mime_resolver {
            request = request.with_mime_resolver(Arc::clone(resolver));
        }
        Span::current().record("method", request.method.as_str());

        let mut state = ResponseState::default();
        let mut headers = ResponseHeaders::new();

        if let Some(filter) = &self.filter {
            if let FilterOutcome::Handled(value) =
                filter.filter(&request, &mut state, &mut headers).await?
            {
                return Ok(assemble(state, headers, value));
            }
        }

        match request.extension.clone() {
            Some(ext) if ext == self.config.template_extension => {
                self.serve_template(request, state, headers).await
            }
            Some(ext) => self.serve_static(&request, &ext, headers).await,
            None => self.run_handler(request, state, headers).await,
        }
    }

    /// Serve origin content as-is. A missing object is a 404, not an error.
    ///
    /// Reserved module names are ordinary content here; only the module
    /// loader refuses them.
    async fn serve_static(
        &self,
        request: &RequestContext,
        extension: &str,
        mut headers: ResponseHeaders,
    ) -> Result<ResponseEnvelope, RuntimeError> {
        let key = self.cache.resolve_content(&self.current_path, &request.path)?;
        let content = match self.cache.load_raw(&key).await {
            Ok(content) => content,
            Err(e) if e.is_origin_fetch() => {
                debug!(key = %key, error = %e, "Static content not found");
                return Ok(ResponseEnvelope::not_found());
            }
            Err(e) => return Err(e),
        };

        if self.config.static_validators {
            self.copy_validators(&key, &mut headers).await;
        }

        let entry = mime::resolve(self.mime_resolver.as_deref(), extension);
        let (body, encoded) = self.compress(request, content, entry.gz, &mut headers)?;

        headers.set_content_type(entry.content_type);
        headers.put("content-length", body.len().to_string());

        let body = if encoded || !is_text_safe(&body) {
            EnvelopeBody::Binary(body)
        } else {
            EnvelopeBody::Text(String::from_utf8_lossy(&body).into_owned())
        };
        Ok(ResponseEnvelope::new(200, &headers, body))
    }

    /// Render `<stem>.js.html` for a template request.
    async fn serve_template(
        &self,
        request: RequestContext,
        state: ResponseState,
        headers: ResponseHeaders,
    ) -> Result<ResponseEnvelope, RuntimeError> {
        let key = self.template_source(&request.path)?;
        let source = self.cache.load_raw(&key).await?;
        let program = TemplateCompiler::compile(&String::from_utf8_lossy(&source))
            .map_err(|e| rename_script_error(e, key.as_str()))?;

        let accept_encoding = request.header("accept-encoding").map(str::to_string);
        let rendered = self
            .templates
            .execute(key.as_str(), &program, request, state, headers)
            .await?;

        let mut headers = rendered.headers;
        let (body, encoded) = self.compress_with(
            accept_encoding.as_deref(),
            Bytes::from(rendered.body),
            true,
            &mut headers,
        )?;
        headers.put("content-length", body.len().to_string());

        let body = if encoded {
            EnvelopeBody::Binary(body)
        } else {
            EnvelopeBody::Text(String::from_utf8_lossy(&body).into_owned())
        };
        Ok(ResponseEnvelope::new(200, &headers, body))
    }

    /// Load `<path>.js` and call its `handler` or `execute` export.
    async fn run_handler(
        &self,
        request: RequestContext,
        state: ResponseState,
        headers: ResponseHeaders,
    ) -> Result<ResponseEnvelope, RuntimeError> {
        let key = self.handler_key(&request.path)?;
        let exports = self
            .cache
            .load_module(&key, self.cache.default_no_cache())
            .await?;
        let entry = resolve_entry_point(&exports)?;
        let script = exports
            .as_script()
            .ok_or_else(|| RuntimeError::handler_contract(key.as_str()))?;

        let outcome = self
            .cache
            .engine()
            .invoke(script, entry, &Invocation { request, state, headers })
            .await?;

        Ok(assemble(outcome.state, outcome.headers, outcome.value))
    }

    /// Copy `etag` and `last-modified` from the origin's metadata.
    async fn copy_validators(&self, key: &ModuleKey, headers: &mut ResponseHeaders) {
        match self.cache.head_meta(key).await {
            Ok(meta) if meta.status < 400 => {
                for name in VALIDATOR_HEADERS {
                    if let Some(value) = meta.header(name) {
                        headers.put(name, value);
                    }
                }
            }
            Ok(meta) => debug!(key = %key, status = meta.status, "No validators for static content"),
            Err(e) => debug!(key = %key, error = %e, "Validator lookup failed"),
        }
    }

    fn handler_key(&self, path: &str) -> Result<ModuleKey, RuntimeError> {
        self.cache
            .resolve(&self.current_path, &format!("{path}{HANDLER_SUFFIX}"))
    }

    fn template_source(&self, path: &str) -> Result<ModuleKey, RuntimeError> {
        let stem = path
            .len()
            .checked_sub(self.config.template_extension.len() + 1)
            .and_then(|end| path.get(..end))
            .unwrap_or(path);
        self.cache
            .resolve_content(&self.current_path, &format!("{stem}{TEMPLATE_SOURCE_SUFFIX}"))
    }

    fn compress(
        &self,
        request: &RequestContext,
        body: Bytes,
        compressible: bool,
        headers: &mut ResponseHeaders,
    ) -> Result<(Bytes, bool), RuntimeError> {
        self.compress_with(request.header("accept-encoding"), body, compressible, headers)
    }

    fn compress_with(
        &self,
        accept_encoding: Option<&str>,
        body: Bytes,
        compressible: bool,
        headers: &mut ResponseHeaders,
    ) -> Result<(Bytes, bool), RuntimeError> {
        let policy = CompressPolicy {
            enabled: self.config.compression,
            min_bytes: self.config.compress_min_bytes,
            accept_encoding,
        };
        let (body, encoding) = maybe_compress(body, compressible, policy)?;
        match encoding {
            Some(encoding) => {
                headers.put("content-encoding", encoding.as_str());
                Ok((body, true))
            }
            None => Ok((body, false)),
        }
    }
}

impl std::fmt::Debug for EdgeRequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeRequestDispatcher")
            .field("current_path", &self.current_path)
            .field("config", &self.config)
            .field("filter", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

/// Turn a handler or filter result into an envelope.
///
/// Redirects drop every header except `location`; an absent value yields an
/// empty text response; otherwise the content type follows the value's kind
/// unless the handler already set one.
pub fn assemble(state: ResponseState, mut headers: ResponseHeaders, value: ScriptValue) -> ResponseEnvelope {
    if let Some(location) = state.redirect_url() {
        let mut redirect = ResponseHeaders::new();
        for name in headers.cookie_keys().map(str::to_string).collect::<Vec<_>>() {
            if let Some(cookie) = headers.remove_cookie(&name) {
                redirect.put_cookie(name, cookie);
            }
        }
        redirect.put("location", location);
        redirect.put("content-length", "0");
        return ResponseEnvelope::new(state.status, &redirect, EnvelopeBody::Empty);
    }

    let (default_type, body) = match value {
        ScriptValue::None => {
            headers.put_if_absent("content-type", plain_text());
            headers.put("content-length", "0");
            return ResponseEnvelope::new(state.status, &headers, EnvelopeBody::Empty);
        }
        ScriptValue::Binary(data) => (mime::FALLBACK_MIME.to_string(), EnvelopeBody::Binary(data)),
        ScriptValue::Text(text) => (mime::resolve(None, "html").content_type, EnvelopeBody::Text(text)),
        ScriptValue::Json(json) => (mime::resolve(None, "json").content_type, EnvelopeBody::Text(json)),
        ScriptValue::Other(other) => (plain_text(), EnvelopeBody::Text(other)),
    };

    headers.put_if_absent("content-type", default_type);
    headers.put_if_absent("content-length", body.len().to_string());
    ResponseEnvelope::new(state.status, &headers, body)
}

fn rename_script_error(error: RuntimeError, name: &str) -> RuntimeError {
    match error {
        RuntimeError::Script { message, .. } => RuntimeError::script(name, message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_text_defaults_to_html() {
        let envelope = assemble(
            ResponseState::default(),
            ResponseHeaders::new(),
            ScriptValue::Text("hi".into()),
        );
        assert_eq!(envelope.status_code, 200);
        assert_eq!(envelope.header("content-type"), Some("text/html"));
        assert_eq!(envelope.header("content-length"), Some("2"));
        assert_eq!(envelope.body.as_deref(), Some("hi"));
    }

    #[test]
    fn test_assemble_keeps_explicit_content_type() {
        let mut headers = ResponseHeaders::new();
        headers.set_content_type("text/csv");
        let envelope = assemble(ResponseState::default(), headers, ScriptValue::Text("a,b".into()));
        assert_eq!(envelope.header("content-type"), Some("text/csv"));
        assert_eq!(envelope.header("content-length"), Some("3"));
    }

    #[test]
    fn test_assemble_json_and_other() {
        let json = assemble(
            ResponseState::default(),
            ResponseHeaders::new(),
            ScriptValue::Json(r#"{"a":1}"#.into()),
        );
        assert_eq!(json.header("content-type"), Some("application/json"));

        let other = assemble(
            ResponseState::default(),
            ResponseHeaders::new(),
            ScriptValue::Other("42".into()),
        );
        assert_eq!(other.header("content-type"), Some("text/plain"));
        assert_eq!(other.body.as_deref(), Some("42"));
    }

    #[test]
    fn test_assemble_binary_is_base64() {
        let envelope = assemble(
            ResponseState::default(),
            ResponseHeaders::new(),
            ScriptValue::Binary(Bytes::from_static(&[1, 2, 3])),
        );
        assert!(envelope.is_base64_encoded);
        assert_eq!(envelope.header("content-type"), Some("application/octet-stream"));
        assert_eq!(envelope.body_bytes().unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn test_assemble_empty_body() {
        let mut state = ResponseState::default();
        state.set_status(204);
        let envelope = assemble(state, ResponseHeaders::new(), ScriptValue::None);
        assert_eq!(envelope.status_code, 204);
        assert_eq!(envelope.header("content-type"), Some("text/plain"));
        assert_eq!(envelope.header("content-length"), Some("0"));
        assert!(envelope.body.is_none());
    }

    #[test]
    fn test_assemble_redirect_drops_headers() {
        let mut state = ResponseState::default();
        state.redirect("/x", Some(302));
        let mut headers = ResponseHeaders::new();
        headers.put("x-dropped", "1");
        headers.put_cookie_str("session", "abc");

        let envelope = assemble(state, headers, ScriptValue::Text("ignored".into()));
        assert_eq!(envelope.status_code, 302);
        assert_eq!(envelope.header("location"), Some("/x"));
        assert_eq!(envelope.header("x-dropped"), None);
        assert_eq!(envelope.cookies, vec!["session=abc; SameSite=Lax".to_string()]);
        assert!(envelope.body.is_none());
    }
}
