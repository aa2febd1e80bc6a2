//! Embedded script engine.
//!
//! The [`ScriptEngine`] owns one V8 isolate (a `deno_core::JsRuntime`) on a
//! dedicated thread. It is:
//! - Shared by every request through a cheap `Clone` handle
//! - Fed by a bounded job queue; callers await a oneshot reply
//! - The only place fetched code and compiled templates run
//!
//! # Calling Convention
//!
//! Every job is executed as `__funcurl.run(() => ...)`, which settles to a
//! JSON string `{ ok, value, error }`. The isolate thread keeps every started
//! job in flight, accepts new jobs while it drives the event loop, and
//! replies to each job as soon as its own promise settles. A handler
//! suspended on an origin load therefore does not hold up other requests,
//! and a module evaluation requested from inside a running job is served
//! from the same queue.
//!
//! Modules receive only explicit bindings: `exports`, `module`, the shared
//! `services` registry, a `console` naming the module and a `require`
//! bound to the module's load chain. The globals `exrequire`, `excontents`
//! and `exhead` reach the attached [`ModuleHost`]. This is a capability
//! boundary, not a security boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use deno_core::{JsRuntime, ModuleCodeString, PollEventLoopOptions, RuntimeOptions, v8};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace, warn};

use funcurl_common::{EngineConfig, RuntimeError};

use crate::context::{RequestContext, ResponseState};
use crate::headers::ResponseHeaders;
use crate::host::{HostSlot, ModuleHost};
use crate::mime::MimeResolver;
use crate::module::{EntryPoint, ScriptExports};
use crate::ops::{self, CallResolvers, funcurl_host};

const PRELUDE: &str = include_str!("prelude.js");

/// State handed to a handler or template.
#[derive(Debug, Serialize)]
pub struct Invocation {
    /// The inbound request.
    pub request: RequestContext,
    /// Status and redirect, usually the default.
    pub state: ResponseState,
    /// Headers and cookies, usually empty.
    pub headers: ResponseHeaders,
}

impl Invocation {
    /// Wrap a request with a default response state and no headers.
    pub fn new(request: RequestContext) -> Self {
        Self {
            request,
            state: ResponseState::default(),
            headers: ResponseHeaders::default(),
        }
    }
}

/// A handler's return value, classified inside the isolate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    /// `undefined` or `null`.
    None,
    /// An `ArrayBuffer` or typed array.
    Binary(Bytes),
    /// A string.
    Text(String),
    /// An object or array, already serialized.
    Json(String),
    /// Anything else, string-coerced.
    Other(String),
}

#[derive(Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
enum RawValue {
    None,
    Binary(String),
    Text(String),
    Json(String),
    Other(String),
}

impl ScriptValue {
    fn from_raw(name: &str, raw: RawValue) -> Result<Self, RuntimeError> {
        Ok(match raw {
            RawValue::None => Self::None,
            RawValue::Binary(b64) => Self::Binary(Bytes::from(
                STANDARD
                    .decode(b64)
                    .map_err(|e| RuntimeError::script(name, format!("bad binary result: {e}")))?,
            )),
            RawValue::Text(text) => Self::Text(text),
            RawValue::Json(json) => Self::Json(json),
            RawValue::Other(other) => Self::Other(other),
        })
    }
}

/// Result of invoking a handler.
#[derive(Debug)]
pub struct InvokeOutcome {
    /// The classified return value.
    pub value: ScriptValue,
    /// Status and redirect after the call.
    pub state: ResponseState,
    /// Headers and cookies after the call.
    pub headers: ResponseHeaders,
}

/// Result of running a compiled template.
#[derive(Debug)]
pub struct RenderOutcome {
    /// Concatenated output fragments.
    pub body: String,
    /// Status and redirect after the call.
    pub state: ResponseState,
    /// Headers and cookies after the call.
    pub headers: ResponseHeaders,
}

#[derive(Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct Defined {
    functions: Vec<String>,
}

#[derive(Deserialize)]
struct Invoked {
    value: RawValue,
    state: ResponseState,
    headers: ResponseHeaders,
}

#[derive(Deserialize)]
struct Rendered {
    body: String,
    state: ResponseState,
    headers: ResponseHeaders,
}

type ReplyTx = oneshot::Sender<Result<serde_json::Value, RuntimeError>>;

/// A unit of work for the isolate thread.
struct Job {
    call: u64,
    name: String,
    code: String,
    resolver: Option<Arc<dyn MimeResolver>>,
    reply: ReplyTx,
}

struct EngineInner {
    jobs: mpsc::Sender<Job>,
    releases: mpsc::UnboundedSender<u64>,
    host: HostSlot,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Thread-safe handle to the script isolate.
///
/// # Example
///
/// ```ignore
/// use funcurl_common::EngineConfig;
/// use funcurl_core::ScriptEngine;
///
/// let engine = ScriptEngine::new(&EngineConfig::default())?;
/// let exports = engine.evaluate("b/hello.js", "exports.handler = () => 'hi';").await?;
/// ```
#[derive(Clone)]
pub struct ScriptEngine {
    inner: Arc<EngineInner>,
}

impl ScriptEngine {
    /// Start the isolate thread and install the prelude.
    ///
    /// Blocks until the isolate is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned or the prelude
    /// fails to evaluate.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let host = HostSlot::default();

        let thread_host = host.clone();
        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run_isolate(jobs_rx, release_rx, thread_host, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(RuntimeError::script("prelude", message)),
            Err(_) => return Err(RuntimeError::EngineUnavailable),
        }

        info!(
            thread = %config.thread_name,
            queue_capacity = config.queue_capacity,
            "Script engine started"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                jobs: jobs_tx,
                releases: release_tx,
                host,
                next_id: AtomicU64::new(1),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Route script loads (`exrequire`, `excontents`, `exhead`) to `host`.
    ///
    /// The engine keeps only a weak reference.
    pub fn attach_host(&self, host: Weak<dyn ModuleHost>) {
        self.inner.host.attach(host);
    }

    /// Returns `true` while the isolate thread is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .thread
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Evaluate a CommonJS-shaped script and keep its exports.
    ///
    /// The source runs as the body of
    /// `async function(exports, module, services, console, require)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Script`] on syntax or evaluation errors.
    pub async fn evaluate(&self, name: &str, source: &str) -> Result<ScriptExports, RuntimeError> {
        self.evaluate_in(name, source, &[]).await
    }

    /// Evaluate a script loaded on behalf of the modules in `parents`.
    ///
    /// The module-local `require` refuses to load any key in the chain.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Script`] on syntax or evaluation errors.
    #[instrument(skip(self, source, parents), fields(source_len = source.len(), depth = parents.len()))]
    pub async fn evaluate_in(
        &self,
        name: &str,
        source: &str,
        parents: &[String],
    ) -> Result<ScriptExports, RuntimeError> {
        let start = Instant::now();
        let id = self.next_id();
        let code = format!(
            "globalThis.__funcurl.run(() => globalThis.__funcurl.define({id}, {}, {}, \
             async function (exports, module, services, console, require) {{\n{source}\n}}))",
            literal(name, &name)?,
            literal(name, &parents)?,
        );

        let value = self.submit(id, name, code, None).await?;
        let defined: Defined = decode(name, value)?;

        debug!(
            id,
            functions = ?defined.functions,
            duration_ms = start.elapsed().as_millis(),
            "Script evaluated"
        );

        Ok(ScriptExports::new(
            id,
            name.to_string(),
            source,
            defined.functions,
            self.inner.releases.clone(),
        ))
    }

    /// Call an exported entry point with `(state, headers, request)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Script`] if the call throws or rejects.
    #[instrument(skip(self, exports, invocation), fields(name = %exports.name(), entry = entry.as_str()))]
    pub async fn invoke(
        &self,
        exports: &ScriptExports,
        entry: EntryPoint,
        invocation: &Invocation,
    ) -> Result<InvokeOutcome, RuntimeError> {
        let start = Instant::now();
        let call = self.next_id();
        let code = format!(
            "globalThis.__funcurl.run(() => globalThis.__funcurl.invoke({}, \"{}\", JSON.parse({}), {call}))",
            exports.id(),
            entry.as_str(),
            embed(exports.name(), invocation)?
        );

        let resolver = invocation.request.mime_resolver.clone();
        let value = self.submit(call, exports.name(), code, resolver).await?;
        let invoked: Invoked = decode(exports.name(), value)?;
        let outcome = InvokeOutcome {
            value: ScriptValue::from_raw(exports.name(), invoked.value)?,
            state: invoked.state,
            headers: invoked.headers,
        };

        debug!(
            status = outcome.state.status,
            duration_ms = start.elapsed().as_millis(),
            "Handler invoked"
        );
        Ok(outcome)
    }

    /// Run a compiled template program.
    ///
    /// The program runs as the body of
    /// `async function($out, $params, $request, $status, $response, $services, console)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Script`] if the program fails to parse or throws.
    #[instrument(skip(self, program, invocation), fields(program_len = program.len()))]
    pub async fn render(
        &self,
        name: &str,
        program: &str,
        invocation: &Invocation,
    ) -> Result<RenderOutcome, RuntimeError> {
        let call = self.next_id();
        let code = format!(
            "globalThis.__funcurl.run(() => globalThis.__funcurl.render({}, \
             async function ($out, $params, $request, $status, $response, $services, console) {{\n{program}\n}}, \
             JSON.parse({}), {call}))",
            literal(name, &name)?,
            embed(name, invocation)?
        );

        let resolver = invocation.request.mime_resolver.clone();
        let value = self.submit(call, name, code, resolver).await?;
        let rendered: Rendered = decode(name, value)?;
        Ok(RenderOutcome {
            body: rendered.body,
            state: rendered.state,
            headers: rendered.headers,
        })
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn submit(
        &self,
        call: u64,
        name: &str,
        code: String,
        resolver: Option<Arc<dyn MimeResolver>>,
    ) -> Result<serde_json::Value, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .jobs
            .send(Job {
                call,
                name: name.to_string(),
                code,
                resolver,
                reply,
            })
            .await
            .map_err(|_| RuntimeError::EngineUnavailable)?;
        rx.await.map_err(|_| RuntimeError::EngineUnavailable)?
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("running", &self.is_running())
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

/// Serialize `value` as a JS literal.
fn literal<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<String, RuntimeError> {
    serde_json::to_string(value)
        .map_err(|e| RuntimeError::script(name, format!("cannot serialize invocation: {e}")))
}

/// Serialize `value` as a JS string literal holding its JSON.
fn embed<T: Serialize>(name: &str, value: &T) -> Result<String, RuntimeError> {
    let json = literal(name, value)?;
    literal(name, &json)
}

fn decode<T: for<'de> Deserialize<'de>>(name: &str, value: serde_json::Value) -> Result<T, RuntimeError> {
    serde_json::from_value(value)
        .map_err(|e| RuntimeError::script(name, format!("unexpected engine reply: {e}")))
}

fn run_isolate(
    mut jobs: mpsc::Receiver<Job>,
    mut releases: mpsc::UnboundedReceiver<u64>,
    host: HostSlot,
    ready: std::sync::mpsc::SyncSender<Result<(), String>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };

    rt.block_on(async move {
        let mut isolate = match Isolate::new(host) {
            Ok(isolate) => isolate,
            Err(message) => {
                let _ = ready.send(Err(message));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        loop {
            let wake = std::future::poll_fn(|cx| isolate.poll_wake(cx, &mut jobs, &mut releases)).await;
            match wake {
                Wake::Job(job) => isolate.start(job),
                Wake::Release(id) => isolate.release(id),
                Wake::Progress => {}
                Wake::Stalled(reason) => {
                    isolate.settle();
                    isolate.abandon(&reason);
                }
                Wake::Closed => break,
            }
            isolate.settle();
        }
        debug!(abandoned = isolate.pending.len(), "Script engine stopped");
    });
}

/// Why the isolate loop woke up.
enum Wake {
    Job(Job),
    Release(u64),
    /// At least one in-flight call has settled.
    Progress,
    /// The event loop can make no further progress.
    Stalled(String),
    Closed,
}

/// A started job whose promise has not been read yet.
struct InFlight {
    call: u64,
    name: String,
    promise: v8::Global<v8::Value>,
    reply: ReplyTx,
}

struct Isolate {
    runtime: JsRuntime,
    pending: Vec<InFlight>,
}

impl Isolate {
    fn new(host: HostSlot) -> Result<Self, String> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![funcurl_host::init()],
            ..Default::default()
        });
        ops::install(&mut runtime.op_state().borrow_mut(), host);
        runtime
            .execute_script("funcurl:prelude.js", ModuleCodeString::from(PRELUDE.to_string()))
            .map_err(|e| e.to_string())?;
        Ok(Self {
            runtime,
            pending: Vec::new(),
        })
    }

    fn poll_wake(
        &mut self,
        cx: &mut Context<'_>,
        jobs: &mut mpsc::Receiver<Job>,
        releases: &mut mpsc::UnboundedReceiver<u64>,
    ) -> Poll<Wake> {
        if !self.pending.is_empty() {
            match self.runtime.poll_event_loop(cx, PollEventLoopOptions::default()) {
                Poll::Ready(Ok(())) => return Poll::Ready(Wake::Stalled("script never settled".to_string())),
                Poll::Ready(Err(e)) => return Poll::Ready(Wake::Stalled(e.to_string())),
                Poll::Pending if self.any_settled() => return Poll::Ready(Wake::Progress),
                Poll::Pending => {}
            }
        }
        if let Poll::Ready(Some(id)) = releases.poll_recv(cx) {
            return Poll::Ready(Wake::Release(id));
        }
        match jobs.poll_recv(cx) {
            Poll::Ready(Some(job)) => Poll::Ready(Wake::Job(job)),
            Poll::Ready(None) => Poll::Ready(Wake::Closed),
            Poll::Pending => Poll::Pending,
        }
    }

    fn start(&mut self, job: Job) {
        if let Some(resolver) = job.resolver {
            self.runtime
                .op_state()
                .borrow_mut()
                .borrow_mut::<CallResolvers>()
                .insert(job.call, resolver);
        }

        match self
            .runtime
            .execute_script("funcurl:call.js", ModuleCodeString::from(job.code))
        {
            Ok(promise) => {
                trace!(call = job.call, name = %job.name, in_flight = self.pending.len() + 1, "Job started");
                self.pending.push(InFlight {
                    call: job.call,
                    name: job.name,
                    promise,
                    reply: job.reply,
                });
            }
            Err(e) => {
                self.forget(job.call);
                let _ = job.reply.send(Err(RuntimeError::script(job.name, e.to_string())));
            }
        }
    }

    fn release(&mut self, id: u64) {
        let code = format!("globalThis.__funcurl.release({id})");
        if let Err(e) = self
            .runtime
            .execute_script("funcurl:release.js", ModuleCodeString::from(code))
        {
            error!(id, error = %e, "Failed to release script exports");
        } else {
            trace!(id, "Script exports released");
        }
    }

    fn any_settled(&mut self) -> bool {
        deno_core::scope!(scope, &mut self.runtime);
        self.pending.iter().any(|call| {
            let local = v8::Local::new(scope, &call.promise);
            v8::Local::<v8::Promise>::try_from(local)
                .map_or(true, |promise| !matches!(promise.state(), v8::PromiseState::Pending))
        })
    }

    /// Reply to every in-flight call whose promise has settled.
    fn settle(&mut self) {
        let mut done = Vec::new();
        {
            deno_core::scope!(scope, &mut self.runtime);
            let mut i = 0;
            while i < self.pending.len() {
                let local = v8::Local::new(scope, &self.pending[i].promise);
                let outcome = match v8::Local::<v8::Promise>::try_from(local) {
                    Ok(promise) => match promise.state() {
                        v8::PromiseState::Pending => {
                            i += 1;
                            continue;
                        }
                        v8::PromiseState::Fulfilled => Ok(promise.result(scope).to_rust_string_lossy(scope)),
                        v8::PromiseState::Rejected => Err(promise.result(scope).to_rust_string_lossy(scope)),
                    },
                    Err(_) => Ok(local.to_rust_string_lossy(scope)),
                };
                done.push((self.pending.swap_remove(i), outcome));
            }
        }

        for (call, outcome) in done {
            self.forget(call.call);
            let result = outcome
                .map_err(|message| RuntimeError::script(&call.name, message))
                .and_then(|text| read_reply(&call.name, &text));
            trace!(call = call.call, name = %call.name, ok = result.is_ok(), "Job settled");
            let _ = call.reply.send(result);
        }
    }

    /// Fail every call still in flight.
    fn abandon(&mut self, reason: &str) {
        for call in std::mem::take(&mut self.pending) {
            warn!(call = call.call, name = %call.name, reason, "Abandoning script call");
            self.forget(call.call);
            let _ = call.reply.send(Err(RuntimeError::script(call.name, reason)));
        }
    }

    fn forget(&mut self, call: u64) {
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<CallResolvers>()
            .remove(call);
    }
}

fn read_reply(name: &str, text: &str) -> Result<serde_json::Value, RuntimeError> {
    let reply: Reply = serde_json::from_str(text)
        .map_err(|e| RuntimeError::script(name, format!("unexpected engine reply: {e}")))?;
    if reply.ok {
        Ok(reply.value)
    } else {
        let message = reply.error.unwrap_or_else(|| "unknown script error".to_string());
        Err(RuntimeError::script(name, message))
    }
}
