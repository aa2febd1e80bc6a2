//! Ops installed in the isolate.
//!
//! `op_funcurl_require`, `op_funcurl_contents` and `op_funcurl_head` back the
//! prelude's `exrequire`, `excontents` and `exhead`. They run on the isolate
//! thread while the calling job stays pending, so a module evaluation they
//! trigger goes through the job queue like any other.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use deno_core::{OpState, error::CoreError, op2};
use serde::Serialize;
use tracing::trace;

use crate::console::{self, LogLevel};
use crate::host::{ContentArgs, HostSlot, ModuleHost, RequireArgs};
use crate::mime::{self, MimeEntry, MimeResolver};
use crate::module::ModuleExports;

deno_core::extension!(
    funcurl_host,
    ops = [
        op_funcurl_require,
        op_funcurl_contents,
        op_funcurl_head,
        op_funcurl_unpin,
        op_funcurl_mime,
        op_funcurl_log,
    ],
);

/// Required exports kept alive until the script has picked them up.
#[derive(Default)]
pub(crate) struct Pins {
    held: HashMap<u64, Vec<Arc<ModuleExports>>>,
}

impl Pins {
    fn pin(&mut self, id: u64, exports: Arc<ModuleExports>) {
        self.held.entry(id).or_default().push(exports);
    }

    fn unpin(&mut self, id: u64) {
        if let Some(stack) = self.held.get_mut(&id) {
            stack.pop();
            if stack.is_empty() {
                self.held.remove(&id);
            }
        }
    }
}

/// Per-call MIME resolvers, keyed by call id.
#[derive(Default)]
pub(crate) struct CallResolvers {
    by_call: HashMap<u64, Arc<dyn MimeResolver>>,
}

impl CallResolvers {
    pub(crate) fn insert(&mut self, call: u64, resolver: Arc<dyn MimeResolver>) {
        self.by_call.insert(call, resolver);
    }

    pub(crate) fn remove(&mut self, call: u64) {
        self.by_call.remove(&call);
    }
}

/// Put the op state the extension expects.
pub(crate) fn install(state: &mut OpState, host: HostSlot) {
    state.put(host);
    state.put(Pins::default());
    state.put(CallResolvers::default());
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Required {
    Script { id: u64 },
    Data { value: serde_json::Value },
}

#[derive(Serialize)]
struct HeadReply {
    status: u16,
    headers: BTreeMap<String, String>,
}

fn core_err(message: impl std::fmt::Display) -> CoreError {
    CoreError::from(std::io::Error::other(message.to_string()))
}

fn host_of(state: &Rc<RefCell<OpState>>) -> Result<Arc<dyn ModuleHost>, CoreError> {
    state
        .borrow()
        .borrow::<HostSlot>()
        .get()
        .ok_or_else(|| core_err("no module host is attached to the engine"))
}

#[op2]
#[serde]
async fn op_funcurl_require(
    state: Rc<RefCell<OpState>>,
    #[serde] args: RequireArgs,
) -> Result<Required, CoreError> {
    let host = host_of(&state)?;
    let exports = host.require(args).await.map_err(core_err)?;
    match exports.as_ref() {
        ModuleExports::Script(script) => {
            let id = script.id();
            state.borrow_mut().borrow_mut::<Pins>().pin(id, Arc::clone(&exports));
            Ok(Required::Script { id })
        }
        ModuleExports::Data(value) => Ok(Required::Data {
            value: value.clone(),
        }),
    }
}

#[op2]
#[buffer]
async fn op_funcurl_contents(
    state: Rc<RefCell<OpState>>,
    #[serde] args: ContentArgs,
) -> Result<Vec<u8>, CoreError> {
    let host = host_of(&state)?;
    let bytes = host.contents(args).await.map_err(core_err)?;
    Ok(bytes.to_vec())
}

#[op2]
#[serde]
async fn op_funcurl_head(
    state: Rc<RefCell<OpState>>,
    #[serde] args: ContentArgs,
) -> Result<HeadReply, CoreError> {
    let host = host_of(&state)?;
    let meta = host.head(args).await.map_err(core_err)?;
    Ok(HeadReply {
        status: meta.status,
        headers: meta.headers.into_iter().collect(),
    })
}

#[op2]
fn op_funcurl_unpin(state: &mut OpState, #[serde] id: u64) {
    trace!(id, "Unpinning required exports");
    state.borrow_mut::<Pins>().unpin(id);
}

#[op2]
#[serde]
fn op_funcurl_mime(state: &mut OpState, #[serde] call: u64, #[string] extension: String) -> MimeEntry {
    let custom = state.borrow::<CallResolvers>().by_call.get(&call).cloned();
    mime::resolve(custom.as_deref(), &extension)
}

#[op2(fast)]
fn op_funcurl_log(#[string] script: String, #[string] method: String, #[string] message: String) {
    console::emit(&script, LogLevel::from_method(&method), &message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pins_stack_per_id() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let exports = Arc::new(ModuleExports::Script(crate::module::ScriptExports::new(
            3,
            "b/lib.js".into(),
            "",
            Vec::new(),
            tx,
        )));

        let mut pins = Pins::default();
        pins.pin(3, Arc::clone(&exports));
        pins.pin(3, Arc::clone(&exports));
        assert_eq!(Arc::strong_count(&exports), 3);

        pins.unpin(3);
        assert_eq!(Arc::strong_count(&exports), 2);
        pins.unpin(3);
        assert_eq!(Arc::strong_count(&exports), 1);
        assert!(pins.held.is_empty());

        pins.unpin(3);
    }
}
