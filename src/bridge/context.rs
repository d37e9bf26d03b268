//! Per-session debugging state

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::common::{Error, Result};
use crate::location::{BreakpointRequest, Frame};
use crate::store::DebugStore;

/// State of one inspector session's default execution context
///
/// A context becomes ready once and loads its store once; both are guarded
/// by a `OnceCell` so concurrent callers share a single initialization.
pub struct ExecutionContext {
    /// Runtime execution context id
    pub id: i64,
    /// Auxiliary data of the context, echoed on script announcements
    pub aux_data: Option<Value>,
    debugger_id: Mutex<Option<String>>,
    /// Set once the runtime announced readiness and the store loaded
    pub(super) ready: OnceCell<Arc<DebugStore>>,
    /// Set once the store finished loading every module
    pub(super) store: OnceCell<Arc<DebugStore>>,
    /// Breakpoint requests by front-end breakpoint id
    pub breakpoints: DashMap<String, BreakpointRequest>,
    /// Frames of the current pause
    call_stack: Mutex<Option<Arc<Vec<Frame>>>>,
    /// Scope variables fetched during the current pause, by frame and name
    locals: DashMap<(u32, String), Value>,
    /// Value type properties fetched during the current pause, by object id
    value_types: DashMap<String, Value>,
    /// Module urls announced with the readiness marker
    loaded_files: Mutex<Option<Vec<String>>>,
}

impl ExecutionContext {
    pub fn new(id: i64, aux_data: Option<Value>) -> Self {
        Self {
            id,
            aux_data,
            debugger_id: Mutex::new(None),
            ready: OnceCell::new(),
            store: OnceCell::new(),
            breakpoints: DashMap::new(),
            call_stack: Mutex::new(None),
            locals: DashMap::new(),
            value_types: DashMap::new(),
            loaded_files: Mutex::new(None),
        }
    }

    /// Context replacing `previous` after a reload
    ///
    /// Breakpoint requests carry over unresolved so they re-resolve against
    /// the new runtime once it is ready.
    pub fn succeed(id: i64, aux_data: Option<Value>, previous: &ExecutionContext) -> Self {
        let context = Self::new(id, aux_data);
        for entry in previous.breakpoints.iter() {
            context
                .breakpoints
                .insert(entry.key().clone(), entry.value().replay());
        }
        *context.debugger_id.lock() = previous.debugger_id();
        context
    }

    pub fn debugger_id(&self) -> Option<String> {
        self.debugger_id.lock().clone()
    }

    pub fn set_debugger_id(&self, id: Option<String>) {
        *self.debugger_id.lock() = id;
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    /// Whether the store finished loading
    pub fn is_loaded(&self) -> bool {
        self.store.initialized()
    }

    pub fn store(&self) -> Option<Arc<DebugStore>> {
        self.store.get().cloned()
    }

    pub fn set_loaded_files(&self, files: Vec<String>) {
        *self.loaded_files.lock() = Some(files);
    }

    pub fn take_loaded_files(&self) -> Option<Vec<String>> {
        self.loaded_files.lock().take()
    }

    pub fn call_stack(&self) -> Option<Arc<Vec<Frame>>> {
        self.call_stack.lock().clone()
    }

    pub fn set_call_stack(&self, frames: Vec<Frame>) {
        *self.call_stack.lock() = Some(Arc::new(frames));
    }

    /// Frame `id` of the current pause
    pub fn frame(&self, id: u32) -> Result<Frame> {
        let stack = self.call_stack().ok_or(Error::NoCallStack)?;
        stack
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or(Error::ScopeNotFound(id))
    }

    pub fn cached_local(&self, frame: u32, name: &str) -> Option<Value> {
        self.locals
            .get(&(frame, name.to_string()))
            .map(|v| v.value().clone())
    }

    pub fn cache_local(&self, frame: u32, name: &str, value: Value) {
        self.locals.insert((frame, name.to_string()), value);
    }

    pub fn cached_value_type(&self, object_id: &str) -> Option<Value> {
        self.value_types.get(object_id).map(|v| v.value().clone())
    }

    pub fn cache_value_type(&self, object_id: &str, value: Value) {
        self.value_types.insert(object_id.to_string(), value);
    }

    /// Forget everything tied to the current pause
    pub fn clear_state(&self) {
        *self.call_stack.lock() = None;
        self.locals.clear();
        self.value_types.clear();
    }
}
