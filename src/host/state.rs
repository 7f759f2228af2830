//! Per-environment state of the reference host.
//!
//! Everything here is plain Rust: operations return [`HostResult`] and never
//! call back into native code. The `extern "C"` layer in `abi` translates
//! raw pointers, releases the state borrow around callbacks and finalizers
//! and records the outcome as the environment's last error.

use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::ffi::{self, napi_status, napi_value, napi_value__};
use crate::prelude::*;

use super::HostConfig;
use super::heap::{GcStats, Heap, ObjectId};
use super::object::{
    Finalizer, HostObject, HostValue, Key, NativeCallback, ObjectKind, Property, PropertySlot,
};

// ============================================================================
// Failures
// ============================================================================

/// A failed host operation: the status to report plus a static message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HostFailure {
    pub status: napi_status,
    pub message: &'static str,
}

impl HostFailure {
    pub(crate) const fn new(status: napi_status, message: &'static str) -> Self {
        Self { status, message }
    }

    pub(crate) const fn invalid_arg(message: &'static str) -> Self {
        Self::new(ffi::napi_invalid_arg, message)
    }

    pub(crate) const fn generic(message: &'static str) -> Self {
        Self::new(ffi::napi_generic_failure, message)
    }

    pub(crate) const fn pending_exception() -> Self {
        Self::new(ffi::napi_pending_exception, "an exception is pending")
    }
}

pub(crate) type HostResult<T> = Result<T, HostFailure>;

/// Storage behind `get_last_error_info`. The info block points into `message`.
struct LastError {
    message: Option<CString>,
    info: ffi::napi_extended_error_info,
}

impl LastError {
    fn new() -> Self {
        Self {
            message: None,
            info: ffi::napi_extended_error_info {
                error_message: ptr::null(),
                engine_reserved: ptr::null_mut(),
                engine_error_code: 0,
                error_code: ffi::napi_ok,
            },
        }
    }

    fn set(&mut self, failure: Option<HostFailure>) {
        match failure {
            Some(failure) => {
                let message = CString::new(failure.message).ok();
                self.info.error_message = message.as_ref().map_or(ptr::null(), |m| m.as_ptr());
                self.info.error_code = failure.status;
                self.message = message;
            }
            None => {
                self.info.error_message = ptr::null();
                self.info.error_code = ffi::napi_ok;
                self.message = None;
            }
        }
    }
}

// ============================================================================
// Scopes, references and call frames
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Handle,
    Escapable { slot: usize, escaped: bool },
    /// Opened by the host itself around a callback or module load.
    Frame,
}

#[derive(Debug)]
struct NativeScope {
    id: usize,
    start: usize,
    kind: ScopeKind,
}

#[derive(Debug)]
struct RefEntry {
    target: ObjectId,
    count: u32,
}

#[derive(Debug)]
pub(crate) struct CallFrame {
    id: usize,
    scope: usize,
    callee: HostValue,
    pub this: HostValue,
    pub args: Vec<HostValue>,
    pub new_target: Option<HostValue>,
    pub data: *mut c_void,
}

/// A call the host is about to make into native code.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub callback: NativeCallback,
    pub callee: HostValue,
    pub this: HostValue,
    pub args: Vec<HostValue>,
    pub new_target: Option<HostValue>,
}

/// Handles for a call in progress.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveCall {
    pub frame: usize,
    pub scope: usize,
    pub callback: NativeCallback,
}

/// Where a property lookup ended.
pub(crate) enum Lookup {
    Missing,
    Own(Property),
    Inherited(Property),
}

// ============================================================================
// HostState
// ============================================================================

pub(crate) struct HostState {
    config: HostConfig,
    heap: Heap<HostObject>,
    handles: Vec<HostValue>,
    scopes: Vec<NativeScope>,
    next_scope: usize,
    references: FxHashMap<usize, RefEntry>,
    frames: Vec<CallFrame>,
    next_frame: usize,
    symbols: Vec<Rc<str>>,
    global: ObjectId,
    exports: Option<HostValue>,
    pending_exception: Option<HostValue>,
    last_error: LastError,
}

const MAX_PROTOTYPE_DEPTH: usize = 64;

/// Reference ids are unique across environments, so a reference that
/// outlived its runtime never names one of a later runtime.
fn next_reference_id() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl HostState {
    pub(crate) fn new(config: HostConfig) -> Self {
        let mut heap = Heap::new(config.gc_threshold);
        let global = heap.alloc(HostObject::new(ObjectKind::Plain, None));
        Self {
            config,
            heap,
            handles: Vec::new(),
            scopes: Vec::new(),
            next_scope: 1,
            references: FxHashMap::default(),
            frames: Vec::new(),
            next_frame: 1,
            symbols: Vec::new(),
            global,
            exports: None,
            pending_exception: None,
            last_error: LastError::new(),
        }
    }

    pub(crate) fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Store the outcome of an entry point and return its status code.
    pub(crate) fn record(&mut self, result: HostResult<()>) -> napi_status {
        match result {
            Ok(()) => {
                self.last_error.set(None);
                ffi::napi_ok
            }
            Err(failure) => {
                trace!(status = failure.status, message = failure.message, "host call failed");
                self.last_error.set(Some(failure));
                failure.status
            }
        }
    }

    pub(crate) fn last_error_info(&self) -> *const ffi::napi_extended_error_info {
        &self.last_error.info
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Allocate a handle in the innermost open scope.
    pub(crate) fn push_handle(&mut self, value: HostValue) -> napi_value {
        self.handles.push(value);
        self.handles.len() as *mut napi_value__
    }

    pub(crate) fn value(&self, raw: napi_value) -> HostResult<HostValue> {
        (raw as usize)
            .checked_sub(1)
            .and_then(|index| self.handles.get(index))
            .cloned()
            .ok_or(HostFailure::invalid_arg("unknown or expired value handle"))
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.len()
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    fn push_scope(&mut self, kind: ScopeKind) -> HostResult<usize> {
        if self.scopes.len() >= self.config.max_scope_depth {
            return Err(HostFailure::generic("handle scope depth limit reached"));
        }
        let id = self.next_scope;
        self.next_scope += 1;
        self.scopes.push(NativeScope {
            id,
            start: self.handles.len(),
            kind,
        });
        Ok(id)
    }

    pub(crate) fn open_scope(&mut self) -> HostResult<usize> {
        self.push_scope(ScopeKind::Handle)
    }

    /// Reserve the parent slot, then open the scope above it.
    pub(crate) fn open_escapable_scope(&mut self) -> HostResult<usize> {
        let slot = self.handles.len();
        self.handles.push(HostValue::Undefined);
        let opened = self.push_scope(ScopeKind::Escapable {
            slot,
            escaped: false,
        });
        if opened.is_err() {
            self.handles.pop();
        }
        opened
    }

    pub(crate) fn open_frame_scope(&mut self) -> HostResult<usize> {
        self.push_scope(ScopeKind::Frame)
    }

    fn close_matching(&mut self, id: usize, matches: impl Fn(ScopeKind) -> bool) -> HostResult<()> {
        match self.scopes.last() {
            Some(top) if top.id == id && matches(top.kind) => {
                self.handles.truncate(top.start);
                self.scopes.pop();
                Ok(())
            }
            _ => Err(HostFailure::new(
                ffi::napi_handle_scope_mismatch,
                "scope is not the innermost open scope",
            )),
        }
    }

    pub(crate) fn close_scope(&mut self, id: usize) -> HostResult<()> {
        self.close_matching(id, |kind| kind == ScopeKind::Handle)
    }

    pub(crate) fn close_escapable_scope(&mut self, id: usize) -> HostResult<()> {
        self.close_matching(id, |kind| matches!(kind, ScopeKind::Escapable { .. }))
    }

    pub(crate) fn close_frame_scope(&mut self, id: usize) -> HostResult<()> {
        self.close_matching(id, |kind| kind == ScopeKind::Frame)
    }

    /// Copy `raw` into the slot reserved below escapable scope `id`.
    pub(crate) fn escape(&mut self, id: usize, raw: napi_value) -> HostResult<napi_value> {
        let value = self.value(raw)?;
        let scope = self
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.id == id)
            .ok_or(HostFailure::invalid_arg("unknown escapable scope"))?;
        let ScopeKind::Escapable { slot, escaped } = &mut scope.kind else {
            return Err(HostFailure::invalid_arg("scope is not escapable"));
        };
        if *escaped {
            return Err(HostFailure::new(
                ffi::napi_escape_called_twice,
                "escape called twice on the same scope",
            ));
        }
        *escaped = true;
        let slot = *slot;
        let target = self
            .handles
            .get_mut(slot)
            .ok_or(HostFailure::generic("escape slot was truncated"))?;
        *target = value;
        Ok((slot + 1) as *mut napi_value__)
    }

    pub(crate) fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    // ========================================================================
    // Objects
    // ========================================================================

    pub(crate) fn alloc(&mut self, object: HostObject) -> ObjectId {
        self.heap.alloc(object)
    }

    pub(crate) fn global(&self) -> ObjectId {
        self.global
    }

    pub(crate) fn object(&self, id: ObjectId) -> HostResult<&HostObject> {
        self.heap
            .get(id)
            .ok_or(HostFailure::generic("object was collected"))
    }

    pub(crate) fn object_mut(&mut self, id: ObjectId) -> HostResult<&mut HostObject> {
        self.heap
            .get_mut(id)
            .ok_or(HostFailure::generic("object was collected"))
    }

    pub(crate) fn object_id(&self, value: &HostValue) -> HostResult<ObjectId> {
        value.as_object().ok_or(HostFailure::new(
            ffi::napi_object_expected,
            "an object was expected",
        ))
    }

    pub(crate) fn function_callback(&self, value: &HostValue) -> HostResult<NativeCallback> {
        value
            .as_object()
            .and_then(|id| self.heap.get(id))
            .and_then(HostObject::callback)
            .ok_or(HostFailure::new(
                ffi::napi_function_expected,
                "a function was expected",
            ))
    }

    pub(crate) fn type_of(&self, value: &HostValue) -> HostResult<ffi::napi_valuetype> {
        if let Some(ty) = value.primitive_type() {
            return Ok(ty);
        }
        let id = self.object_id(value)?;
        let object = self.object(id)?;
        Ok(if object.is_function() {
            ffi::napi_function
        } else if object.external_data().is_some() {
            ffi::napi_external
        } else {
            ffi::napi_object
        })
    }

    pub(crate) fn string(&self, value: &HostValue) -> HostResult<Rc<str>> {
        match value {
            HostValue::String(s) => Ok(s.clone()),
            _ => Err(HostFailure::new(
                ffi::napi_string_expected,
                "a string was expected",
            )),
        }
    }

    pub(crate) fn create_symbol(&mut self, description: Rc<str>) -> HostValue {
        self.symbols.push(description);
        HostValue::Symbol((self.symbols.len() - 1) as u32)
    }

    pub(crate) fn symbol_description(&self, symbol: u32) -> Option<&str> {
        self.symbols.get(symbol as usize).map(|s| &**s)
    }

    pub(crate) fn key(&self, value: &HostValue) -> HostResult<Key> {
        match value {
            HostValue::String(s) => Ok(Key::String(s.clone())),
            HostValue::Symbol(id) => Ok(Key::Symbol(*id)),
            _ => Err(HostFailure::new(
                ffi::napi_name_expected,
                "a string or symbol name was expected",
            )),
        }
    }

    pub(crate) fn create_function(&mut self, name: Rc<str>, callback: NativeCallback) -> ObjectId {
        self.alloc(HostObject::new(ObjectKind::Function { name, callback }, None))
    }

    /// An external value carrying `data`, finalized through `finalizer`.
    pub(crate) fn create_external(&mut self, data: *mut c_void, finalizer: Option<Finalizer>) -> ObjectId {
        let mut external = HostObject::new(ObjectKind::External { data }, None);
        external.finalizers.extend(finalizer);
        self.alloc(external)
    }

    pub(crate) fn external_data(&self, value: &HostValue) -> HostResult<*mut c_void> {
        value
            .as_object()
            .and_then(|id| self.object(id).ok())
            .and_then(HostObject::external_data)
            .ok_or(HostFailure::invalid_arg("an external value was expected"))
    }

    /// An `Error` object with `message` and an optional `code`.
    pub(crate) fn create_error(&mut self, code: Option<Rc<str>>, message: Rc<str>) -> ObjectId {
        let mut error = HostObject::new(ObjectKind::Error, None);
        let hidden = ffi::napi_writable | ffi::napi_configurable;
        error.set_data(Key::from("name"), HostValue::String(Rc::from("Error")), hidden);
        error.set_data(Key::from("message"), HostValue::String(message), hidden);
        if let Some(code) = code {
            error.set_data(Key::from("code"), HostValue::String(code), ffi::napi_default_jsproperty);
        }
        self.alloc(error)
    }

    /// Find `key` on `id` or its prototype chain.
    pub(crate) fn lookup(&self, id: ObjectId, key: &Key) -> HostResult<Lookup> {
        let mut current = Some(id);
        let mut depth = 0;
        while let Some(holder) = current {
            let object = self.object(holder)?;
            if let Some(property) = object.properties.get(key) {
                return Ok(if holder == id {
                    Lookup::Own(property.clone())
                } else {
                    Lookup::Inherited(property.clone())
                });
            }
            depth += 1;
            if depth > MAX_PROTOTYPE_DEPTH {
                break;
            }
            current = object.prototype;
        }
        Ok(Lookup::Missing)
    }

    /// Read a data property. Accessors are left to the caller.
    pub(crate) fn get_data(&self, id: ObjectId, key: &Key) -> HostResult<Option<HostValue>> {
        Ok(match self.lookup(id, key)? {
            Lookup::Own(property) | Lookup::Inherited(property) => match property.slot {
                PropertySlot::Data(value) => Some(value),
                PropertySlot::Accessor { .. } => None,
            },
            Lookup::Missing => None,
        })
    }

    pub(crate) fn define(&mut self, id: ObjectId, key: Key, property: Property) -> HostResult<()> {
        self.object_mut(id)?.properties.insert(key, property);
        Ok(())
    }

    /// Plain assignment of a data value, honoring `writable`.
    pub(crate) fn assign(&mut self, id: ObjectId, key: Key, value: HostValue) -> HostResult<()> {
        match self.lookup(id, &key)? {
            Lookup::Own(property) => {
                if property.is_writable() {
                    if let Some(own) = self.object_mut(id)?.properties.get_mut(&key) {
                        own.slot = PropertySlot::Data(value);
                    }
                }
                Ok(())
            }
            // Non-writable inherited data silently blocks the write
            Lookup::Inherited(property) if !property.is_writable() => Ok(()),
            _ => self.define(id, key, Property::data(value, ffi::napi_default_jsproperty)),
        }
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    pub(crate) fn throw(&mut self, value: HostValue) -> HostResult<()> {
        if self.pending_exception.is_some() {
            return Err(HostFailure::pending_exception());
        }
        debug!("exception thrown");
        self.pending_exception = Some(value);
        Ok(())
    }

    pub(crate) fn check_no_exception(&self) -> HostResult<()> {
        match self.pending_exception {
            Some(_) => Err(HostFailure::pending_exception()),
            None => Ok(()),
        }
    }

    pub(crate) fn is_exception_pending(&self) -> bool {
        self.pending_exception.is_some()
    }

    pub(crate) fn pending_exception(&self) -> Option<&HostValue> {
        self.pending_exception.as_ref()
    }

    pub(crate) fn take_exception(&mut self) -> Option<HostValue> {
        self.pending_exception.take()
    }

    // ========================================================================
    // References
    // ========================================================================

    pub(crate) fn create_reference(&mut self, value: &HostValue, count: u32) -> HostResult<usize> {
        let target = self.object_id(value)?;
        let id = next_reference_id();
        self.references.insert(id, RefEntry { target, count });
        Ok(id)
    }

    pub(crate) fn delete_reference(&mut self, id: usize) -> HostResult<()> {
        self.references
            .remove(&id)
            .map(|_| ())
            .ok_or(HostFailure::invalid_arg("unknown reference"))
    }

    fn reference_mut(&mut self, id: usize) -> HostResult<&mut RefEntry> {
        self.references
            .get_mut(&id)
            .ok_or(HostFailure::invalid_arg("unknown reference"))
    }

    pub(crate) fn reference_ref(&mut self, id: usize) -> HostResult<u32> {
        let entry = self.reference_mut(id)?;
        entry.count = entry.count.saturating_add(1);
        Ok(entry.count)
    }

    pub(crate) fn reference_unref(&mut self, id: usize) -> HostResult<u32> {
        let entry = self.reference_mut(id)?;
        if entry.count == 0 {
            return Err(HostFailure::generic("reference count is already zero"));
        }
        entry.count -= 1;
        Ok(entry.count)
    }

    /// The target, or `None` once a weak target was collected.
    pub(crate) fn reference_value(&self, id: usize) -> HostResult<Option<HostValue>> {
        let entry = self
            .references
            .get(&id)
            .ok_or(HostFailure::invalid_arg("unknown reference"))?;
        Ok(self
            .heap
            .is_alive(entry.target)
            .then_some(HostValue::Object(entry.target)))
    }

    pub(crate) fn reference_count(&self) -> usize {
        self.references.len()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Push the frame and its handle scope for a native call.
    pub(crate) fn begin_call(&mut self, call: PendingCall) -> HostResult<ActiveCall> {
        self.check_no_exception()?;
        let scope = self.open_frame_scope()?;
        let frame = self.next_frame;
        self.next_frame += 1;
        self.frames.push(CallFrame {
            id: frame,
            scope,
            callee: call.callee,
            this: call.this,
            args: call.args,
            new_target: call.new_target,
            data: call.callback.data,
        });
        Ok(ActiveCall {
            frame,
            scope,
            callback: call.callback,
        })
    }

    pub(crate) fn frame(&self, info: ffi::napi_callback_info) -> HostResult<&CallFrame> {
        let id = info as usize;
        self.frames
            .iter()
            .rev()
            .find(|frame| frame.id == id)
            .ok_or(HostFailure::invalid_arg("callback info does not name an active call"))
    }

    /// Read the callback's result and pop its frame.
    pub(crate) fn end_call(&mut self, call: ActiveCall, raw: napi_value) -> HostResult<HostValue> {
        let result = if raw.is_null() {
            HostValue::Undefined
        } else {
            self.value(raw).unwrap_or(HostValue::Undefined)
        };
        if let Some(position) = self.frames.iter().rposition(|frame| frame.id == call.frame) {
            self.frames.truncate(position);
        }
        self.close_frame_scope(call.scope)?;
        self.check_no_exception()?;
        Ok(result)
    }

    // ========================================================================
    // Module exports
    // ========================================================================

    pub(crate) fn set_exports(&mut self, exports: HostValue) {
        self.exports = Some(exports);
    }

    pub(crate) fn exports(&self) -> Option<&HostValue> {
        self.exports.as_ref()
    }

    // ========================================================================
    // Collection
    // ========================================================================

    fn roots(&self) -> Vec<ObjectId> {
        let frame_values = self.frames.iter().flat_map(|frame| {
            [&frame.callee, &frame.this]
                .into_iter()
                .chain(frame.args.iter())
                .chain(frame.new_target.iter())
        });
        let strong_refs = self
            .references
            .values()
            .filter(|entry| entry.count > 0)
            .map(|entry| entry.target);

        self.handles
            .iter()
            .chain(frame_values)
            .chain(self.exports.iter())
            .chain(self.pending_exception.iter())
            .filter_map(HostValue::as_object)
            .chain(strong_refs)
            .chain([self.global])
            .collect()
    }

    /// Collect now and hand back the finalizers of everything swept.
    pub(crate) fn collect(&mut self) -> Vec<Finalizer> {
        let roots = self.roots();
        let swept = self.heap.collect(roots);
        debug!(swept = swept.len(), "collection finished");
        swept.into_iter().flat_map(HostObject::into_finalizers).collect()
    }

    pub(crate) fn maybe_collect(&mut self) -> Vec<Finalizer> {
        if self.heap.should_collect() {
            self.collect()
        } else {
            Vec::new()
        }
    }

    /// Drop every object, for environment teardown.
    pub(crate) fn teardown(&mut self) -> Vec<Finalizer> {
        self.handles.clear();
        self.scopes.clear();
        self.frames.clear();
        self.references.clear();
        self.exports = None;
        self.pending_exception = None;
        self.heap
            .drain()
            .into_iter()
            .flat_map(HostObject::into_finalizers)
            .collect()
    }

    pub(crate) fn stats(&self) -> GcStats {
        self.heap.stats()
    }

    pub(crate) fn set_gc_threshold(&mut self, threshold: usize) {
        self.heap.set_gc_threshold(threshold);
    }
}
