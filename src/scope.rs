//! Value scopes.
//!
//! Every [`Value`] belongs to exactly one scope and is valid only while that
//! scope is open. Scopes form a per-thread stack that mirrors the host's
//! native handle-scope stack one-to-one:
//!
//! - a **root** scope marks the boundary where the host hands control to
//!   managed code (module init, a trampoline invocation) and owns no native
//!   scope of its own
//! - a **handle** scope owns one native handle scope
//! - an **escapable** scope owns one native escapable scope and may promote
//!   a single value to its parent
//!
//! Scopes close in strict LIFO order. Closing anything other than the
//! innermost open scope is a discipline violation and fails loudly.
//!
//! Liveness is tracked with [`ScopeId`] tags, so using a value after its
//! scope closed is reported as [`BridgeError::InvalidScope`] instead of
//! handing a dangling handle to the host.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace};

use crate::env::Env;
use crate::error::{BridgeError, Result};
use crate::ffi::{self, napi_escapable_handle_scope, napi_handle_scope, napi_value};
use crate::prelude::*;
use crate::value::Value;

/// Identity of one opened scope. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(core::num::NonZeroU64);

impl ScopeId {
    fn next() -> ScopeId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let raw = NEXT.fetch_add(1, Ordering::Relaxed);
        // The counter starts at one and a u64 does not wrap in practice
        ScopeId(core::num::NonZeroU64::new(raw).unwrap_or(core::num::NonZeroU64::MIN))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a scope owns on the native side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Handle,
    Escapable,
}

#[derive(Debug, Clone, Copy)]
enum NativeScope {
    Root,
    Handle(napi_handle_scope),
    Escapable(napi_escapable_handle_scope),
}

impl NativeScope {
    fn kind(self) -> ScopeKind {
        match self {
            NativeScope::Root => ScopeKind::Root,
            NativeScope::Handle(_) => ScopeKind::Handle,
            NativeScope::Escapable(_) => ScopeKind::Escapable,
        }
    }
}

#[derive(Debug)]
struct Frame {
    id: ScopeId,
    env: Env,
    parent: Option<ScopeId>,
    native: NativeScope,
    escaped: bool,
}

// ============================================================================
// Thread-local scope stack
// ============================================================================

struct ScopeStack {
    frames: Vec<Frame>,
}

impl ScopeStack {
    const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    fn push(&mut self, env: Env, native: NativeScope) -> (ScopeId, Option<ScopeId>) {
        let id = ScopeId::next();
        let parent = self.frames.last().map(|frame| frame.id);
        self.frames.push(Frame {
            id,
            env,
            parent,
            native,
            escaped: false,
        });
        (id, parent)
    }

    fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Pop `id`, which must be the innermost frame.
    fn pop(&mut self, id: ScopeId) -> Result<Frame> {
        match self.frames.last() {
            Some(top) if top.id == id => self.frames.pop().ok_or(BridgeError::InvalidScope),
            top => Err(BridgeError::ScopeMismatch {
                expected: top.map(|frame| frame.id),
                found: id,
            }),
        }
    }

    fn get(&self, id: ScopeId) -> Option<&Frame> {
        // Lookups are almost always for the innermost frames
        self.frames.iter().rev().find(|frame| frame.id == id)
    }

    fn get_mut(&mut self, id: ScopeId) -> Option<&mut Frame> {
        self.frames.iter_mut().rev().find(|frame| frame.id == id)
    }
}

thread_local! {
    static STACK: RefCell<ScopeStack> = const { RefCell::new(ScopeStack::new()) };
}

/// True while the scope `id` is open on this thread.
pub(crate) fn is_live(id: ScopeId) -> bool {
    STACK.with(|stack| stack.borrow().get(id).is_some())
}

/// Innermost open scope, if any.
pub fn current() -> Option<ScopeId> {
    STACK.with(|stack| stack.borrow().top().map(|frame| frame.id))
}

/// Innermost open scope, which must belong to `env`.
pub(crate) fn current_for(env: Env) -> Result<ScopeId> {
    STACK.with(|stack| match stack.borrow().top() {
        Some(frame) if frame.env == env => Ok(frame.id),
        _ => Err(BridgeError::InvalidScope),
    })
}

/// Number of scopes open on this thread.
pub fn depth() -> usize {
    STACK.with(|stack| stack.borrow().frames.len())
}

// ============================================================================
// ValueScope
// ============================================================================

/// Guard for one open scope.
///
/// Dropping the guard closes the scope. Prefer [`ValueScope::close`] where
/// the outcome matters: a drop that finds the scope out of order panics.
pub struct ValueScope {
    id: ScopeId,
    env: Env,
    kind: ScopeKind,
    parent: Option<ScopeId>,
    closed: bool,
    // Scopes live on the thread that opened them
    _not_send: PhantomData<*mut ()>,
}

impl ValueScope {
    /// Mark the boundary of a host-to-managed transition.
    ///
    /// Values the host passes in (receiver, arguments, exports) are tagged
    /// with the root scope. No native scope is opened.
    pub fn root(env: Env) -> ValueScope {
        Self::push(env, NativeScope::Root)
    }

    /// Open a handle scope nested in the current one.
    pub fn open(env: Env) -> Result<ValueScope> {
        let api = ffi::api()?;
        let mut raw: napi_handle_scope = ptr::null_mut();
        // SAFETY: out-parameter points to a live local
        env.check_status(unsafe { (api.open_handle_scope)(env.raw(), &mut raw) })?;
        Ok(Self::push(env, NativeScope::Handle(raw)))
    }

    /// Open an escapable scope nested in the current one.
    pub fn open_escapable(env: Env) -> Result<ValueScope> {
        let api = ffi::api()?;
        let mut raw: napi_escapable_handle_scope = ptr::null_mut();
        env.check_status(unsafe { (api.open_escapable_handle_scope)(env.raw(), &mut raw) })?;
        Ok(Self::push(env, NativeScope::Escapable(raw)))
    }

    fn push(env: Env, native: NativeScope) -> ValueScope {
        let (id, parent) = STACK.with(|stack| stack.borrow_mut().push(env, native));
        trace!(scope = %id, kind = ?native.kind(), "scope opened");
        ValueScope {
            id,
            env,
            kind: native.kind(),
            parent,
            closed: false,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn env(&self) -> Env {
        self.env
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Scope that was innermost when this one opened.
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn is_current(&self) -> bool {
        current() == Some(self.id)
    }

    /// True when `value` was created in this scope.
    pub fn owns(&self, value: &Value) -> bool {
        value.scope_id() == self.id
    }

    /// Promote `value` into the parent scope.
    ///
    /// Only escapable scopes may escape, only values they own, and only once.
    pub fn escape(&self, value: Value) -> Result<Value> {
        if !self.owns(&value) {
            return Err(BridgeError::invalid_operation(
                "cannot escape a value that belongs to another scope",
            ));
        }
        let (handle, parent) = STACK.with(|stack| {
            let stack = stack.borrow();
            let frame = stack.get(self.id).ok_or(BridgeError::InvalidScope)?;
            let NativeScope::Escapable(handle) = frame.native else {
                return Err(BridgeError::invalid_operation(
                    "escape requires an escapable scope",
                ));
            };
            if frame.escaped {
                return Err(BridgeError::invalid_operation(
                    "escape called twice on the same scope",
                ));
            }
            let parent = frame.parent.ok_or_else(|| {
                BridgeError::invalid_operation("escapable scope has no parent to escape into")
            })?;
            Ok((handle, parent))
        })?;

        let raw = value.raw()?;
        let api = ffi::api()?;
        let mut escaped: napi_value = ptr::null_mut();
        self.env.check_status(unsafe {
            (api.escape_handle)(self.env.raw(), handle, raw, &mut escaped)
        })?;
        // A rejected escape leaves the scope's single escape unused
        STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().get_mut(self.id) {
                frame.escaped = true;
            }
        });
        trace!(scope = %self.id, parent = %parent, "value escaped");
        Ok(Value::from_parts(self.env, parent, escaped))
    }

    /// Close the scope, invalidating every value it owns.
    ///
    /// Fails with [`BridgeError::ScopeMismatch`] if this is not the
    /// innermost open scope. That failure is fatal: the native stack is no
    /// longer in a known state.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        let frame = STACK
            .with(|stack| stack.borrow_mut().pop(self.id))
            .inspect_err(|err| error!(scope = %self.id, %err, "scope closed out of order"))?;
        trace!(scope = %self.id, "scope closed");

        let env = frame.env;
        match frame.native {
            NativeScope::Root => Ok(()),
            NativeScope::Handle(raw) => {
                let api = ffi::api()?;
                env.check_status(unsafe { (api.close_handle_scope)(env.raw(), raw) })
            }
            NativeScope::Escapable(raw) => {
                let api = ffi::api()?;
                env.check_status(unsafe { (api.close_escapable_handle_scope)(env.raw(), raw) })
            }
        }
    }
}

impl Drop for ValueScope {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.close_inner() {
            if std::thread::panicking() {
                error!(scope = %self.id, %err, "scope close failed during unwind");
            } else {
                #[allow(clippy::panic)]
                {
                    panic!("scope {} dropped out of order: {}", self.id, err);
                }
            }
        }
    }
}

impl std::fmt::Debug for ValueScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueScope")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .finish()
    }
}
