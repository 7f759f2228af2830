//! Callback trampolines.
//!
//! The host calls one of these `extern "C"` entry points whenever managed
//! code registered a function, method, accessor or constructor. Each one:
//!
//! 1. marks the host-to-managed boundary with a root scope
//! 2. opens an escapable scope and reads receiver, arguments and data
//! 3. maps the data pointer back to its pinned closure and runs it under
//!    `catch_unwind`
//! 4. escapes the result into the root scope
//!
//! No failure crosses back into the host as an unwind. Errors and panics
//! become a thrown JS error and the call returns `undefined`. A scope
//! stack that no longer matches the host's is reported through the host's
//! fatal-error hook.

use core::ffi::c_void;
use core::ptr;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, trace, warn};

use crate::callback::{CallbackArgs, CallbackClosure, CallbackKind};
use crate::env::Env;
use crate::error::{BridgeError, Result};
use crate::ffi::pinned::{self, Pinned, PinnedHandle};
use crate::scope::ValueScope;
use crate::value::Value;

use super::{napi_callback_info, napi_env, napi_value};

// ============================================================================
// Entry Points
// ============================================================================

/// Trampoline for free functions created with `create_function`.
pub unsafe extern "C" fn invoke_function(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe { dispatch(env, info, CallbackKind::Function) }
}

/// Trampoline for methods installed through property descriptors.
pub unsafe extern "C" fn invoke_method(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe { dispatch(env, info, CallbackKind::Method) }
}

pub unsafe extern "C" fn invoke_getter(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe { dispatch(env, info, CallbackKind::Getter) }
}

pub unsafe extern "C" fn invoke_setter(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe { dispatch(env, info, CallbackKind::Setter) }
}

/// Trampoline for class constructors. Wraps the constructed native
/// instance into `this`.
pub unsafe extern "C" fn invoke_constructor(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe { dispatch(env, info, CallbackKind::Constructor) }
}

/// Finalizer releasing one pinned payload.
pub unsafe extern "C" fn release_pinned(_env: napi_env, data: *mut c_void, _hint: *mut c_void) {
    // Payload destructors run user code; an unwind must not reach the host
    let released = panic::catch_unwind(|| pinned::release(PinnedHandle::from_ptr(data)));
    match released {
        Ok(true) => {}
        Ok(false) => warn!(handle = ?data, "finalizer for unknown pinned payload"),
        Err(_) => error!(handle = ?data, "pinned payload panicked while dropping"),
    }
}

// ============================================================================
// Dispatch
// ============================================================================

unsafe fn dispatch(raw_env: napi_env, info: napi_callback_info, kind: CallbackKind) -> napi_value {
    if raw_env.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: the host passes its own live environment
    let env = unsafe { Env::from_raw(raw_env) };
    trace!(kind = kind.name(), "trampoline entered");

    let root = ValueScope::root(env);
    let result = match invoke_in_scope(env, info, kind) {
        Ok(raw) => raw,
        Err(err) if corrupts_scope_stack(&err) => abort_on_corruption(env, kind, &err),
        Err(err) => {
            report_failure(env, kind.name(), &err);
            undefined_or_null(env)
        }
    };
    if let Err(err) = root.close() {
        abort_on_corruption(env, kind, &err);
    }
    result
}

fn invoke_in_scope(env: Env, info: napi_callback_info, kind: CallbackKind) -> Result<napi_value> {
    let scope = ValueScope::open_escapable(env)?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_closure(&scope, info, kind)));
    let result = match outcome {
        Ok(Ok(value)) => promote(&scope, value),
        Ok(Err(err)) => Err(err),
        Err(payload) => Err(BridgeError::callback(panic_message(payload.as_ref()))),
    };
    // The scope must close whatever the closure did; a mismatch here wins
    scope.close()?;
    result.and_then(|value| value.raw())
}

fn run_closure(scope: &ValueScope, info: napi_callback_info, kind: CallbackKind) -> Result<Value> {
    // SAFETY: `info` is the call currently being serviced
    let args = unsafe { CallbackArgs::extract(scope, info) }?;

    // SAFETY: the owning object is rooted by the host for the duration of the call
    let closure = match unsafe { pinned::resolve(args.data()) } {
        Some(Pinned::Closure(closure)) => closure,
        Some(Pinned::Instance(_)) | None => {
            return Err(BridgeError::invalid_operation(
                "callback data does not name a live pinned closure",
            ));
        }
    };

    match kind {
        CallbackKind::Constructor => construct(closure, &args),
        _ => {
            let callback = closure.select(kind)?;
            callback(&args)
        }
    }
}

fn construct(closure: &CallbackClosure, args: &CallbackArgs<'_>) -> Result<Value> {
    let constructor = closure.constructor()?;
    let instance = constructor(args)?;
    let this = args.this();
    let env = args.env();
    let raw = this.raw()?;

    let handle = pinned::pin(env, Pinned::Instance(instance));
    let wrapped = env.call(|api| unsafe {
        (api.wrap)(
            env.raw(),
            raw,
            handle.as_ptr(),
            Some(release_pinned),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    });
    if let Err(err) = wrapped {
        pinned::release(handle);
        return Err(err);
    }
    Ok(this)
}

/// Move the closure's result into the root scope.
///
/// Anything tagged with the trampoline's scope is escaped. That covers values
/// the closure created as well as the receiver and arguments, which are read
/// into this scope. A value owned by an outer scope that is still open is
/// passed through as is.
fn promote(scope: &ValueScope, value: Value) -> Result<Value> {
    if scope.owns(&value) {
        scope.escape(value)
    } else {
        value.raw()?;
        Ok(value)
    }
}

// ============================================================================
// Failure Handling
// ============================================================================

/// Surface a managed failure as a pending JS exception.
pub(crate) fn report_failure(env: Env, location: &str, err: &BridgeError) {
    if err.is_fatal() {
        error!(location, code = err.code(), %err, "managed callback failed");
    } else {
        warn!(location, code = err.code(), %err, "managed callback failed");
    }
    if err.is_pending_exception() || env.is_exception_pending().unwrap_or(false) {
        return;
    }
    if let Err(throw_err) = env.throw_error(err.code(), &err.to_string()) {
        error!(location, %throw_err, "could not throw callback failure");
    }
}

fn undefined_or_null(env: Env) -> napi_value {
    env.get_undefined()
        .and_then(|value| value.raw())
        .unwrap_or(ptr::null_mut())
}

/// The managed scope stack no longer matches the host's.
fn corrupts_scope_stack(err: &BridgeError) -> bool {
    match err {
        BridgeError::ScopeMismatch { .. } => true,
        BridgeError::Status { status, .. } => status.is_corruption(),
        _ => false,
    }
}

fn abort_on_corruption(env: Env, kind: CallbackKind, err: &BridgeError) -> ! {
    env.fatal_error(&format!("napi_bridge::{} trampoline", kind.name()), &err.to_string())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic in native callback: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic in native callback: {message}")
    } else {
        "panic in native callback".to_string()
    }
}
