//! Managed callbacks and the arguments handed to them.

use std::any::Any;

use tracing::debug;

use crate::env::Env;
use crate::error::{BridgeError, Result};
use crate::ffi::pinned::{self, PinGuard, Pinned};
use crate::ffi::{self, napi_callback_info, napi_value};
use crate::prelude::*;
use crate::scope::ValueScope;
use crate::value::Value;

/// A managed function callable from the host.
pub type Callback = dyn Fn(&CallbackArgs<'_>) -> Result<Value>;

/// A managed constructor. Its result is wrapped into the new `this` object.
pub type ConstructorCallback = dyn Fn(&CallbackArgs<'_>) -> Result<Box<dyn Any>>;

/// Which trampoline entered managed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Function,
    Method,
    Getter,
    Setter,
    Constructor,
}

impl CallbackKind {
    pub fn name(self) -> &'static str {
        match self {
            CallbackKind::Function => "function",
            CallbackKind::Method => "method",
            CallbackKind::Getter => "getter",
            CallbackKind::Setter => "setter",
            CallbackKind::Constructor => "constructor",
        }
    }
}

/// The closure set behind one pinned `data` pointer.
///
/// The variant is chosen at registration time, so dispatch never has to
/// guess which callback a trampoline should run.
pub enum CallbackClosure {
    Function(Box<Callback>),
    Method(Box<Callback>),
    Accessor {
        getter: Option<Box<Callback>>,
        setter: Option<Box<Callback>>,
    },
    Constructor(Box<ConstructorCallback>),
}

impl CallbackClosure {
    /// The callback backing a non-constructor trampoline.
    pub(crate) fn select(&self, kind: CallbackKind) -> Result<&Callback> {
        let selected = match (self, kind) {
            (CallbackClosure::Function(f), CallbackKind::Function) => Some(f),
            (CallbackClosure::Method(f), CallbackKind::Method) => Some(f),
            (CallbackClosure::Accessor { getter, .. }, CallbackKind::Getter) => getter.as_ref(),
            (CallbackClosure::Accessor { setter, .. }, CallbackKind::Setter) => setter.as_ref(),
            _ => None,
        };
        selected.map(|f| &**f).ok_or_else(|| {
            BridgeError::invalid_operation(format!(
                "pinned closure has no {} callback",
                kind.name()
            ))
        })
    }

    pub(crate) fn constructor(&self) -> Result<&ConstructorCallback> {
        match self {
            CallbackClosure::Constructor(f) => Ok(&**f),
            _ => Err(BridgeError::invalid_operation(
                "pinned closure is not a constructor",
            )),
        }
    }
}

/// Receiver, arguments and data pointer of one host call.
///
/// Every value here lives in the trampoline's escapable scope.
pub struct CallbackArgs<'s> {
    scope: &'s ValueScope,
    info: napi_callback_info,
    this: Value,
    args: Vec<Value>,
    data: *mut c_void,
}

impl<'s> CallbackArgs<'s> {
    /// Read the call info in two passes: count first, then exactly that many handles.
    ///
    /// # Safety
    /// `info` must be the callback info of the call currently being serviced.
    pub(crate) unsafe fn extract(scope: &'s ValueScope, info: napi_callback_info) -> Result<Self> {
        let env = scope.env();
        let api = ffi::api()?;

        let mut argc = 0usize;
        env.check_status(unsafe {
            (api.get_cb_info)(
                env.raw(),
                info,
                &mut argc,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        })?;

        let mut raw_args: Vec<napi_value> = vec![ptr::null_mut(); argc];
        let mut filled = argc;
        let mut this: napi_value = ptr::null_mut();
        let mut data: *mut c_void = ptr::null_mut();
        env.check_status(unsafe {
            (api.get_cb_info)(
                env.raw(),
                info,
                &mut filled,
                raw_args.as_mut_ptr(),
                &mut this,
                &mut data,
            )
        })?;
        // The host reports the actual count; only the filled prefix is valid
        raw_args.truncate(filled.min(argc));

        let id = scope.id();
        Ok(CallbackArgs {
            scope,
            info,
            this: Value::from_parts(env, id, this),
            args: raw_args
                .into_iter()
                .map(|raw| Value::from_parts(env, id, raw))
                .collect(),
            data,
        })
    }

    pub fn scope(&self) -> &'s ValueScope {
        self.scope
    }

    pub fn env(&self) -> Env {
        self.scope.env()
    }

    pub fn this(&self) -> Value {
        self.this
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.args.get(index).copied()
    }

    /// Argument at `index`, or `undefined` when the caller passed fewer.
    pub fn arg(&self, index: usize) -> Result<Value> {
        match self.get(index) {
            Some(value) => Ok(value),
            None => self.env().get_undefined(),
        }
    }

    pub(crate) fn data(&self) -> *mut c_void {
        self.data
    }

    /// The constructor invoked with `new`, or `None` for a plain call.
    pub fn new_target(&self) -> Result<Option<Value>> {
        let env = self.env();
        let api = ffi::api()?;
        let mut raw: napi_value = ptr::null_mut();
        env.check_status(unsafe { (api.get_new_target)(env.raw(), self.info, &mut raw) })?;
        if raw.is_null() {
            return Ok(None);
        }
        Ok(Some(Value::from_parts(env, self.scope.id(), raw)))
    }
}

// ============================================================================
// Registration
// ============================================================================

/// Create a host function backed by `callback`.
///
/// The closure is pinned until the host finalizes the function object.
pub fn create_function(
    env: Env,
    name: &str,
    callback: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
) -> Result<Value> {
    let mut pins = PinGuard::new();
    let handle = pinned::pin(env, Pinned::Closure(CallbackClosure::Function(Box::new(callback))));
    pins.push(handle);

    let function = env.create_value(|api, out| unsafe {
        (api.create_function)(
            env.raw(),
            name.as_ptr().cast(),
            name.len(),
            Some(ffi::invoke_function),
            handle.as_ptr(),
            out,
        )
    })?;
    pins.attach_to(&function)?;
    debug!(name, "function created");
    Ok(function)
}

impl std::fmt::Debug for CallbackArgs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackArgs")
            .field("scope", &self.scope.id())
            .field("argc", &self.args.len())
            .finish()
    }
}
