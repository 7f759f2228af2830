//! Scoped value handles.

use std::any::Any;

use crate::env::{Env, to_c_string};
use crate::error::{BridgeError, Result};
use crate::ffi::{self, napi_value, napi_valuetype};
use crate::ffi::pinned::{self, Pinned, PinnedHandle};
use crate::prelude::*;
use crate::scope::{self, ScopeId};

/// Host value type as reported by `typeof`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Function,
    External,
    BigInt,
}

impl ValueType {
    pub fn from_raw(raw: napi_valuetype) -> Option<ValueType> {
        Some(match raw {
            ffi::napi_undefined => ValueType::Undefined,
            ffi::napi_null => ValueType::Null,
            ffi::napi_boolean => ValueType::Boolean,
            ffi::napi_number => ValueType::Number,
            ffi::napi_string => ValueType::String,
            ffi::napi_symbol => ValueType::Symbol,
            ffi::napi_object => ValueType::Object,
            ffi::napi_function => ValueType::Function,
            ffi::napi_external => ValueType::External,
            ffi::napi_bigint => ValueType::BigInt,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Undefined => "undefined",
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Symbol => "symbol",
            ValueType::Object => "object",
            ValueType::Function => "function",
            ValueType::External => "external",
            ValueType::BigInt => "bigint",
        }
    }

    pub fn is_object_like(self) -> bool {
        matches!(self, ValueType::Object | ValueType::Function)
    }
}

/// A host value handle bound to the scope that created it.
///
/// Copying a `Value` copies the handle, not the host value. Every copy
/// becomes unusable once the owning scope closes; accessing the raw handle
/// afterwards fails with [`BridgeError::InvalidScope`].
#[derive(Clone, Copy)]
pub struct Value {
    env: Env,
    scope: ScopeId,
    raw: napi_value,
}

impl Value {
    pub(crate) fn from_parts(env: Env, scope: ScopeId, raw: napi_value) -> Value {
        Value { env, scope, raw }
    }

    /// Adopt a raw handle into the current scope.
    ///
    /// # Safety
    /// `raw` must be a handle the host allocated in the native scope that
    /// corresponds to the current managed scope (or one of its ancestors).
    pub unsafe fn from_raw(env: Env, raw: napi_value) -> Result<Value> {
        let scope = scope::current_for(env)?;
        Ok(Value::from_parts(env, scope, raw))
    }

    pub fn env(&self) -> Env {
        self.env
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    pub fn is_live(&self) -> bool {
        scope::is_live(self.scope)
    }

    /// The raw handle, if the owning scope is still open.
    pub fn raw(&self) -> Result<napi_value> {
        if self.is_live() {
            Ok(self.raw)
        } else {
            Err(BridgeError::InvalidScope)
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn value_type(&self) -> Result<ValueType> {
        let raw = self.raw()?;
        let mut ty: napi_valuetype = ffi::napi_undefined;
        self.env
            .call(|api| unsafe { (api.typeof_)(self.env.raw(), raw, &mut ty) })?;
        ValueType::from_raw(ty).ok_or_else(|| {
            BridgeError::invalid_operation(format!("host reported unknown value type {ty}"))
        })
    }

    pub fn is_undefined(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Undefined)
    }

    pub fn strict_equals(&self, other: &Value) -> Result<bool> {
        let lhs = self.raw()?;
        let rhs = other.raw()?;
        let mut equal = false;
        self.env
            .call(|api| unsafe { (api.strict_equals)(self.env.raw(), lhs, rhs, &mut equal) })?;
        Ok(equal)
    }

    fn expect_type(&self, expected: ValueType) -> Result<()> {
        let found = self.value_type()?;
        if found == expected {
            Ok(())
        } else {
            Err(BridgeError::type_mismatch(expected.name(), found.name()))
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.expect_type(ValueType::Number)?;
        let raw = self.raw()?;
        let mut out = 0.0;
        self.env
            .call(|api| unsafe { (api.get_value_double)(self.env.raw(), raw, &mut out) })?;
        Ok(out)
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.expect_type(ValueType::Boolean)?;
        let raw = self.raw()?;
        let mut out = false;
        self.env
            .call(|api| unsafe { (api.get_value_bool)(self.env.raw(), raw, &mut out) })?;
        Ok(out)
    }

    /// Copy a string value out of the host.
    pub fn as_string(&self) -> Result<String> {
        self.expect_type(ValueType::String)?;
        let raw = self.raw()?;
        let env = self.env.raw();

        // Ask for the byte length first, then copy with room for the NUL
        let mut len = 0usize;
        self.env.call(|api| unsafe {
            (api.get_value_string_utf8)(env, raw, ptr::null_mut(), 0, &mut len)
        })?;
        let mut buf = vec![0u8; len + 1];
        let mut written = 0usize;
        self.env.call(|api| unsafe {
            (api.get_value_string_utf8)(env, raw, buf.as_mut_ptr().cast(), buf.len(), &mut written)
        })?;
        buf.truncate(written);
        String::from_utf8(buf)
            .map_err(|_| BridgeError::invalid_operation("host returned invalid UTF-8"))
    }

    // ========================================================================
    // Objects and functions
    // ========================================================================

    /// Read a named property. The result lives in the current scope.
    pub fn get_named(&self, name: &str) -> Result<Value> {
        let raw = self.raw()?;
        let name = to_c_string(name)?;
        self.env.create_value(|api, out| unsafe {
            (api.get_named_property)(self.env.raw(), raw, name.as_ptr(), out)
        })
    }

    pub fn set_named(&self, name: &str, value: Value) -> Result<()> {
        let raw = self.raw()?;
        let value = value.raw()?;
        let name = to_c_string(name)?;
        self.env.call(|api| unsafe {
            (api.set_named_property)(self.env.raw(), raw, name.as_ptr(), value)
        })
    }

    /// Call this function value with an explicit receiver.
    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value> {
        let func = self.raw()?;
        let recv = this.raw()?;
        let argv = raw_args(args)?;
        self.env.create_value(|api, out| unsafe {
            (api.call_function)(self.env.raw(), recv, func, argv.len(), argv.as_ptr(), out)
        })
    }

    /// Invoke this value as a constructor.
    pub fn construct(&self, args: &[Value]) -> Result<Value> {
        let ctor = self.raw()?;
        let argv = raw_args(args)?;
        self.env.create_value(|api, out| unsafe {
            (api.new_instance)(self.env.raw(), ctor, argv.len(), argv.as_ptr(), out)
        })
    }

    // ========================================================================
    // Wrapped native instances
    // ========================================================================

    fn wrapped_handle(&self) -> Result<PinnedHandle> {
        let raw = self.raw()?;
        let mut data: *mut c_void = ptr::null_mut();
        self.env
            .call(|api| unsafe { (api.unwrap)(self.env.raw(), raw, &mut data) })?;
        Ok(PinnedHandle::from_ptr(data))
    }

    /// Borrow the native instance wrapped in this object.
    pub fn with_wrapped<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let handle = self.wrapped_handle()?;
        // SAFETY: the wrap keeps the instance pinned while the object is reachable,
        // and the object is reachable through this live handle
        let pinned = unsafe { pinned::resolve(handle.as_ptr()) }
            .ok_or_else(|| BridgeError::invalid_operation("wrapped instance was already released"))?;
        let Pinned::Instance(instance) = pinned else {
            return Err(BridgeError::invalid_operation("object does not wrap a native instance"));
        };
        let instance = instance
            .downcast_ref::<T>()
            .ok_or_else(|| BridgeError::type_mismatch(std::any::type_name::<T>(), "other native type"))?;
        Ok(f(instance))
    }

    /// Borrow the data behind a value made with [`Env::create_external`].
    pub fn with_external<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let raw = self.raw()?;
        let mut data: *mut c_void = ptr::null_mut();
        self.env
            .call(|api| unsafe { (api.get_value_external)(self.env.raw(), raw, &mut data) })?;
        // SAFETY: the host keeps the external, and with it the pin, alive
        // while this handle is live
        let pinned = unsafe { pinned::resolve(data) }
            .ok_or_else(|| BridgeError::invalid_operation("external data was already released"))?;
        let Pinned::Instance(instance) = pinned else {
            return Err(BridgeError::invalid_operation("external does not carry managed data"));
        };
        let data = instance
            .downcast_ref::<T>()
            .ok_or_else(|| BridgeError::type_mismatch(std::any::type_name::<T>(), "other native type"))?;
        Ok(f(data))
    }

    /// Detach the wrapped instance and take ownership of it.
    ///
    /// Must not be called from inside [`Value::with_wrapped`] on the same object.
    pub fn remove_wrap<T: 'static>(&self) -> Result<Box<T>> {
        let raw = self.raw()?;
        let handle = self.wrapped_handle()?;
        let is_instance = matches!(
            unsafe { pinned::resolve(handle.as_ptr()) },
            Some(Pinned::Instance(instance)) if instance.is::<T>()
        );
        if !is_instance {
            return Err(BridgeError::type_mismatch(
                std::any::type_name::<T>(),
                "other native type",
            ));
        }
        let mut data: *mut c_void = ptr::null_mut();
        self.env
            .call(|api| unsafe { (api.remove_wrap)(self.env.raw(), raw, &mut data) })?;
        match pinned::take(handle) {
            Some(Pinned::Instance(instance)) => {
                let instance: Box<dyn Any> = instance;
                instance
                    .downcast::<T>()
                    .map_err(|_| BridgeError::invalid_operation("wrapped instance changed type"))
            }
            _ => Err(BridgeError::invalid_operation("wrapped instance was already released")),
        }
    }
}

fn raw_args(args: &[Value]) -> Result<Vec<napi_value>> {
    args.iter().map(Value::raw).collect()
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("scope", &self.scope)
            .field("raw", &self.raw)
            .field("live", &self.is_live())
            .finish()
    }
}
