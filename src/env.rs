//! The environment capability token.
//!
//! An [`Env`] names one host runtime instance. It is threaded through every
//! native call and never mutated by the bridge. Value-producing helpers tag
//! their result with the innermost open scope on the current thread, since
//! that is the scope the host allocates the handle in.

use tracing::debug;

use crate::error::{BridgeError, Result, Status};
use crate::ffi::pinned::{self, Pinned};
use crate::ffi::{self, NativeApi, c_str_to_str, napi_env, napi_status, napi_value};
use crate::prelude::*;
use crate::scope::{self, ValueScope};
use crate::value::Value;

/// Identifies one host runtime instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Env {
    raw: napi_env,
}

impl Env {
    /// Wrap a raw environment handed over by the host.
    ///
    /// # Safety
    /// `raw` must be an environment of the host whose table is installed,
    /// and must stay valid for as long as the returned `Env` is used.
    pub unsafe fn from_raw(raw: napi_env) -> Self {
        Self { raw }
    }

    pub fn raw(self) -> napi_env {
        self.raw
    }

    /// Convert a raw status into a typed result.
    ///
    /// Failures carry the host's last-error message when one is available.
    pub fn check_status(self, status: napi_status) -> Result<()> {
        if status == ffi::napi_ok {
            return Ok(());
        }
        let status = Status::from_raw(status);
        let message = self
            .last_error_message()
            .unwrap_or_else(|| status.to_string());
        Err(BridgeError::status(status, message))
    }

    fn last_error_message(self) -> Option<String> {
        let api = ffi::api().ok()?;
        let mut info: *const ffi::napi_extended_error_info = ptr::null();
        // SAFETY: out-parameter points to a live local
        let status = unsafe { (api.get_last_error_info)(self.raw, &mut info) };
        if status != ffi::napi_ok || info.is_null() {
            return None;
        }
        // SAFETY: the host keeps the info block alive until its next call
        let message = unsafe { (*info).error_message };
        unsafe { c_str_to_str(message) }.map(str::to_string)
    }

    /// Run a native call that produces a handle and tag it with the current scope.
    pub(crate) fn create_value(
        self,
        call: impl FnOnce(&'static NativeApi, *mut napi_value) -> napi_status,
    ) -> Result<Value> {
        let scope = scope::current_for(self)?;
        let api = ffi::api()?;
        let mut raw: napi_value = ptr::null_mut();
        self.check_status(call(api, &mut raw))?;
        Ok(Value::from_parts(self, scope, raw))
    }

    /// Run a native call that reports only a status.
    pub(crate) fn call(
        self,
        call: impl FnOnce(&'static NativeApi) -> napi_status,
    ) -> Result<()> {
        let api = ffi::api()?;
        self.check_status(call(api))
    }

    // ========================================================================
    // Scoped helpers
    // ========================================================================

    /// Run `f` inside a fresh handle scope that is closed on every exit path.
    pub fn with_scope<T>(self, f: impl FnOnce(&ValueScope) -> Result<T>) -> Result<T> {
        let scope = ValueScope::open(self)?;
        let result = f(&scope)?;
        scope.close()?;
        Ok(result)
    }

    /// Run `f` inside an escapable scope and promote its single result to
    /// the enclosing scope.
    pub fn with_escapable_scope(
        self,
        f: impl FnOnce(&ValueScope) -> Result<Value>,
    ) -> Result<Value> {
        let scope = ValueScope::open_escapable(self)?;
        let value = f(&scope)?;
        let escaped = scope.escape(value)?;
        scope.close()?;
        Ok(escaped)
    }

    // ========================================================================
    // Primitive values
    // ========================================================================

    pub fn get_undefined(self) -> Result<Value> {
        // SAFETY: out-parameter supplied by create_value
        self.create_value(|api, out| unsafe { (api.get_undefined)(self.raw, out) })
    }

    pub fn get_null(self) -> Result<Value> {
        self.create_value(|api, out| unsafe { (api.get_null)(self.raw, out) })
    }

    pub fn get_global(self) -> Result<Value> {
        self.create_value(|api, out| unsafe { (api.get_global)(self.raw, out) })
    }

    pub fn get_boolean(self, value: bool) -> Result<Value> {
        self.create_value(|api, out| unsafe { (api.get_boolean)(self.raw, value, out) })
    }

    pub fn create_number(self, value: f64) -> Result<Value> {
        self.create_value(|api, out| unsafe { (api.create_double)(self.raw, value, out) })
    }

    pub fn create_string(self, value: &str) -> Result<Value> {
        self.create_value(|api, out| unsafe {
            (api.create_string_utf8)(self.raw, value.as_ptr().cast(), value.len(), out)
        })
    }

    pub fn create_object(self) -> Result<Value> {
        self.create_value(|api, out| unsafe { (api.create_object)(self.raw, out) })
    }

    pub fn create_symbol(self, description: &str) -> Result<Value> {
        let description = self.create_string(description)?.raw()?;
        self.create_value(|api, out| unsafe { (api.create_symbol)(self.raw, description, out) })
    }

    /// Create an `Error` object with a `code` and `message`.
    pub fn create_error(self, code: &str, message: &str) -> Result<Value> {
        let code = self.create_string(code)?.raw()?;
        let message = self.create_string(message)?.raw()?;
        self.create_value(|api, out| unsafe { (api.create_error)(self.raw, code, message, out) })
    }

    /// Hand `data` to the host behind an opaque `external` value.
    ///
    /// The data stays pinned until the host finalizes the value. Read it
    /// back with [`Value::with_external`].
    pub fn create_external<T: 'static>(self, data: T) -> Result<Value> {
        let handle = pinned::pin(self, Pinned::Instance(Box::new(data)));
        let external = self.create_value(|api, out| unsafe {
            (api.create_external)(
                self.raw,
                handle.as_ptr(),
                Some(ffi::release_pinned),
                ptr::null_mut(),
                out,
            )
        });
        match external {
            Ok(value) => {
                debug!(external = ?handle, "external created");
                Ok(value)
            }
            Err(err) => {
                pinned::release(handle);
                Err(err)
            }
        }
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    pub fn throw(self, value: Value) -> Result<()> {
        let raw = value.raw()?;
        self.call(|api| unsafe { (api.throw)(self.raw, raw) })
    }

    /// Throw a new `Error` with the given code and message.
    pub fn throw_error(self, code: &str, message: &str) -> Result<()> {
        let code = to_c_string(code)?;
        let message = to_c_string(message)?;
        self.call(|api| unsafe { (api.throw_error)(self.raw, code.as_ptr(), message.as_ptr()) })
    }

    pub fn is_exception_pending(self) -> Result<bool> {
        let mut pending = false;
        self.call(|api| unsafe { (api.is_exception_pending)(self.raw, &mut pending) })?;
        Ok(pending)
    }

    /// Take the pending exception, if there is one.
    pub fn take_exception(self) -> Result<Option<Value>> {
        if !self.is_exception_pending()? {
            return Ok(None);
        }
        self.create_value(|api, out| unsafe { (api.get_and_clear_last_exception)(self.raw, out) })
            .map(Some)
    }

    /// Report an unrecoverable failure to the host and abort the process.
    pub fn fatal_error(self, location: &str, message: &str) -> ! {
        tracing::error!(location, message, "fatal bridge error");
        if let Ok(api) = ffi::api() {
            // SAFETY: both buffers carry explicit lengths
            unsafe {
                (api.fatal_error)(
                    location.as_ptr().cast(),
                    location.len(),
                    message.as_ptr().cast(),
                    message.len(),
                )
            };
        }
        std::process::abort()
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Env").field(&self.raw).finish()
    }
}

/// Convert a name to a C string, rejecting interior NULs the way the host would.
pub(crate) fn to_c_string(value: &str) -> Result<std::ffi::CString> {
    std::ffi::CString::new(value)
        .map_err(|_| BridgeError::status(Status::InvalidArg, "string contains a NUL byte"))
}
