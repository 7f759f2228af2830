//! Addon module initialization.

use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error};

use crate::env::Env;
use crate::error::{BridgeError, Result};
use crate::ffi::native::{panic_message, report_failure};
use crate::ffi::{napi_env, napi_value};
use crate::scope::ValueScope;
use crate::value::Value;

/// Run an addon's init function on the host's module-load call.
///
/// `init` receives a root scope and the exports object. Failures and panics
/// are thrown into the host instead of unwinding across the boundary.
/// Returns the exports handle the host should keep.
///
/// # Safety
/// `raw_env` and `raw_exports` must be the arguments the host passed to
/// the module's registration entry point.
pub unsafe fn init_module<F>(raw_env: napi_env, raw_exports: napi_value, init: F) -> napi_value
where
    F: FnOnce(&ValueScope, Value) -> Result<()>,
{
    if raw_env.is_null() {
        return raw_exports;
    }
    // SAFETY: forwarded from the host's registration call
    let env = unsafe { Env::from_raw(raw_env) };
    let root = ValueScope::root(env);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let exports = unsafe { Value::from_raw(env, raw_exports) }?;
        init(&root, exports)
    }));
    let result = match outcome {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::callback(panic_message(payload.as_ref()))),
    };
    match result {
        Ok(()) => debug!("module initialized"),
        Err(err) => report_failure(env, "module init", &err),
    }

    if let Err(err) = root.close() {
        error!(%err, "module init left the scope stack unbalanced");
        env.fatal_error("napi_bridge::init_module", &err.to_string());
    }
    raw_exports
}
