//! In-process reference host.
//!
//! A small object runtime that implements the native function table so addons
//! written against this crate can be loaded and exercised without an external
//! engine. It keeps its own handle scopes, references and a mark-sweep heap,
//! and reports failures through the same status codes a real host uses.
//!
//! ```
//! use napi_bridge::host::HostRuntime;
//! use napi_bridge::{PropertyDescriptor, define_properties};
//!
//! let runtime = HostRuntime::new().unwrap();
//! runtime
//!     .load(|_scope, exports| {
//!         let answer = exports.env().create_number(42.0)?;
//!         define_properties(&exports, vec![PropertyDescriptor::value("answer", answer)])
//!     })
//!     .unwrap();
//! assert_eq!(runtime.get_export("answer").unwrap(), serde_json::json!(42.0));
//! ```

mod abi;
mod heap;
mod object;
mod state;

pub use heap::GcStats;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::env::Env;
use crate::error::{BridgeError, Status};
use crate::ffi::{self, napi_env, napi_value};
use crate::module::init_module;
use crate::prelude::*;
use crate::scope::ValueScope;
use crate::value::Value;

use abi::HostEnv;
use object::{HostObject, HostValue, Key, ObjectKind, PropertySlot};
use state::{HostFailure, HostResult, HostState, PendingCall};

/// Nesting limit when converting between host values and JSON.
const MAX_JSON_DEPTH: usize = 16;

// ============================================================================
// Configuration
// ============================================================================

/// Host runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Net allocations between collections. Zero disables automatic collection.
    pub gc_threshold: usize,
    /// Maximum number of simultaneously open handle scopes.
    pub max_scope_depth: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 100,
            max_scope_depth: 1024,
        }
    }
}

impl HostConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, HostError> {
        serde_json::from_str(text).map_err(|err| HostError::Config(err.to_string()))
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum HostError {
    #[error("uncaught exception: {message}")]
    Exception {
        code: Option<String>,
        message: String,
    },

    #[error("module has no export named {0:?}")]
    MissingExport(String),

    #[error("export {0:?} is not callable")]
    NotCallable(String),

    #[error("host operation failed: {0}")]
    Status(Status),

    #[error("invalid host configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl From<HostFailure> for HostError {
    fn from(failure: HostFailure) -> Self {
        HostError::Status(Status::from_raw(failure.status))
    }
}

/// Install the host's function table as the process-wide native API.
///
/// Fails if a different table was installed first.
pub fn install() -> Result<(), BridgeError> {
    ffi::install(&abi::HOST_API)
}

// ============================================================================
// HostRuntime
// ============================================================================

/// An owned host environment.
///
/// Dropping the runtime runs every outstanding finalizer, which releases
/// any closures and instances still pinned for the environment.
pub struct HostRuntime {
    env: Box<HostEnv>,
}

impl HostRuntime {
    pub fn new() -> Result<Self, HostError> {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Result<Self, HostError> {
        install()?;
        debug!(?config, "host environment created");
        Ok(Self {
            env: HostEnv::new(config),
        })
    }

    pub fn env(&self) -> Env {
        // SAFETY: the environment lives as long as the runtime
        unsafe { Env::from_raw(self.raw_env()) }
    }

    pub fn raw_env(&self) -> napi_env {
        self.env.raw()
    }

    pub fn config(&self) -> Result<HostConfig, HostError> {
        Ok(self.state()?.config().clone())
    }

    fn state(&self) -> Result<std::cell::RefMut<'_, HostState>, HostError> {
        Ok(self.env.state()?)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Collect now, running finalizers of everything unreachable.
    pub fn collect(&self) {
        unsafe { abi::collect(&self.env, true) };
    }

    pub fn stats(&self) -> Result<GcStats, HostError> {
        Ok(self.state()?.stats())
    }

    pub fn set_gc_threshold(&self, threshold: usize) -> Result<(), HostError> {
        self.state()?.set_gc_threshold(threshold);
        Ok(())
    }

    /// Open native handle scopes, including frames of calls in progress.
    pub fn scope_depth(&self) -> Result<usize, HostError> {
        Ok(self.state()?.scope_depth())
    }

    pub fn handle_count(&self) -> Result<usize, HostError> {
        Ok(self.state()?.handle_count())
    }

    pub fn reference_count(&self) -> Result<usize, HostError> {
        Ok(self.state()?.reference_count())
    }

    pub fn is_exception_pending(&self) -> Result<bool, HostError> {
        Ok(self.state()?.is_exception_pending())
    }

    /// The pending exception as JSON, without clearing it.
    pub fn pending_exception(&self) -> Result<Option<serde_json::Value>, HostError> {
        let state = self.state()?;
        Ok(state
            .pending_exception()
            .map(|exception| to_json(&state, exception, 0)))
    }

    /// Clear the pending exception and describe it.
    pub fn take_exception(&self) -> Result<Option<HostError>, HostError> {
        let mut state = self.state()?;
        Ok(state
            .take_exception()
            .map(|exception| describe_exception(&state, &exception)))
    }

    // ========================================================================
    // Running managed code
    // ========================================================================

    /// Run `f` inside a host frame with a managed root scope.
    ///
    /// Handles created inside are released when `f` returns.
    pub fn with_scope<T>(
        &self,
        f: impl FnOnce(&ValueScope) -> crate::Result<T>,
    ) -> Result<T, HostError> {
        let frame = self.state()?.open_frame_scope()?;
        let root = ValueScope::root(self.env());
        let result = f(&root);
        let closed = root.close();
        self.state()?.close_frame_scope(frame)?;
        unsafe { abi::collect(&self.env, false) };
        closed?;
        Ok(result?)
    }

    /// Load an addon written against this crate.
    ///
    /// `init` runs as the module's registration callback with a fresh exports
    /// object. An exception left pending by `init` is returned as an error.
    pub fn load<F>(&self, init: F) -> Result<(), HostError>
    where
        F: FnOnce(&ValueScope, Value) -> crate::Result<()>,
    {
        // SAFETY: init_module is the crate's own registration wrapper
        unsafe {
            self.load_with(|env, exports| init_module(env, exports, init))
        }
    }

    /// Load an addon through its raw registration entry point.
    ///
    /// # Safety
    /// `register` must follow the native module registration contract for
    /// the environment it is given.
    pub unsafe fn load_module(
        &self,
        register: unsafe extern "C" fn(napi_env, napi_value) -> napi_value,
    ) -> Result<(), HostError> {
        unsafe { self.load_with(|env, exports| unsafe { register(env, exports) }) }
    }

    unsafe fn load_with(
        &self,
        register: impl FnOnce(napi_env, napi_value) -> napi_value,
    ) -> Result<(), HostError> {
        let (frame, exports) = {
            let mut state = self.state()?;
            let frame = state.open_frame_scope()?;
            let exports = state.alloc(HostObject::new(ObjectKind::Plain, None));
            (frame, state.push_handle(HostValue::Object(exports)))
        };
        let returned = register(self.raw_env(), exports);
        {
            let mut state = self.state()?;
            let exports = if returned.is_null() {
                state.value(exports)
            } else {
                state.value(returned)
            }?;
            state.set_exports(exports);
            state.close_frame_scope(frame)?;
        }
        unsafe { abi::collect(&self.env, false) };
        match self.take_exception()? {
            Some(err) => Err(err),
            None => {
                debug!("module loaded");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Exports
    // ========================================================================

    /// Read an export as JSON.
    pub fn get_export(&self, name: &str) -> Result<serde_json::Value, HostError> {
        let state = self.state()?;
        let value = export(&state, name)?;
        Ok(to_json(&state, &value, 0))
    }

    /// Call an exported function with JSON arguments.
    ///
    /// `this` is the exports object. An exception thrown by the call is
    /// cleared and returned as [`HostError::Exception`].
    pub fn call_export(
        &self,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, HostError> {
        let call = {
            let mut state = self.state()?;
            let callee = export(&state, name)?;
            let callback = state
                .function_callback(&callee)
                .map_err(|_| HostError::NotCallable(name.to_string()))?;
            let this = state.exports().cloned().unwrap_or(HostValue::Undefined);
            let args = args
                .iter()
                .map(|arg| from_json(&mut state, arg, 0))
                .collect::<HostResult<Vec<_>>>()?;
            PendingCall {
                callback,
                callee,
                this,
                args,
                new_target: None,
            }
        };
        let outcome = unsafe { abi::invoke(&self.env, call) };
        let result = match outcome {
            Ok(value) => Ok(to_json(&*self.state()?, &value, 0)),
            Err(failure) if failure.status == ffi::napi_pending_exception => {
                match self.take_exception()? {
                    Some(err) => Err(err),
                    None => Err(failure.into()),
                }
            }
            Err(failure) => Err(failure.into()),
        };
        unsafe { abi::collect(&self.env, false) };
        result
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        let finalizers = match self.env.state() {
            Ok(mut state) => state.teardown(),
            Err(_) => {
                warn!("host environment dropped while in use");
                return;
            }
        };
        debug!(finalizers = finalizers.len(), "host environment torn down");
        unsafe { abi::run_finalizers(self.raw_env(), finalizers) };
    }
}

impl core::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("env", &self.raw_env())
            .finish()
    }
}

// ============================================================================
// JSON conversion
// ============================================================================

fn export(state: &HostState, name: &str) -> Result<HostValue, HostError> {
    let missing = || HostError::MissingExport(name.to_string());
    let exports = state.exports().ok_or_else(missing)?;
    let id = state.object_id(exports)?;
    state.get_data(id, &Key::from(name))?.ok_or_else(missing)
}

fn describe_exception(state: &HostState, exception: &HostValue) -> HostError {
    let text = |key: &str| {
        let id = exception.as_object()?;
        match state.get_data(id, &Key::from(key)).ok()?? {
            HostValue::String(s) => Some(s.to_string()),
            _ => None,
        }
    };
    let message = match exception {
        HostValue::String(s) => Some(s.to_string()),
        _ => text("message"),
    };
    HostError::Exception {
        code: text("code"),
        message: message.unwrap_or_else(|| to_json(state, exception, 0).to_string()),
    }
}

/// Convert a host value to JSON.
///
/// Plain objects contribute their enumerable string-keyed data properties.
/// Error objects contribute every string-keyed data property so `message`
/// survives. Functions and symbols become descriptive strings.
fn to_json(state: &HostState, value: &HostValue, depth: usize) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        HostValue::Undefined | HostValue::Null => Json::Null,
        HostValue::Bool(b) => Json::Bool(*b),
        HostValue::Number(n) => serde_json::Number::from_f64(*n).map_or(Json::Null, Json::Number),
        HostValue::String(s) => Json::String(s.to_string()),
        HostValue::Symbol(id) => Json::String(format!(
            "Symbol({})",
            state.symbol_description(*id).unwrap_or("")
        )),
        HostValue::Object(id) => {
            let Ok(object) = state.object(*id) else {
                return Json::Null;
            };
            let everything = match &object.kind {
                ObjectKind::Function { name, .. } => {
                    return Json::String(format!("[Function: {name}]"));
                }
                ObjectKind::External { .. } => {
                    return Json::String("[External]".to_string());
                }
                ObjectKind::Error => true,
                ObjectKind::Plain => false,
            };
            if depth >= MAX_JSON_DEPTH {
                return Json::String("[Object]".to_string());
            }
            let map = object
                .properties
                .iter()
                .filter(|(_, property)| everything || property.is_enumerable())
                .filter_map(|(key, property)| match (key, &property.slot) {
                    (Key::String(name), PropertySlot::Data(value)) => {
                        Some((name.to_string(), to_json(state, value, depth + 1)))
                    }
                    _ => None,
                })
                .collect();
            Json::Object(map)
        }
    }
}

/// Convert JSON to a host value. Arrays become objects with index keys.
fn from_json(state: &mut HostState, json: &serde_json::Value, depth: usize) -> HostResult<HostValue> {
    use serde_json::Value as Json;

    Ok(match json {
        Json::Null => HostValue::Null,
        Json::Bool(b) => HostValue::Bool(*b),
        Json::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Json::String(s) => HostValue::String(Rc::from(s.as_str())),
        Json::Array(_) | Json::Object(_) if depth >= MAX_JSON_DEPTH => {
            return Err(HostFailure::invalid_arg("JSON argument nested too deeply"));
        }
        Json::Array(items) => {
            let mut array = HostObject::new(ObjectKind::Plain, None);
            for (index, item) in items.iter().enumerate() {
                let value = from_json(state, item, depth + 1)?;
                array.set_data(Key::from(index.to_string().as_str()), value, ffi::napi_default_jsproperty);
            }
            array.set_data(Key::from("length"), HostValue::Number(items.len() as f64), ffi::napi_writable);
            HostValue::Object(state.alloc(array))
        }
        Json::Object(fields) => {
            let mut object = HostObject::new(ObjectKind::Plain, None);
            for (name, field) in fields {
                let value = from_json(state, field, depth + 1)?;
                object.set_data(Key::from(name.as_str()), value, ffi::napi_default_jsproperty);
            }
            HostValue::Object(state.alloc(object))
        }
    })
}
