//! `extern "C"` entry points of the reference host.
//!
//! Every entry point validates the environment pointer against the live
//! environment set, borrows the state for the duration of the operation and
//! records the outcome as the last error. Operations that call into native
//! code (function calls, accessors, finalizers) release the borrow first so
//! the callee can re-enter.

use core::ffi::{CStr, c_char, c_void};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::error;

use crate::ffi::{
    self, NativeApi, napi_callback, napi_callback_info, napi_env, napi_escapable_handle_scope,
    napi_extended_error_info, napi_finalize, napi_handle_scope, napi_property_descriptor, napi_ref,
    napi_status, napi_value, napi_valuetype,
};
use crate::prelude::*;

use super::HostConfig;
use super::heap::ObjectId;
use super::object::{
    Finalizer, HostObject, HostValue, Key, NativeCallback, ObjectKind, Property, PropertySlot, Wrap,
};
use super::state::{HostFailure, HostResult, HostState, Lookup, PendingCall};

/// Length marker meaning "NUL-terminated".
const AUTO_LENGTH: usize = usize::MAX;

// ============================================================================
// Environments
// ============================================================================

/// The object behind a host `napi_env`.
pub(crate) struct HostEnv {
    pub(crate) state: RefCell<HostState>,
}

impl HostEnv {
    pub(crate) fn new(config: HostConfig) -> Box<HostEnv> {
        let env = Box::new(HostEnv {
            state: RefCell::new(HostState::new(config)),
        });
        live_envs().lock().insert(env.raw() as usize);
        env
    }

    pub(crate) fn raw(&self) -> napi_env {
        self as *const HostEnv as napi_env
    }

    pub(crate) fn state(&self) -> HostResult<std::cell::RefMut<'_, HostState>> {
        self.state
            .try_borrow_mut()
            .map_err(|_| HostFailure::generic("environment is busy"))
    }
}

impl Drop for HostEnv {
    fn drop(&mut self) {
        live_envs().lock().remove(&(self.raw() as usize));
    }
}

fn live_envs() -> &'static Mutex<FxHashSet<usize>> {
    static LIVE: OnceLock<Mutex<FxHashSet<usize>>> = OnceLock::new();
    LIVE.get_or_init(Default::default)
}

/// Resolve a raw environment, refusing pointers that are not live hosts.
unsafe fn host<'a>(env: napi_env) -> Option<&'a HostEnv> {
    if env.is_null() || !live_envs().lock().contains(&(env as usize)) {
        return None;
    }
    // SAFETY: live addresses belong to boxed HostEnvs that unregister on drop
    Some(unsafe { &*(env as *const HostEnv) })
}

/// Run `op` against the state and record its outcome.
fn with_state(env: napi_env, op: impl FnOnce(&mut HostState) -> HostResult<()>) -> napi_status {
    let Some(host) = (unsafe { host(env) }) else {
        return ffi::napi_invalid_arg;
    };
    let Ok(mut state) = host.state() else {
        return ffi::napi_generic_failure;
    };
    let result = op(&mut state);
    state.record(result)
}

/// Record an outcome computed outside a state borrow.
fn finish(host: &HostEnv, result: HostResult<()>) -> napi_status {
    match host.state() {
        Ok(mut state) => state.record(result),
        Err(_) => result.err().map_or(ffi::napi_ok, |failure| failure.status),
    }
}

unsafe fn write<T>(out: *mut T, value: T) -> HostResult<()> {
    if out.is_null() {
        return Err(HostFailure::invalid_arg("null out-parameter"));
    }
    // SAFETY: non-null out-parameters point to caller-owned storage
    unsafe { out.write(value) };
    Ok(())
}

unsafe fn read_str(text: *const c_char, len: usize) -> HostResult<Rc<str>> {
    if text.is_null() {
        return if len == 0 || len == AUTO_LENGTH {
            Ok(Rc::from(""))
        } else {
            Err(HostFailure::invalid_arg("null string with non-zero length"))
        };
    }
    let bytes = if len == AUTO_LENGTH {
        unsafe { CStr::from_ptr(text) }.to_bytes()
    } else {
        unsafe { core::slice::from_raw_parts(text.cast::<u8>(), len) }
    };
    Ok(Rc::from(String::from_utf8_lossy(bytes).as_ref()))
}

unsafe fn read_args(state: &HostState, argc: usize, argv: *const napi_value) -> HostResult<Vec<HostValue>> {
    if argc == 0 {
        return Ok(Vec::new());
    }
    if argv.is_null() {
        return Err(HostFailure::invalid_arg("null argument vector"));
    }
    let raw = unsafe { core::slice::from_raw_parts(argv, argc) };
    raw.iter().map(|&value| state.value(value)).collect()
}

/// Run finalizers with no state borrow held.
pub(crate) unsafe fn run_finalizers(env: napi_env, finalizers: Vec<Finalizer>) {
    for finalizer in finalizers {
        unsafe { finalizer.run(env) };
    }
}

/// Make a native call on behalf of the host.
///
/// The state borrow is released while the callback runs. The result is not
/// rooted until the caller stores it, so no collection happens here.
pub(crate) unsafe fn invoke(host: &HostEnv, call: PendingCall) -> HostResult<HostValue> {
    let active = host.state()?.begin_call(call)?;
    let raw = unsafe { (active.callback.callback)(host.raw(), active.frame as napi_callback_info) };
    host.state()?.end_call(active, raw)
}

/// Collect and finalize outside the borrow.
pub(crate) unsafe fn collect(host: &HostEnv, force: bool) {
    let finalizers = match host.state() {
        Ok(mut state) if force => state.collect(),
        Ok(mut state) => state.maybe_collect(),
        Err(_) => return,
    };
    unsafe { run_finalizers(host.raw(), finalizers) };
}

// ============================================================================
// Errors
// ============================================================================

unsafe extern "C" fn get_last_error_info(
    env: napi_env,
    result: *mut *const napi_extended_error_info,
) -> napi_status {
    let Some(host) = (unsafe { host(env) }) else {
        return ffi::napi_invalid_arg;
    };
    let Ok(state) = host.state() else {
        return ffi::napi_generic_failure;
    };
    // Reading the last error must not overwrite it
    match unsafe { write(result, state.last_error_info()) } {
        Ok(()) => ffi::napi_ok,
        Err(failure) => failure.status,
    }
}

unsafe extern "C" fn fatal_error(
    location: *const c_char,
    location_len: usize,
    message: *const c_char,
    message_len: usize,
) {
    let location = unsafe { read_str(location, location_len) }.unwrap_or_else(|_| Rc::from(""));
    let message = unsafe { read_str(message, message_len) }.unwrap_or_else(|_| Rc::from(""));
    error!(location = &*location, message = &*message, "FATAL ERROR");
    std::process::abort();
}

// ============================================================================
// Scopes
// ============================================================================

unsafe extern "C" fn open_handle_scope(env: napi_env, result: *mut napi_handle_scope) -> napi_status {
    with_state(env, |state| {
        let id = state.open_scope()?;
        unsafe { write(result, id as napi_handle_scope) }
    })
}

unsafe extern "C" fn close_handle_scope(env: napi_env, scope: napi_handle_scope) -> napi_status {
    close_scope_with(env, |state| state.close_scope(scope as usize))
}

unsafe extern "C" fn open_escapable_handle_scope(
    env: napi_env,
    result: *mut napi_escapable_handle_scope,
) -> napi_status {
    with_state(env, |state| {
        let id = state.open_escapable_scope()?;
        unsafe { write(result, id as napi_escapable_handle_scope) }
    })
}

unsafe extern "C" fn close_escapable_handle_scope(
    env: napi_env,
    scope: napi_escapable_handle_scope,
) -> napi_status {
    close_scope_with(env, |state| state.close_escapable_scope(scope as usize))
}

/// Close a scope, then collect if the allocation threshold was reached.
fn close_scope_with(env: napi_env, close: impl FnOnce(&mut HostState) -> HostResult<()>) -> napi_status {
    let Some(host) = (unsafe { host(env) }) else {
        return ffi::napi_invalid_arg;
    };
    let (status, finalizers) = match host.state() {
        Ok(mut state) => {
            let result = close(&mut state);
            let finalizers = if result.is_ok() { state.maybe_collect() } else { Vec::new() };
            (state.record(result), finalizers)
        }
        Err(failure) => (failure.status, Vec::new()),
    };
    unsafe { run_finalizers(env, finalizers) };
    status
}

unsafe extern "C" fn escape_handle(
    env: napi_env,
    scope: napi_escapable_handle_scope,
    escapee: napi_value,
    result: *mut napi_value,
) -> napi_status {
    with_state(env, |state| {
        let escaped = state.escape(scope as usize, escapee)?;
        unsafe { write(result, escaped) }
    })
}

// ============================================================================
// References
// ============================================================================

unsafe extern "C" fn create_reference(
    env: napi_env,
    value: napi_value,
    initial_refcount: u32,
    result: *mut napi_ref,
) -> napi_status {
    with_state(env, |state| {
        let value = state.value(value)?;
        let id = state.create_reference(&value, initial_refcount)?;
        unsafe { write(result, id as napi_ref) }
    })
}

unsafe extern "C" fn delete_reference(env: napi_env, reference: napi_ref) -> napi_status {
    with_state(env, |state| state.delete_reference(reference as usize))
}

unsafe extern "C" fn reference_ref(env: napi_env, reference: napi_ref, result: *mut u32) -> napi_status {
    with_state(env, |state| {
        let count = state.reference_ref(reference as usize)?;
        if result.is_null() {
            return Ok(());
        }
        unsafe { write(result, count) }
    })
}

unsafe extern "C" fn reference_unref(env: napi_env, reference: napi_ref, result: *mut u32) -> napi_status {
    with_state(env, |state| {
        let count = state.reference_unref(reference as usize)?;
        if result.is_null() {
            return Ok(());
        }
        unsafe { write(result, count) }
    })
}

unsafe extern "C" fn get_reference_value(
    env: napi_env,
    reference: napi_ref,
    result: *mut napi_value,
) -> napi_status {
    with_state(env, |state| {
        let raw = match state.reference_value(reference as usize)? {
            Some(value) => state.push_handle(value),
            None => ptr::null_mut(),
        };
        unsafe { write(result, raw) }
    })
}

// ============================================================================
// Callbacks
// ============================================================================

unsafe extern "C" fn get_cb_info(
    env: napi_env,
    info: napi_callback_info,
    argc: *mut usize,
    argv: *mut napi_value,
    this_arg: *mut napi_value,
    data: *mut *mut c_void,
) -> napi_status {
    with_state(env, |state| {
        let frame = state.frame(info)?;
        let args = frame.args.clone();
        let this = frame.this.clone();
        let frame_data = frame.data;

        if !argc.is_null() {
            // SAFETY: argc is an in/out parameter owned by the caller
            let capacity = unsafe { *argc };
            if !argv.is_null() {
                for index in 0..capacity {
                    let value = args.get(index).cloned().unwrap_or(HostValue::Undefined);
                    let raw = state.push_handle(value);
                    unsafe { argv.add(index).write(raw) };
                }
            }
            unsafe { write(argc, args.len())? };
        }
        if !this_arg.is_null() {
            let raw = state.push_handle(this);
            unsafe { write(this_arg, raw)? };
        }
        if !data.is_null() {
            unsafe { write(data, frame_data)? };
        }
        Ok(())
    })
}

unsafe extern "C" fn get_new_target(
    env: napi_env,
    info: napi_callback_info,
    result: *mut napi_value,
) -> napi_status {
    with_state(env, |state| {
        let target = state.frame(info)?.new_target.clone();
        let raw = match target {
            Some(target) => state.push_handle(target),
            None => ptr::null_mut(),
        };
        unsafe { write(result, raw) }
    })
}

fn native_callback(callback: napi_callback, data: *mut c_void) -> HostResult<NativeCallback> {
    callback
        .map(|callback| NativeCallback { callback, data })
        .ok_or(HostFailure::invalid_arg("missing callback"))
}

unsafe extern "C" fn create_function(
    env: napi_env,
    name: *const c_char,
    length: usize,
    cb: napi_callback,
    data: *mut c_void,
    result: *mut napi_value,
) -> napi_status {
    with_state(env, |state| {
        let name = unsafe { read_str(name, length) }?;
        let callback = native_callback(cb, data)?;
        let function = state.create_function(name, callback);
        let raw = state.push_handle(HostValue::Object(function));
        unsafe { write(result, raw) }
    })
}

/// Apply one descriptor to `target`.
unsafe fn define_descriptor(
    state: &mut HostState,
    target: ObjectId,
    descriptor: &napi_property_descriptor,
) -> HostResult<()> {
    let key = if !descriptor.utf8name.is_null() {
        Key::String(unsafe { read_str(descriptor.utf8name, AUTO_LENGTH) }?)
    } else if !descriptor.name.is_null() {
        let name = state.value(descriptor.name)?;
        state.key(&name)?
    } else {
        return Err(HostFailure::new(ffi::napi_name_expected, "descriptor has no name"));
    };
    // Only the JS-visible attribute bits are stored
    let attributes = descriptor.attributes
        & (ffi::napi_writable | ffi::napi_enumerable | ffi::napi_configurable);

    let property = if let Some(method) = descriptor.method {
        let name = match &key {
            Key::String(name) => name.clone(),
            Key::Symbol(_) => Rc::from(""),
        };
        let function = state.create_function(
            name,
            NativeCallback {
                callback: method,
                data: descriptor.data,
            },
        );
        Property::data(HostValue::Object(function), attributes)
    } else if descriptor.getter.is_some() || descriptor.setter.is_some() {
        let accessor = |callback: napi_callback| {
            callback.map(|callback| NativeCallback {
                callback,
                data: descriptor.data,
            })
        };
        Property {
            slot: PropertySlot::Accessor {
                getter: accessor(descriptor.getter),
                setter: accessor(descriptor.setter),
            },
            attributes,
        }
    } else {
        let value = if descriptor.value.is_null() {
            HostValue::Undefined
        } else {
            state.value(descriptor.value)?
        };
        Property::data(value, attributes)
    };
    state.define(target, key, property)
}

unsafe fn descriptors<'a>(
    count: usize,
    properties: *const napi_property_descriptor,
) -> HostResult<&'a [napi_property_descriptor]> {
    if count == 0 {
        return Ok(&[]);
    }
    if properties.is_null() {
        return Err(HostFailure::invalid_arg("null descriptor array"));
    }
    Ok(unsafe { core::slice::from_raw_parts(properties, count) })
}

unsafe extern "C" fn define_properties(
    env: napi_env,
    object: napi_value,
    property_count: usize,
    properties: *const napi_property_descriptor,
) -> napi_status {
    with_state(env, |state| {
        let target = state.value(object)?;
        let target = state.object_id(&target)?;
        for descriptor in unsafe { descriptors(property_count, properties) }? {
            unsafe { define_descriptor(state, target, descriptor) }?;
        }
        Ok(())
    })
}

unsafe extern "C" fn define_class(
    env: napi_env,
    name: *const c_char,
    length: usize,
    constructor: napi_callback,
    data: *mut c_void,
    property_count: usize,
    properties: *const napi_property_descriptor,
    result: *mut napi_value,
) -> napi_status {
    with_state(env, |state| {
        let name = unsafe { read_str(name, length) }?;
        let callback = native_callback(constructor, data)?;
        let descriptors = unsafe { descriptors(property_count, properties) }?;

        let class = state.create_function(name, callback);
        let prototype = state.alloc(HostObject::new(ObjectKind::Plain, None));
        state.define(
            class,
            Key::from("prototype"),
            Property::data(HostValue::Object(prototype), ffi::napi_writable),
        )?;
        state.define(
            prototype,
            Key::from("constructor"),
            Property::data(
                HostValue::Object(class),
                ffi::napi_writable | ffi::napi_configurable,
            ),
        )?;
        for descriptor in descriptors {
            let target = if descriptor.attributes & ffi::napi_static != 0 {
                class
            } else {
                prototype
            };
            unsafe { define_descriptor(state, target, descriptor) }?;
        }
        let raw = state.push_handle(HostValue::Object(class));
        unsafe { write(result, raw) }
    })
}

// ============================================================================
// Lifetime
// ============================================================================

fn finalizer(callback: napi_finalize, data: *mut c_void, hint: *mut c_void) -> HostResult<Finalizer> {
    callback
        .map(|callback| Finalizer {
            callback,
            data,
            hint,
        })
        .ok_or(HostFailure::invalid_arg("missing finalize callback"))
}

unsafe extern "C" fn add_finalizer(
    env: napi_env,
    object: napi_value,
    data: *mut c_void,
    finalize_cb: napi_finalize,
    hint: *mut c_void,
    result: *mut napi_ref,
) -> napi_status {
    with_state(env, |state| {
        let value = state.value(object)?;
        let id = state.object_id(&value)?;
        let finalizer = finalizer(finalize_cb, data, hint)?;
        state.object_mut(id)?.finalizers.push(finalizer);
        if result.is_null() {
            return Ok(());
        }
        let reference = state.create_reference(&value, 0)?;
        unsafe { write(result, reference as napi_ref) }
    })
}

unsafe extern "C" fn wrap(
    env: napi_env,
    object: napi_value,
    native_object: *mut c_void,
    finalize_cb: napi_finalize,
    hint: *mut c_void,
    result: *mut napi_ref,
) -> napi_status {
    with_state(env, |state| {
        let value = state.value(object)?;
        let id = state.object_id(&value)?;
        let finalizer = finalize_cb.map(|callback| Finalizer {
            callback,
            data: native_object,
            hint,
        });
        let target = state.object_mut(id)?;
        if target.wrap.is_some() {
            return Err(HostFailure::invalid_arg("object is already wrapped"));
        }
        target.wrap = Some(Wrap {
            data: native_object,
            finalizer,
        });
        if result.is_null() {
            return Ok(());
        }
        let reference = state.create_reference(&value, 0)?;
        unsafe { write(result, reference as napi_ref) }
    })
}

unsafe extern "C" fn unwrap(env: napi_env, object: napi_value, result: *mut *mut c_void) -> napi_status {
    with_state(env, |state| {
        let value = state.value(object)?;
        let id = state.object_id(&value)?;
        let wrap = state
            .object(id)?
            .wrap
            .ok_or(HostFailure::invalid_arg("object is not wrapped"))?;
        unsafe { write(result, wrap.data) }
    })
}

unsafe extern "C" fn remove_wrap(env: napi_env, object: napi_value, result: *mut *mut c_void) -> napi_status {
    with_state(env, |state| {
        let value = state.value(object)?;
        let id = state.object_id(&value)?;
        // The wrap finalizer does not run for a removed wrap
        let wrap = state
            .object_mut(id)?
            .wrap
            .take()
            .ok_or(HostFailure::invalid_arg("object is not wrapped"))?;
        if result.is_null() {
            return Ok(());
        }
        unsafe { write(result, wrap.data) }
    })
}

// ============================================================================
// Exceptions
// ============================================================================

unsafe extern "C" fn throw(env: napi_env, error: napi_value) -> napi_status {
    with_state(env, |state| {
        let value = state.value(error)?;
        state.throw(value)
    })
}

unsafe extern "C" fn throw_error(env: napi_env, code: *const c_char, msg: *const c_char) -> napi_status {
    with_state(env, |state| {
        if msg.is_null() {
            return Err(HostFailure::invalid_arg("null error message"));
        }
        state.check_no_exception()?;
        let message = unsafe { read_str(msg, AUTO_LENGTH) }?;
        let code = if code.is_null() {
            None
        } else {
            Some(unsafe { read_str(code, AUTO_LENGTH) }?)
        };
        let error = state.create_error(code, message);
        state.throw(HostValue::Object(error))
    })
}

unsafe extern "C" fn is_exception_pending(env: napi_env, result: *mut bool) -> napi_status {
    with_state(env, |state| {
        let pending = state.is_exception_pending();
        unsafe { write(result, pending) }
    })
}

unsafe extern "C" fn get_and_clear_last_exception(env: napi_env, result: *mut napi_value) -> napi_status {
    with_state(env, |state| {
        let exception = state.take_exception().unwrap_or(HostValue::Undefined);
        let raw = state.push_handle(exception);
        unsafe { write(result, raw) }
    })
}

// ============================================================================
// Values
// ============================================================================

fn push_value(env: napi_env, result: *mut napi_value, make: impl FnOnce(&mut HostState) -> HostResult<HostValue>) -> napi_status {
    with_state(env, |state| {
        let value = make(state)?;
        let raw = state.push_handle(value);
        unsafe { write(result, raw) }
    })
}

unsafe extern "C" fn get_undefined(env: napi_env, result: *mut napi_value) -> napi_status {
    push_value(env, result, |_| Ok(HostValue::Undefined))
}

unsafe extern "C" fn get_null(env: napi_env, result: *mut napi_value) -> napi_status {
    push_value(env, result, |_| Ok(HostValue::Null))
}

unsafe extern "C" fn get_global(env: napi_env, result: *mut napi_value) -> napi_status {
    push_value(env, result, |state| Ok(HostValue::Object(state.global())))
}

unsafe extern "C" fn get_boolean(env: napi_env, value: bool, result: *mut napi_value) -> napi_status {
    push_value(env, result, |_| Ok(HostValue::Bool(value)))
}

unsafe extern "C" fn create_double(env: napi_env, value: f64, result: *mut napi_value) -> napi_status {
    push_value(env, result, |_| Ok(HostValue::Number(value)))
}

unsafe extern "C" fn create_string_utf8(
    env: napi_env,
    text: *const c_char,
    length: usize,
    result: *mut napi_value,
) -> napi_status {
    push_value(env, result, |_| {
        Ok(HostValue::String(unsafe { read_str(text, length) }?))
    })
}

unsafe extern "C" fn create_object(env: napi_env, result: *mut napi_value) -> napi_status {
    push_value(env, result, |state| {
        Ok(HostValue::Object(state.alloc(HostObject::new(ObjectKind::Plain, None))))
    })
}

unsafe extern "C" fn create_symbol(env: napi_env, description: napi_value, result: *mut napi_value) -> napi_status {
    push_value(env, result, |state| {
        let description = if description.is_null() {
            Rc::from("")
        } else {
            let value = state.value(description)?;
            state.string(&value)?
        };
        Ok(state.create_symbol(description))
    })
}

unsafe extern "C" fn create_error(
    env: napi_env,
    code: napi_value,
    msg: napi_value,
    result: *mut napi_value,
) -> napi_status {
    push_value(env, result, |state| {
        let message = state.value(msg)?;
        let message = state.string(&message)?;
        let code = if code.is_null() {
            None
        } else {
            let code = state.value(code)?;
            Some(state.string(&code)?)
        };
        Ok(HostValue::Object(state.create_error(code, message)))
    })
}

unsafe extern "C" fn create_external(
    env: napi_env,
    data: *mut c_void,
    finalize_cb: napi_finalize,
    hint: *mut c_void,
    result: *mut napi_value,
) -> napi_status {
    push_value(env, result, |state| {
        let finalizer = finalize_cb.map(|callback| Finalizer {
            callback,
            data,
            hint,
        });
        Ok(HostValue::Object(state.create_external(data, finalizer)))
    })
}

unsafe extern "C" fn get_value_external(
    env: napi_env,
    value: napi_value,
    result: *mut *mut c_void,
) -> napi_status {
    with_state(env, |state| {
        let value = state.value(value)?;
        let data = state.external_data(&value)?;
        unsafe { write(result, data) }
    })
}

unsafe extern "C" fn typeof_(env: napi_env, value: napi_value, result: *mut napi_valuetype) -> napi_status {
    with_state(env, |state| {
        let value = state.value(value)?;
        let ty = state.type_of(&value)?;
        unsafe { write(result, ty) }
    })
}

unsafe extern "C" fn get_value_double(env: napi_env, value: napi_value, result: *mut f64) -> napi_status {
    with_state(env, |state| match state.value(value)? {
        HostValue::Number(n) => unsafe { write(result, n) },
        _ => Err(HostFailure::new(ffi::napi_number_expected, "a number was expected")),
    })
}

unsafe extern "C" fn get_value_bool(env: napi_env, value: napi_value, result: *mut bool) -> napi_status {
    with_state(env, |state| match state.value(value)? {
        HostValue::Bool(b) => unsafe { write(result, b) },
        _ => Err(HostFailure::new(ffi::napi_boolean_expected, "a boolean was expected")),
    })
}

/// With a null buffer, reports the byte length. Otherwise copies at most
/// `bufsize - 1` bytes, NUL-terminates and reports the bytes copied.
unsafe extern "C" fn get_value_string_utf8(
    env: napi_env,
    value: napi_value,
    buf: *mut c_char,
    bufsize: usize,
    result: *mut usize,
) -> napi_status {
    with_state(env, |state| {
        let value = state.value(value)?;
        let text = state.string(&value)?;
        let bytes = text.as_bytes();
        if buf.is_null() {
            return unsafe { write(result, bytes.len()) };
        }
        if bufsize == 0 {
            return if result.is_null() { Ok(()) } else { unsafe { write(result, 0) } };
        }
        let copied = bytes.len().min(bufsize - 1);
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.cast::<u8>(), copied);
            buf.add(copied).write(0);
        }
        if result.is_null() {
            return Ok(());
        }
        unsafe { write(result, copied) }
    })
}

unsafe extern "C" fn strict_equals(
    env: napi_env,
    lhs: napi_value,
    rhs: napi_value,
    result: *mut bool,
) -> napi_status {
    with_state(env, |state| {
        let equal = state.value(lhs)?.strict_equals(&state.value(rhs)?);
        unsafe { write(result, equal) }
    })
}

// ============================================================================
// Property access and calls
// ============================================================================

/// What a property read or write resolved to before any native code runs.
enum Access {
    Done(HostValue),
    Call(PendingCall),
}

unsafe fn run_access(host: &HostEnv, access: HostResult<Access>) -> HostResult<HostValue> {
    match access? {
        Access::Done(value) => Ok(value),
        Access::Call(call) => unsafe { invoke(host, call) },
    }
}

unsafe extern "C" fn get_named_property(
    env: napi_env,
    object: napi_value,
    utf8name: *const c_char,
    result: *mut napi_value,
) -> napi_status {
    let Some(host) = (unsafe { host(env) }) else {
        return ffi::napi_invalid_arg;
    };
    let access = host.state().and_then(|state| {
        state.check_no_exception()?;
        if utf8name.is_null() {
            return Err(HostFailure::invalid_arg("null property name"));
        }
        let receiver = state.value(object)?;
        let id = state.object_id(&receiver)?;
        let key = Key::String(unsafe { read_str(utf8name, AUTO_LENGTH) }?);
        Ok(match state.lookup(id, &key)? {
            Lookup::Own(property) | Lookup::Inherited(property) => match property.slot {
                PropertySlot::Data(value) => Access::Done(value),
                PropertySlot::Accessor {
                    getter: Some(getter),
                    ..
                } => Access::Call(PendingCall {
                    callback: getter,
                    callee: HostValue::Undefined,
                    this: receiver,
                    args: Vec::new(),
                    new_target: None,
                }),
                PropertySlot::Accessor { getter: None, .. } => Access::Done(HostValue::Undefined),
            },
            Lookup::Missing => Access::Done(HostValue::Undefined),
        })
    });
    let value = unsafe { run_access(host, access) };
    let result = value.and_then(|value| {
        let raw = host.state()?.push_handle(value);
        unsafe { write(result, raw) }
    });
    finish(host, result)
}

unsafe extern "C" fn set_named_property(
    env: napi_env,
    object: napi_value,
    utf8name: *const c_char,
    value: napi_value,
) -> napi_status {
    let Some(host) = (unsafe { host(env) }) else {
        return ffi::napi_invalid_arg;
    };
    let access = host.state().and_then(|mut state| {
        state.check_no_exception()?;
        if utf8name.is_null() {
            return Err(HostFailure::invalid_arg("null property name"));
        }
        let receiver = state.value(object)?;
        let id = state.object_id(&receiver)?;
        let value = state.value(value)?;
        let key = Key::String(unsafe { read_str(utf8name, AUTO_LENGTH) }?);
        let accessor = match state.lookup(id, &key)? {
            Lookup::Own(property) | Lookup::Inherited(property) => match property.slot {
                PropertySlot::Accessor { setter, .. } => Some(setter),
                PropertySlot::Data(_) => None,
            },
            Lookup::Missing => None,
        };
        Ok(match accessor {
            Some(Some(setter)) => Access::Call(PendingCall {
                callback: setter,
                callee: HostValue::Undefined,
                this: receiver,
                args: vec![value],
                new_target: None,
            }),
            // Accessor without a setter ignores the write
            Some(None) => Access::Done(HostValue::Undefined),
            None => {
                state.assign(id, key, value)?;
                Access::Done(HostValue::Undefined)
            }
        })
    });
    let result = unsafe { run_access(host, access) }.map(|_| ());
    finish(host, result)
}

unsafe extern "C" fn call_function(
    env: napi_env,
    recv: napi_value,
    func: napi_value,
    argc: usize,
    argv: *const napi_value,
    result: *mut napi_value,
) -> napi_status {
    let Some(host) = (unsafe { host(env) }) else {
        return ffi::napi_invalid_arg;
    };
    let call = host.state().and_then(|state| {
        state.check_no_exception()?;
        let this = state.value(recv)?;
        let callee = state.value(func)?;
        let callback = state.function_callback(&callee)?;
        let args = unsafe { read_args(&state, argc, argv) }?;
        Ok(PendingCall {
            callback,
            callee,
            this,
            args,
            new_target: None,
        })
    });
    let outcome = call.and_then(|call| unsafe { invoke(host, call) });
    let status = outcome.and_then(|value| {
        let raw = host.state()?.push_handle(value);
        if result.is_null() {
            return Ok(());
        }
        unsafe { write(result, raw) }
    });
    finish(host, status)
}

unsafe extern "C" fn new_instance(
    env: napi_env,
    constructor: napi_value,
    argc: usize,
    argv: *const napi_value,
    result: *mut napi_value,
) -> napi_status {
    let Some(host) = (unsafe { host(env) }) else {
        return ffi::napi_invalid_arg;
    };
    let call = host.state().and_then(|mut state| {
        state.check_no_exception()?;
        let callee = state.value(constructor)?;
        let callback = state.function_callback(&callee)?;
        let args = unsafe { read_args(&state, argc, argv) }?;
        let class = state.object_id(&callee)?;
        let prototype = state
            .get_data(class, &Key::from("prototype"))?
            .and_then(|proto| proto.as_object());
        let this = HostValue::Object(state.alloc(HostObject::new(ObjectKind::Plain, prototype)));
        Ok(PendingCall {
            callback,
            callee: callee.clone(),
            this,
            args,
            new_target: Some(callee),
        })
    });
    let outcome = call.and_then(|call| {
        let this = call.this.clone();
        let returned = unsafe { invoke(host, call) }?;
        Ok(match returned {
            HostValue::Object(_) => returned,
            _ => this,
        })
    });
    let status = outcome.and_then(|value| {
        let raw = host.state()?.push_handle(value);
        unsafe { write(result, raw) }
    });
    finish(host, status)
}

// ============================================================================
// Function table
// ============================================================================

pub(crate) static HOST_API: NativeApi = NativeApi {
    get_last_error_info,
    fatal_error,
    open_handle_scope,
    close_handle_scope,
    open_escapable_handle_scope,
    close_escapable_handle_scope,
    escape_handle,
    create_reference,
    delete_reference,
    reference_ref,
    reference_unref,
    get_reference_value,
    get_cb_info,
    get_new_target,
    create_function,
    define_properties,
    define_class,
    add_finalizer,
    wrap,
    unwrap,
    remove_wrap,
    throw,
    throw_error,
    is_exception_pending,
    get_and_clear_last_exception,
    get_undefined,
    get_null,
    get_global,
    get_boolean,
    create_double,
    create_string_utf8,
    create_object,
    create_symbol,
    create_error,
    create_external,
    get_value_external,
    typeof_,
    get_value_double,
    get_value_bool,
    get_value_string_utf8,
    strict_equals,
    get_named_property,
    set_named_property,
    call_function,
    new_instance,
};
