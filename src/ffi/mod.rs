//! Raw native ABI consumed by the bridge.
//!
//! Every native operation follows the status-or-value convention: the
//! function returns a `napi_status` and writes its result through an
//! out-parameter. Status codes and struct layouts match Node-API so a real
//! host can hand over its function table unchanged.
//!
//! # Function Table
//!
//! The bridge never links against host symbols directly. A host installs a
//! [`NativeApi`] table once per process with [`install`]; all managed
//! wrappers call through it.
//!
//! # Thread Safety
//!
//! Raw handles are only meaningful on the thread currently driving their
//! environment. None of the handle types are `Send`.

#![allow(non_camel_case_types, non_upper_case_globals)]

pub(crate) mod native;
pub(crate) mod pinned;

use core::ffi::{CStr, c_char, c_int, c_void};
use std::sync::OnceLock;

use crate::error::BridgeError;

pub use native::{
    invoke_constructor, invoke_function, invoke_getter, invoke_method, invoke_setter,
    release_pinned,
};
pub use pinned::PinnedHandle;

// ============================================================================
// Status Codes
// ============================================================================

pub type napi_status = c_int;

pub const napi_ok: napi_status = 0;
pub const napi_invalid_arg: napi_status = 1;
pub const napi_object_expected: napi_status = 2;
pub const napi_string_expected: napi_status = 3;
pub const napi_name_expected: napi_status = 4;
pub const napi_function_expected: napi_status = 5;
pub const napi_number_expected: napi_status = 6;
pub const napi_boolean_expected: napi_status = 7;
pub const napi_array_expected: napi_status = 8;
pub const napi_generic_failure: napi_status = 9;
pub const napi_pending_exception: napi_status = 10;
pub const napi_cancelled: napi_status = 11;
pub const napi_escape_called_twice: napi_status = 12;
pub const napi_handle_scope_mismatch: napi_status = 13;
pub const napi_callback_scope_mismatch: napi_status = 14;
pub const napi_queue_full: napi_status = 15;
pub const napi_closing: napi_status = 16;
pub const napi_bigint_expected: napi_status = 17;
pub const napi_date_expected: napi_status = 18;
pub const napi_arraybuffer_expected: napi_status = 19;
pub const napi_detachable_arraybuffer_expected: napi_status = 20;
pub const napi_would_deadlock: napi_status = 21;

// ============================================================================
// Opaque Types
// ============================================================================

#[repr(C)]
pub struct napi_env__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_value__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_handle_scope__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_escapable_handle_scope__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_ref__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_callback_info__ {
    _private: [u8; 0],
}

pub type napi_env = *mut napi_env__;
pub type napi_value = *mut napi_value__;
pub type napi_handle_scope = *mut napi_handle_scope__;
pub type napi_escapable_handle_scope = *mut napi_escapable_handle_scope__;
pub type napi_ref = *mut napi_ref__;
pub type napi_callback_info = *mut napi_callback_info__;

pub type napi_callback =
    Option<unsafe extern "C" fn(env: napi_env, info: napi_callback_info) -> napi_value>;

pub type napi_finalize =
    Option<unsafe extern "C" fn(env: napi_env, data: *mut c_void, hint: *mut c_void)>;

// ============================================================================
// Value Types
// ============================================================================

pub type napi_valuetype = c_int;

pub const napi_undefined: napi_valuetype = 0;
pub const napi_null: napi_valuetype = 1;
pub const napi_boolean: napi_valuetype = 2;
pub const napi_number: napi_valuetype = 3;
pub const napi_string: napi_valuetype = 4;
pub const napi_symbol: napi_valuetype = 5;
pub const napi_object: napi_valuetype = 6;
pub const napi_function: napi_valuetype = 7;
pub const napi_external: napi_valuetype = 8;
pub const napi_bigint: napi_valuetype = 9;

// ============================================================================
// Property Descriptors
// ============================================================================

pub type napi_property_attributes = c_int;

pub const napi_default: napi_property_attributes = 0;
pub const napi_writable: napi_property_attributes = 1 << 0;
pub const napi_enumerable: napi_property_attributes = 1 << 1;
pub const napi_configurable: napi_property_attributes = 1 << 2;
pub const napi_static: napi_property_attributes = 1 << 10;
pub const napi_default_method: napi_property_attributes = napi_writable | napi_configurable;
pub const napi_default_jsproperty: napi_property_attributes =
    napi_writable | napi_enumerable | napi_configurable;

/// One entry of the batch passed to `define_properties` / `define_class`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct napi_property_descriptor {
    pub utf8name: *const c_char,
    pub name: napi_value,
    pub method: napi_callback,
    pub getter: napi_callback,
    pub setter: napi_callback,
    pub value: napi_value,
    pub attributes: napi_property_attributes,
    pub data: *mut c_void,
}

/// Detail for the most recent failed call on an environment.
#[repr(C)]
pub struct napi_extended_error_info {
    pub error_message: *const c_char,
    pub engine_reserved: *mut c_void,
    pub engine_error_code: u32,
    pub error_code: napi_status,
}

// ============================================================================
// Function Table
// ============================================================================

/// The native operations the bridge consumes.
///
/// Field names follow the `napi_*` entry points with the prefix dropped.
#[derive(Clone, Copy)]
pub struct NativeApi {
    pub get_last_error_info:
        unsafe extern "C" fn(napi_env, *mut *const napi_extended_error_info) -> napi_status,
    pub fatal_error: unsafe extern "C" fn(*const c_char, usize, *const c_char, usize),

    // scopes
    pub open_handle_scope: unsafe extern "C" fn(napi_env, *mut napi_handle_scope) -> napi_status,
    pub close_handle_scope: unsafe extern "C" fn(napi_env, napi_handle_scope) -> napi_status,
    pub open_escapable_handle_scope:
        unsafe extern "C" fn(napi_env, *mut napi_escapable_handle_scope) -> napi_status,
    pub close_escapable_handle_scope:
        unsafe extern "C" fn(napi_env, napi_escapable_handle_scope) -> napi_status,
    pub escape_handle: unsafe extern "C" fn(
        napi_env,
        napi_escapable_handle_scope,
        napi_value,
        *mut napi_value,
    ) -> napi_status,

    // references
    pub create_reference:
        unsafe extern "C" fn(napi_env, napi_value, u32, *mut napi_ref) -> napi_status,
    pub delete_reference: unsafe extern "C" fn(napi_env, napi_ref) -> napi_status,
    pub reference_ref: unsafe extern "C" fn(napi_env, napi_ref, *mut u32) -> napi_status,
    pub reference_unref: unsafe extern "C" fn(napi_env, napi_ref, *mut u32) -> napi_status,
    pub get_reference_value:
        unsafe extern "C" fn(napi_env, napi_ref, *mut napi_value) -> napi_status,

    // callbacks
    pub get_cb_info: unsafe extern "C" fn(
        napi_env,
        napi_callback_info,
        *mut usize,
        *mut napi_value,
        *mut napi_value,
        *mut *mut c_void,
    ) -> napi_status,
    pub get_new_target:
        unsafe extern "C" fn(napi_env, napi_callback_info, *mut napi_value) -> napi_status,
    pub create_function: unsafe extern "C" fn(
        napi_env,
        *const c_char,
        usize,
        napi_callback,
        *mut c_void,
        *mut napi_value,
    ) -> napi_status,
    pub define_properties: unsafe extern "C" fn(
        napi_env,
        napi_value,
        usize,
        *const napi_property_descriptor,
    ) -> napi_status,
    pub define_class: unsafe extern "C" fn(
        napi_env,
        *const c_char,
        usize,
        napi_callback,
        *mut c_void,
        usize,
        *const napi_property_descriptor,
        *mut napi_value,
    ) -> napi_status,

    // lifetime
    pub add_finalizer: unsafe extern "C" fn(
        napi_env,
        napi_value,
        *mut c_void,
        napi_finalize,
        *mut c_void,
        *mut napi_ref,
    ) -> napi_status,
    pub wrap: unsafe extern "C" fn(
        napi_env,
        napi_value,
        *mut c_void,
        napi_finalize,
        *mut c_void,
        *mut napi_ref,
    ) -> napi_status,
    pub unwrap: unsafe extern "C" fn(napi_env, napi_value, *mut *mut c_void) -> napi_status,
    pub remove_wrap: unsafe extern "C" fn(napi_env, napi_value, *mut *mut c_void) -> napi_status,

    // exceptions
    pub throw: unsafe extern "C" fn(napi_env, napi_value) -> napi_status,
    pub throw_error: unsafe extern "C" fn(napi_env, *const c_char, *const c_char) -> napi_status,
    pub is_exception_pending: unsafe extern "C" fn(napi_env, *mut bool) -> napi_status,
    pub get_and_clear_last_exception:
        unsafe extern "C" fn(napi_env, *mut napi_value) -> napi_status,

    // values
    pub get_undefined: unsafe extern "C" fn(napi_env, *mut napi_value) -> napi_status,
    pub get_null: unsafe extern "C" fn(napi_env, *mut napi_value) -> napi_status,
    pub get_global: unsafe extern "C" fn(napi_env, *mut napi_value) -> napi_status,
    pub get_boolean: unsafe extern "C" fn(napi_env, bool, *mut napi_value) -> napi_status,
    pub create_double: unsafe extern "C" fn(napi_env, f64, *mut napi_value) -> napi_status,
    pub create_string_utf8:
        unsafe extern "C" fn(napi_env, *const c_char, usize, *mut napi_value) -> napi_status,
    pub create_object: unsafe extern "C" fn(napi_env, *mut napi_value) -> napi_status,
    pub create_symbol: unsafe extern "C" fn(napi_env, napi_value, *mut napi_value) -> napi_status,
    pub create_error:
        unsafe extern "C" fn(napi_env, napi_value, napi_value, *mut napi_value) -> napi_status,
    pub create_external: unsafe extern "C" fn(
        napi_env,
        *mut c_void,
        napi_finalize,
        *mut c_void,
        *mut napi_value,
    ) -> napi_status,
    pub get_value_external:
        unsafe extern "C" fn(napi_env, napi_value, *mut *mut c_void) -> napi_status,
    pub typeof_: unsafe extern "C" fn(napi_env, napi_value, *mut napi_valuetype) -> napi_status,
    pub get_value_double: unsafe extern "C" fn(napi_env, napi_value, *mut f64) -> napi_status,
    pub get_value_bool: unsafe extern "C" fn(napi_env, napi_value, *mut bool) -> napi_status,
    pub get_value_string_utf8: unsafe extern "C" fn(
        napi_env,
        napi_value,
        *mut c_char,
        usize,
        *mut usize,
    ) -> napi_status,
    pub strict_equals:
        unsafe extern "C" fn(napi_env, napi_value, napi_value, *mut bool) -> napi_status,
    pub get_named_property:
        unsafe extern "C" fn(napi_env, napi_value, *const c_char, *mut napi_value) -> napi_status,
    pub set_named_property:
        unsafe extern "C" fn(napi_env, napi_value, *const c_char, napi_value) -> napi_status,
    pub call_function: unsafe extern "C" fn(
        napi_env,
        napi_value,
        napi_value,
        usize,
        *const napi_value,
        *mut napi_value,
    ) -> napi_status,
    pub new_instance: unsafe extern "C" fn(
        napi_env,
        napi_value,
        usize,
        *const napi_value,
        *mut napi_value,
    ) -> napi_status,
}

static API: OnceLock<&'static NativeApi> = OnceLock::new();

/// Install the host's function table.
///
/// Installing the same table again is a no-op; installing a different one
/// once a table is in place is rejected.
pub fn install(api: &'static NativeApi) -> Result<(), BridgeError> {
    let installed = API.get_or_init(|| api);
    if core::ptr::eq(*installed, api) {
        Ok(())
    } else {
        Err(BridgeError::invalid_operation(
            "a different native function table is already installed",
        ))
    }
}

/// The installed function table.
pub(crate) fn api() -> Result<&'static NativeApi, BridgeError> {
    API.get().copied().ok_or(BridgeError::NotInstalled)
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Helper to convert C string to Rust &str.
pub(crate) unsafe fn c_str_to_str<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        None
    } else {
        // SAFETY: Caller guarantees s is a valid C string
        unsafe { CStr::from_ptr(s) }.to_str().ok()
    }
}
