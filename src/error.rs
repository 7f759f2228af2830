//! Error types for the bridge

use crate::ffi;
use crate::scope::ScopeId;
use thiserror::Error;

/// Status reported by a native call.
///
/// Mirrors the raw `napi_status` codes one-to-one. Codes the bridge does not
/// know about are preserved in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidArg,
    ObjectExpected,
    StringExpected,
    NameExpected,
    FunctionExpected,
    NumberExpected,
    BooleanExpected,
    ArrayExpected,
    GenericFailure,
    PendingException,
    Cancelled,
    EscapeCalledTwice,
    HandleScopeMismatch,
    CallbackScopeMismatch,
    QueueFull,
    Closing,
    BigintExpected,
    DateExpected,
    ArraybufferExpected,
    DetachableArraybufferExpected,
    WouldDeadlock,
    Unknown(i32),
}

impl Status {
    pub fn from_raw(raw: ffi::napi_status) -> Self {
        match raw {
            ffi::napi_ok => Status::Ok,
            ffi::napi_invalid_arg => Status::InvalidArg,
            ffi::napi_object_expected => Status::ObjectExpected,
            ffi::napi_string_expected => Status::StringExpected,
            ffi::napi_name_expected => Status::NameExpected,
            ffi::napi_function_expected => Status::FunctionExpected,
            ffi::napi_number_expected => Status::NumberExpected,
            ffi::napi_boolean_expected => Status::BooleanExpected,
            ffi::napi_array_expected => Status::ArrayExpected,
            ffi::napi_generic_failure => Status::GenericFailure,
            ffi::napi_pending_exception => Status::PendingException,
            ffi::napi_cancelled => Status::Cancelled,
            ffi::napi_escape_called_twice => Status::EscapeCalledTwice,
            ffi::napi_handle_scope_mismatch => Status::HandleScopeMismatch,
            ffi::napi_callback_scope_mismatch => Status::CallbackScopeMismatch,
            ffi::napi_queue_full => Status::QueueFull,
            ffi::napi_closing => Status::Closing,
            ffi::napi_bigint_expected => Status::BigintExpected,
            ffi::napi_date_expected => Status::DateExpected,
            ffi::napi_arraybuffer_expected => Status::ArraybufferExpected,
            ffi::napi_detachable_arraybuffer_expected => Status::DetachableArraybufferExpected,
            ffi::napi_would_deadlock => Status::WouldDeadlock,
            other => Status::Unknown(other),
        }
    }

    pub fn into_raw(self) -> ffi::napi_status {
        match self {
            Status::Ok => ffi::napi_ok,
            Status::InvalidArg => ffi::napi_invalid_arg,
            Status::ObjectExpected => ffi::napi_object_expected,
            Status::StringExpected => ffi::napi_string_expected,
            Status::NameExpected => ffi::napi_name_expected,
            Status::FunctionExpected => ffi::napi_function_expected,
            Status::NumberExpected => ffi::napi_number_expected,
            Status::BooleanExpected => ffi::napi_boolean_expected,
            Status::ArrayExpected => ffi::napi_array_expected,
            Status::GenericFailure => ffi::napi_generic_failure,
            Status::PendingException => ffi::napi_pending_exception,
            Status::Cancelled => ffi::napi_cancelled,
            Status::EscapeCalledTwice => ffi::napi_escape_called_twice,
            Status::HandleScopeMismatch => ffi::napi_handle_scope_mismatch,
            Status::CallbackScopeMismatch => ffi::napi_callback_scope_mismatch,
            Status::QueueFull => ffi::napi_queue_full,
            Status::Closing => ffi::napi_closing,
            Status::BigintExpected => ffi::napi_bigint_expected,
            Status::DateExpected => ffi::napi_date_expected,
            Status::ArraybufferExpected => ffi::napi_arraybuffer_expected,
            Status::DetachableArraybufferExpected => ffi::napi_detachable_arraybuffer_expected,
            Status::WouldDeadlock => ffi::napi_would_deadlock,
            Status::Unknown(raw) => raw,
        }
    }

    /// Statuses that mean the native scope or handle bookkeeping is already corrupted.
    pub fn is_corruption(self) -> bool {
        matches!(
            self,
            Status::EscapeCalledTwice | Status::HandleScopeMismatch | Status::CallbackScopeMismatch
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Unknown(raw) => write!(f, "unknown status {}", raw),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Main error type for the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A native call returned a status other than `napi_ok`.
    #[error("native call failed with {status}: {message}")]
    Status { status: Status, message: String },

    /// A value was used after the scope that owns it closed.
    #[error("InvalidScope: value used after its scope was closed")]
    InvalidScope,

    /// A scope was closed while it was not the innermost open scope.
    #[error("ScopeMismatch: tried to close scope {found} while scope {expected:?} is current")]
    ScopeMismatch {
        expected: Option<ScopeId>,
        found: ScopeId,
    },

    #[error("InvalidOperation: {0}")]
    InvalidOperation(String),

    #[error("reference used after release")]
    ReferenceReleased,

    #[error("no native function table installed")]
    NotInstalled,

    #[error("TypeError: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A managed callback failed while running inside a trampoline.
    #[error("{0}")]
    Callback(String),
}

impl BridgeError {
    pub fn status(status: Status, message: impl Into<String>) -> Self {
        BridgeError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        BridgeError::InvalidOperation(message.into())
    }

    pub fn callback(message: impl Into<String>) -> Self {
        BridgeError::Callback(message.into())
    }

    pub fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        BridgeError::TypeMismatch { expected, found }
    }

    /// Native status carried by this error, if any.
    pub fn native_status(&self) -> Option<Status> {
        match self {
            BridgeError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when a JS exception is already pending in the host for this failure.
    pub fn is_pending_exception(&self) -> bool {
        self.native_status() == Some(Status::PendingException)
    }

    /// Discipline violations and scope corruption. Continuing after one of
    /// these risks native memory corruption.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Status { status, .. } => status.is_corruption(),
            BridgeError::InvalidScope
            | BridgeError::ScopeMismatch { .. }
            | BridgeError::InvalidOperation(_)
            | BridgeError::ReferenceReleased => true,
            BridgeError::NotInstalled
            | BridgeError::TypeMismatch { .. }
            | BridgeError::Callback(_) => false,
        }
    }

    /// Short code attached to the JS error thrown for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Status { .. } => "ERR_NATIVE_STATUS",
            BridgeError::InvalidScope => "ERR_INVALID_SCOPE",
            BridgeError::ScopeMismatch { .. } => "ERR_SCOPE_MISMATCH",
            BridgeError::InvalidOperation(_) => "ERR_INVALID_OPERATION",
            BridgeError::ReferenceReleased => "ERR_REFERENCE_RELEASED",
            BridgeError::NotInstalled => "ERR_NOT_INSTALLED",
            BridgeError::TypeMismatch { .. } => "ERR_TYPE_MISMATCH",
            BridgeError::Callback(_) => "ERR_CALLBACK",
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
