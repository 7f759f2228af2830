//! Scope discipline, references and callback trampolines for Node-API style
//! native addons.
//!
//! Every host value handed to managed code is tagged with the scope that was
//! innermost when it was created. Scopes close in LIFO order, escapable
//! scopes promote exactly one value to their parent, and a value whose scope
//! has closed can no longer be passed back to the host. Managed closures are
//! pinned behind stable handles for as long as the host may call them.
//!
//! # Example
//!
//! ```
//! use napi_bridge::host::HostRuntime;
//! use napi_bridge::create_function;
//!
//! let runtime = HostRuntime::new().unwrap();
//! runtime
//!     .load(|_scope, exports| {
//!         let add = create_function(exports.env(), "add", |args| {
//!             let sum = args.arg(0)?.as_f64()? + args.arg(1)?.as_f64()?;
//!             args.env().create_number(sum)
//!         })?;
//!         exports.set_named("add", add)
//!     })
//!     .unwrap();
//!
//! let sum = runtime.call_export("add", &[2.into(), 3.into()]).unwrap();
//! assert_eq!(sum, serde_json::json!(5.0));
//! ```

pub mod callback;
pub mod class;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod ffi;
pub mod module;
pub mod prelude;
pub mod reference;
pub mod scope;
pub mod value;

#[cfg(feature = "host")]
pub mod host;

pub use callback::{CallbackArgs, CallbackKind, create_function};
pub use class::{ClassBuilder, define_class};
pub use descriptor::{
    PropertyAttributes, PropertyDescriptor, PropertyKey, define_properties, to_native_descriptors,
};
pub use env::Env;
pub use error::{BridgeError, Result, Status};
pub use ffi::pinned::pinned_count;
pub use module::init_module;
pub use reference::Reference;
pub use scope::{ScopeId, ScopeKind, ValueScope};
pub use value::{Value, ValueType};
