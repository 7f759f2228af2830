//! Property descriptors and their marshaling into the native layout.
//!
//! A managed descriptor carries closures; the native descriptor carries
//! trampoline pointers plus one opaque `data` pointer. Marshaling pins one
//! closure set per descriptor that has any callback, and the pin is
//! attached to the owning object so it lives exactly as long as the
//! property can still be invoked.

use std::ffi::CString;
use std::ops::BitOr;

use tracing::debug;

use crate::callback::{Callback, CallbackArgs, CallbackClosure};
use crate::env::{Env, to_c_string};
use crate::error::Result;
use crate::ffi::pinned::{self, PinGuard, Pinned};
use crate::ffi::{self, napi_property_descriptor};
use crate::prelude::*;
use crate::value::Value;

// ============================================================================
// Attributes
// ============================================================================

/// Property attribute bits, in the host's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAttributes(ffi::napi_property_attributes);

impl PropertyAttributes {
    pub const NONE: PropertyAttributes = PropertyAttributes(ffi::napi_default);
    pub const WRITABLE: PropertyAttributes = PropertyAttributes(ffi::napi_writable);
    pub const ENUMERABLE: PropertyAttributes = PropertyAttributes(ffi::napi_enumerable);
    pub const CONFIGURABLE: PropertyAttributes = PropertyAttributes(ffi::napi_configurable);
    /// Class member defined on the constructor instead of the prototype.
    pub const STATIC: PropertyAttributes = PropertyAttributes(ffi::napi_static);
    pub const DEFAULT_METHOD: PropertyAttributes = PropertyAttributes(ffi::napi_default_method);
    pub const DEFAULT_PROPERTY: PropertyAttributes =
        PropertyAttributes(ffi::napi_default_jsproperty);

    pub fn bits(self) -> ffi::napi_property_attributes {
        self.0
    }

    pub fn contains(self, other: PropertyAttributes) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PropertyAttributes {
    type Output = PropertyAttributes;

    fn bitor(self, rhs: PropertyAttributes) -> PropertyAttributes {
        PropertyAttributes(self.0 | rhs.0)
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Property name: a UTF-8 string or a host name value (string or symbol).
#[derive(Debug, Clone)]
pub enum PropertyKey {
    Name(String),
    Value(Value),
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        PropertyKey::Name(name.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::Name(name)
    }
}

impl From<Value> for PropertyKey {
    fn from(value: Value) -> Self {
        PropertyKey::Value(value)
    }
}

pub enum DescriptorKind {
    Value(Value),
    Method(Box<Callback>),
    Accessor {
        getter: Option<Box<Callback>>,
        setter: Option<Box<Callback>>,
    },
}

/// One property to define on an object or class.
pub struct PropertyDescriptor {
    key: PropertyKey,
    kind: DescriptorKind,
    attributes: PropertyAttributes,
}

impl PropertyDescriptor {
    /// Plain data property.
    pub fn value(key: impl Into<PropertyKey>, value: Value) -> Self {
        Self {
            key: key.into(),
            kind: DescriptorKind::Value(value),
            attributes: PropertyAttributes::DEFAULT_PROPERTY,
        }
    }

    pub fn method(
        key: impl Into<PropertyKey>,
        method: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            kind: DescriptorKind::Method(Box::new(method)),
            attributes: PropertyAttributes::DEFAULT_METHOD,
        }
    }

    /// Accessor property. With neither half present this defines a plain
    /// `undefined` data property.
    pub fn accessor(
        key: impl Into<PropertyKey>,
        getter: Option<Box<Callback>>,
        setter: Option<Box<Callback>>,
    ) -> Self {
        Self {
            key: key.into(),
            kind: DescriptorKind::Accessor { getter, setter },
            attributes: PropertyAttributes::ENUMERABLE | PropertyAttributes::CONFIGURABLE,
        }
    }

    pub fn getter(
        key: impl Into<PropertyKey>,
        getter: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        Self::accessor(key, Some(Box::new(getter)), None)
    }

    pub fn with_attributes(mut self, attributes: PropertyAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Define on the class constructor rather than the prototype.
    pub fn into_static(mut self) -> Self {
        self.attributes = self.attributes | PropertyAttributes::STATIC;
        self
    }

    pub fn key(&self) -> &PropertyKey {
        &self.key
    }

    pub fn kind(&self) -> &DescriptorKind {
        &self.kind
    }

    pub fn attributes(&self) -> PropertyAttributes {
        self.attributes
    }

    /// True when marshaling needs to pin a closure for this descriptor.
    pub fn has_callback(&self) -> bool {
        match &self.kind {
            DescriptorKind::Value(_) => false,
            DescriptorKind::Method(_) => true,
            DescriptorKind::Accessor { getter, setter } => getter.is_some() || setter.is_some(),
        }
    }
}

impl std::fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            DescriptorKind::Value(_) => "value",
            DescriptorKind::Method(_) => "method",
            DescriptorKind::Accessor { .. } => "accessor",
        };
        f.debug_struct("PropertyDescriptor")
            .field("key", &self.key)
            .field("kind", &kind)
            .field("attributes", &self.attributes)
            .finish()
    }
}

// ============================================================================
// Native marshaling
// ============================================================================

/// A descriptor batch in the host's layout, plus everything it points at.
///
/// Pins that were never attached to an owner are released on drop.
pub struct NativeDescriptors {
    raw: Vec<napi_property_descriptor>,
    pins: PinGuard,
    // Backing storage for `utf8name` pointers
    _names: Vec<CString>,
}

impl NativeDescriptors {
    pub fn as_slice(&self) -> &[napi_property_descriptor] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Number of closure sets pinned for this batch.
    pub fn pinned_len(&self) -> usize {
        self.pins.len()
    }

    pub fn pinned(&self) -> &[pinned::PinnedHandle] {
        self.pins.handles()
    }

    /// Hand every pin's lifetime to `owner`.
    pub(crate) fn attach_to(self, owner: &Value) -> Result<()> {
        self.pins.attach_to(owner)
    }
}

/// Convert managed descriptors into the host's layout.
///
/// Exactly one closure set is pinned per descriptor with a callback.
pub fn to_native_descriptors(
    env: Env,
    descriptors: Vec<PropertyDescriptor>,
) -> Result<NativeDescriptors> {
    let mut native = NativeDescriptors {
        raw: Vec::with_capacity(descriptors.len()),
        pins: PinGuard::new(),
        _names: Vec::new(),
    };

    for descriptor in descriptors {
        let mut raw = napi_property_descriptor {
            utf8name: ptr::null(),
            name: ptr::null_mut(),
            method: None,
            getter: None,
            setter: None,
            value: ptr::null_mut(),
            attributes: descriptor.attributes.bits(),
            data: ptr::null_mut(),
        };

        match &descriptor.key {
            PropertyKey::Name(name) => {
                let name = to_c_string(name)?;
                // Moving the CString into the Vec keeps its heap buffer in place
                raw.utf8name = name.as_ptr();
                native._names.push(name);
            }
            PropertyKey::Value(value) => raw.name = value.raw()?,
        }

        let closure = match descriptor.kind {
            DescriptorKind::Value(value) => {
                raw.value = value.raw()?;
                None
            }
            DescriptorKind::Method(method) => {
                raw.method = Some(ffi::invoke_method);
                Some(CallbackClosure::Method(method))
            }
            DescriptorKind::Accessor { getter, setter } => {
                if getter.is_some() {
                    raw.getter = Some(ffi::invoke_getter);
                }
                if setter.is_some() {
                    raw.setter = Some(ffi::invoke_setter);
                }
                (getter.is_some() || setter.is_some())
                    .then_some(CallbackClosure::Accessor { getter, setter })
            }
        };

        if let Some(closure) = closure {
            let handle = pinned::pin(env, Pinned::Closure(closure));
            raw.data = handle.as_ptr();
            native.pins.push(handle);
        }
        native.raw.push(raw);
    }

    debug!(
        descriptors = native.raw.len(),
        pinned = native.pins.len(),
        "descriptors marshaled"
    );
    Ok(native)
}

/// Define a batch of properties on `target`.
///
/// The pinned closures are released by finalizers on `target`. If the
/// host rejects the batch, nothing stays pinned.
pub fn define_properties(target: &Value, descriptors: Vec<PropertyDescriptor>) -> Result<()> {
    let env = target.env();
    let raw = target.raw()?;
    let native = to_native_descriptors(env, descriptors)?;
    env.call(|api| unsafe {
        (api.define_properties)(env.raw(), raw, native.len(), native.as_slice().as_ptr())
    })?;
    native.attach_to(target)
}
