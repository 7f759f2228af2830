//! Values and objects of the reference host.

use crate::ffi::{
    self, napi_callback_info, napi_env, napi_property_attributes, napi_value, napi_valuetype,
};
use crate::prelude::*;

use super::heap::{ObjectId, Traceable};

/// A host-side value. Handles index into a table of these.
#[derive(Debug, Clone)]
pub(crate) enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Symbol(u32),
    Object(ObjectId),
}

impl HostValue {
    pub(crate) fn as_object(&self) -> Option<ObjectId> {
        match self {
            HostValue::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// `===` semantics. Objects compare by identity, NaN is never equal.
    pub(crate) fn strict_equals(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) | (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Symbol(a), HostValue::Symbol(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a == b,
            _ => false,
        }
    }

    pub(crate) fn primitive_type(&self) -> Option<napi_valuetype> {
        Some(match self {
            HostValue::Undefined => ffi::napi_undefined,
            HostValue::Null => ffi::napi_null,
            HostValue::Bool(_) => ffi::napi_boolean,
            HostValue::Number(_) => ffi::napi_number,
            HostValue::String(_) => ffi::napi_string,
            HostValue::Symbol(_) => ffi::napi_symbol,
            HostValue::Object(_) => return None,
        })
    }
}

/// Property key: string or symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Key {
    String(Rc<str>),
    Symbol(u32),
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::String(Rc::from(name))
    }
}

/// A native callback and the data pointer it was registered with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NativeCallback {
    pub callback: unsafe extern "C" fn(napi_env, napi_callback_info) -> napi_value,
    pub data: *mut c_void,
}

#[derive(Debug, Clone)]
pub(crate) enum PropertySlot {
    Data(HostValue),
    Accessor {
        getter: Option<NativeCallback>,
        setter: Option<NativeCallback>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Property {
    pub slot: PropertySlot,
    pub attributes: napi_property_attributes,
}

impl Property {
    pub(crate) fn data(value: HostValue, attributes: napi_property_attributes) -> Self {
        Self {
            slot: PropertySlot::Data(value),
            attributes,
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.attributes & ffi::napi_writable != 0
    }

    pub(crate) fn is_enumerable(&self) -> bool {
        self.attributes & ffi::napi_enumerable != 0
    }
}

/// A finalize callback registered on an object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Finalizer {
    pub callback: unsafe extern "C" fn(napi_env, *mut c_void, *mut c_void),
    pub data: *mut c_void,
    pub hint: *mut c_void,
}

impl Finalizer {
    /// # Safety
    /// `env` must be the environment the finalizer was registered with.
    pub(crate) unsafe fn run(self, env: napi_env) {
        unsafe { (self.callback)(env, self.data, self.hint) }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Wrap {
    pub data: *mut c_void,
    pub finalizer: Option<Finalizer>,
}

#[derive(Debug, Clone)]
pub(crate) enum ObjectKind {
    Plain,
    Error,
    Function {
        name: Rc<str>,
        callback: NativeCallback,
    },
    /// Opaque native data behind an `external` value.
    External {
        data: *mut c_void,
    },
}

#[derive(Debug)]
pub(crate) struct HostObject {
    pub kind: ObjectKind,
    pub properties: IndexMap<Key, Property>,
    pub prototype: Option<ObjectId>,
    pub finalizers: Vec<Finalizer>,
    pub wrap: Option<Wrap>,
}

impl HostObject {
    pub(crate) fn new(kind: ObjectKind, prototype: Option<ObjectId>) -> Self {
        Self {
            kind,
            properties: index_map_new(),
            prototype,
            finalizers: Vec::new(),
            wrap: None,
        }
    }

    pub(crate) fn is_function(&self) -> bool {
        matches!(self.kind, ObjectKind::Function { .. })
    }

    pub(crate) fn external_data(&self) -> Option<*mut c_void> {
        match self.kind {
            ObjectKind::External { data } => Some(data),
            _ => None,
        }
    }

    pub(crate) fn callback(&self) -> Option<NativeCallback> {
        match &self.kind {
            ObjectKind::Function { callback, .. } => Some(*callback),
            _ => None,
        }
    }

    pub(crate) fn set_data(&mut self, key: Key, value: HostValue, attributes: napi_property_attributes) {
        self.properties.insert(key, Property::data(value, attributes));
    }

    /// Every pending finalize callback, wrap first.
    pub(crate) fn into_finalizers(self) -> impl Iterator<Item = Finalizer> {
        self.wrap
            .and_then(|wrap| wrap.finalizer)
            .into_iter()
            .chain(self.finalizers)
    }
}

impl Traceable for HostObject {
    fn trace(&self, visitor: &mut dyn FnMut(ObjectId)) {
        if let Some(proto) = self.prototype {
            visitor(proto);
        }
        for property in self.properties.values() {
            if let PropertySlot::Data(HostValue::Object(id)) = &property.slot {
                visitor(*id);
            }
        }
    }
}
