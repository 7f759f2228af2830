//! Class registration.
//!
//! A class is a host constructor whose `data` pointer names a pinned
//! constructor closure. Each `new` call runs the closure, pins the native
//! instance it returns and wraps it into `this`. Methods and accessors are
//! ordinary property descriptors; static members land on the constructor,
//! the rest on its prototype.

use std::any::Any;

use tracing::debug;

use crate::callback::{CallbackArgs, CallbackClosure};
use crate::descriptor::{PropertyAttributes, PropertyDescriptor, to_native_descriptors};
use crate::env::Env;
use crate::error::{BridgeError, Result};
use crate::ffi::pinned::{self, PinGuard, Pinned};
use crate::ffi;
use crate::value::Value;

/// Define a class from a constructor closure and its member descriptors.
pub fn define_class(
    env: Env,
    name: &str,
    constructor: impl Fn(&CallbackArgs<'_>) -> Result<Box<dyn Any>> + 'static,
    properties: Vec<PropertyDescriptor>,
) -> Result<Value> {
    let mut pins = PinGuard::new();
    let handle = pinned::pin(
        env,
        Pinned::Closure(CallbackClosure::Constructor(Box::new(constructor))),
    );
    pins.push(handle);
    let native = to_native_descriptors(env, properties)?;

    let class = env.create_value(|api, out| unsafe {
        (api.define_class)(
            env.raw(),
            name.as_ptr().cast(),
            name.len(),
            Some(ffi::invoke_constructor),
            handle.as_ptr(),
            native.len(),
            native.as_slice().as_ptr(),
            out,
        )
    })?;
    debug!(name, members = native.len(), "class defined");

    // Prototype members are reachable from instances through `constructor`,
    // so the constructor owns every pin
    pins.attach_to(&class)?;
    native.attach_to(&class)?;
    Ok(class)
}

// ============================================================================
// ClassBuilder
// ============================================================================

type Member<T> = dyn Fn(&T, &CallbackArgs<'_>) -> Result<Value>;

/// Typed builder for classes that wrap a `T` in every instance.
///
/// ```ignore
/// let counter = ClassBuilder::new("Counter", |_args| Ok(Cell::new(0.0)))
///     .method("increment", |count, args| {
///         count.set(count.get() + 1.0);
///         args.env().create_number(count.get())
///     })
///     .build(env)?;
/// ```
pub struct ClassBuilder<T: 'static> {
    name: String,
    constructor: Box<dyn Fn(&CallbackArgs<'_>) -> Result<T>>,
    properties: Vec<PropertyDescriptor>,
}

impl<T: 'static> ClassBuilder<T> {
    pub fn new(
        name: impl Into<String>,
        constructor: impl Fn(&CallbackArgs<'_>) -> Result<T> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            constructor: Box::new(constructor),
            properties: Vec::new(),
        }
    }

    /// Data property on the prototype.
    pub fn property(mut self, name: &str, value: Value) -> Self {
        self.properties.push(PropertyDescriptor::value(name, value));
        self
    }

    /// Data property on the constructor.
    pub fn static_value(mut self, name: &str, value: Value) -> Self {
        self.properties
            .push(PropertyDescriptor::value(name, value).into_static());
        self
    }

    pub fn method(
        mut self,
        name: &str,
        method: impl Fn(&T, &CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        let method = bind(Box::new(method));
        self.properties.push(PropertyDescriptor::method(name, method));
        self
    }

    /// Function on the constructor. It receives no instance.
    pub fn static_method(
        mut self,
        name: &str,
        method: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        self.properties
            .push(PropertyDescriptor::method(name, method).into_static());
        self
    }

    /// Read-only accessor.
    pub fn getter(
        mut self,
        name: &str,
        getter: impl Fn(&T, &CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        let getter = bind(Box::new(getter));
        self.properties.push(PropertyDescriptor::getter(name, getter));
        self
    }

    /// Read-write accessor. The setter receives the assigned value.
    pub fn accessor(
        mut self,
        name: &str,
        getter: impl Fn(&T, &CallbackArgs<'_>) -> Result<Value> + 'static,
        setter: impl Fn(&T, Value, &CallbackArgs<'_>) -> Result<()> + 'static,
    ) -> Self {
        let getter = bind(Box::new(getter));
        let setter = move |args: &CallbackArgs<'_>| {
            let value = args.arg(0)?;
            args.this()
                .with_wrapped::<T, _>(|instance| setter(instance, value, args))??;
            args.env().get_undefined()
        };
        self.properties.push(
            PropertyDescriptor::accessor(name, Some(Box::new(getter)), Some(Box::new(setter)))
                .with_attributes(PropertyAttributes::ENUMERABLE | PropertyAttributes::CONFIGURABLE),
        );
        self
    }

    pub fn build(self, env: Env) -> Result<Value> {
        let constructor = self.constructor;
        define_class(
            env,
            &self.name,
            move |args| {
                if args.new_target()?.is_none() {
                    return Err(BridgeError::type_mismatch("constructor call", "plain call"));
                }
                let instance = constructor(args)?;
                Ok(Box::new(instance) as Box<dyn Any>)
            },
            self.properties,
        )
    }
}

/// Adapt an instance member into a receiver-resolving callback.
fn bind<T: 'static>(
    member: Box<Member<T>>,
) -> impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static {
    move |args: &CallbackArgs<'_>| {
        args.this()
            .with_wrapped::<T, _>(|instance| member(instance, args))?
    }
}
