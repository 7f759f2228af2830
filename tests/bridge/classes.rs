//! Tests for class definition and wrapped native instances

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use napi_bridge::{
    BridgeError, ClassBuilder, Env, PropertyDescriptor, Status, Value, define_class, pinned_count,
};

use super::create_test_runtime;

fn counter_class(env: Env) -> napi_bridge::Result<Value> {
    ClassBuilder::new("Counter", |args| {
        let start = args.get(0).map(|v| v.as_f64()).transpose()?.unwrap_or(0.0);
        Ok(Cell::new(start))
    })
    .property("kind", env.create_string("counter")?)
    .method("increment", |count: &Cell<f64>, args| {
        count.set(count.get() + 1.0);
        args.env().create_number(count.get())
    })
    .getter("count", |count: &Cell<f64>, args| args.env().create_number(count.get()))
    .accessor(
        "value",
        |count: &Cell<f64>, args| args.env().create_number(count.get()),
        |count: &Cell<f64>, value, _args| {
            count.set(value.as_f64()?);
            Ok(())
        },
    )
    .static_value("MAX", env.create_number(100.0)?)
    .static_method("zero", |args| args.env().create_number(0.0))
    .build(env)
}

#[test]
fn test_constructed_instances_wrap_native_state() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = counter_class(env)?;
            let counter = class.construct(&[env.create_number(5.0)?])?;
            assert_eq!(counter.scope_id(), root.id());

            let increment = counter.get_named("increment")?;
            assert_eq!(increment.call(&counter, &[])?.as_f64()?, 6.0);
            assert_eq!(increment.call(&counter, &[])?.as_f64()?, 7.0);
            assert_eq!(counter.get_named("count")?.as_f64()?, 7.0);
            assert_eq!(counter.with_wrapped(|count: &Cell<f64>| count.get())?, 7.0);

            counter.set_named("value", env.create_number(1.0)?)?;
            assert_eq!(counter.get_named("count")?.as_f64()?, 1.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_instances_share_the_prototype() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = counter_class(env)?;
            let first = class.construct(&[])?;
            let second = class.construct(&[env.create_number(10.0)?])?;

            assert_eq!(first.get_named("kind")?.as_string()?, "counter");
            assert!(first.get_named("increment")?.strict_equals(&second.get_named("increment")?)?);
            assert!(first.get_named("constructor")?.strict_equals(&class)?);

            // Each instance keeps its own state
            assert_eq!(first.get_named("count")?.as_f64()?, 0.0);
            assert_eq!(second.get_named("count")?.as_f64()?, 10.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_static_members_live_on_the_constructor() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = counter_class(env)?;
            assert_eq!(class.get_named("MAX")?.as_f64()?, 100.0);
            let zero = class.get_named("zero")?;
            assert_eq!(zero.call(&class, &[])?.as_f64()?, 0.0);

            let instance = class.construct(&[])?;
            assert!(instance.get_named("MAX")?.is_undefined()?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_constructor_requires_new() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = counter_class(env)?;
            let undefined = env.get_undefined()?;
            let err = class.call(&undefined, &[]).unwrap_err();
            assert!(err.is_pending_exception());

            let exception = env.take_exception()?.expect("constructor threw");
            assert_eq!(exception.get_named("code")?.as_string()?, "ERR_TYPE_MISMATCH");
            assert!(!env.is_exception_pending()?);
            Ok(())
        })
        .unwrap();
}

/// Native state that records when it is dropped.
struct Tracked {
    dropped: Rc<Cell<bool>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.set(true);
    }
}

fn tracked_class(env: Env, dropped: Rc<Cell<bool>>) -> napi_bridge::Result<Value> {
    define_class(
        env,
        "Tracked",
        move |_args| {
            Ok(Box::new(Tracked {
                dropped: Rc::clone(&dropped),
            }) as Box<dyn Any>)
        },
        vec![PropertyDescriptor::method("alive", |args| {
            let alive = args.this().with_wrapped(|tracked: &Tracked| !tracked.dropped.get())?;
            args.env().get_boolean(alive)
        })],
    )
}

#[test]
fn test_instances_are_finalized_when_collected() {
    let runtime = create_test_runtime();
    let dropped = Rc::new(Cell::new(false));
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = tracked_class(env, Rc::clone(&dropped))?;
            env.with_scope(|_| {
                let instance = class.construct(&[])?;
                let alive = instance.get_named("alive")?.call(&instance, &[])?;
                assert!(alive.as_bool()?);
                Ok(())
            })?;
            runtime.collect();
            assert!(dropped.get());
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_remove_wrap_transfers_ownership() {
    let runtime = create_test_runtime();
    let dropped = Rc::new(Cell::new(false));
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = tracked_class(env, Rc::clone(&dropped))?;
            let instance = class.construct(&[])?;

            let tracked = instance.remove_wrap::<Tracked>()?;
            assert!(!tracked.dropped.get());
            let err = instance.with_wrapped(|_: &Tracked| ()).unwrap_err();
            assert_eq!(err.native_status(), Some(Status::InvalidArg));

            drop(tracked);
            assert!(dropped.get());
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_wrapped_type_is_checked() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = counter_class(env)?;
            let counter = class.construct(&[])?;
            let err = counter.with_wrapped(|_: &String| ()).unwrap_err();
            assert!(matches!(err, BridgeError::TypeMismatch { .. }));
            let err = counter.remove_wrap::<String>().unwrap_err();
            assert!(matches!(err, BridgeError::TypeMismatch { .. }));

            // The failed removal left the instance intact
            assert_eq!(counter.get_named("count")?.as_f64()?, 0.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_class_pins_are_counted() {
    let runtime = create_test_runtime();
    let env = runtime.env();
    let base = pinned_count(env);
    runtime
        .with_scope(|root| {
            let env = root.env();
            let class = counter_class(env)?;
            // constructor, increment, count, value, zero
            assert_eq!(pinned_count(env), base + 5);
            class.construct(&[])?;
            assert_eq!(pinned_count(env), base + 6);
            Ok(())
        })
        .unwrap();
    runtime.collect();
    assert_eq!(pinned_count(env), base);
}
