//! Tests for property descriptor marshaling

use std::cell::Cell;
use std::rc::Rc;

use napi_bridge::callback::Callback;
use napi_bridge::{
    CallbackArgs, PropertyAttributes, PropertyDescriptor, PropertyKey, Status, ValueType,
    define_properties, pinned_count, to_native_descriptors,
};
use serde_json::json;

use super::create_test_runtime;

#[test]
fn test_values_and_methods_on_exports() {
    let runtime = create_test_runtime();
    runtime
        .load(|_scope, exports| {
            let env = exports.env();
            define_properties(
                &exports,
                vec![
                    PropertyDescriptor::value("name", env.create_string("bridge")?),
                    PropertyDescriptor::value("version", env.create_number(2.0)?),
                    PropertyDescriptor::method("describe", |args| {
                        let this = args.this();
                        let name = this.get_named("name")?.as_string()?;
                        let version = this.get_named("version")?.as_f64()?;
                        args.env().create_string(&format!("{name} v{version}"))
                    }),
                ],
            )
        })
        .unwrap();

    assert_eq!(runtime.get_export("version").unwrap(), json!(2.0));
    assert_eq!(runtime.get_export("describe").unwrap(), json!("[Function: describe]"));
    assert_eq!(runtime.call_export("describe", &[]).unwrap(), json!("bridge v2"));
}

#[test]
fn test_accessors_route_reads_and_writes() {
    let runtime = create_test_runtime();
    let level = Rc::new(Cell::new(1.0));
    runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;

            let read = Rc::clone(&level);
            let getter: Box<Callback> =
                Box::new(move |args: &CallbackArgs<'_>| args.env().create_number(read.get()));
            let write = Rc::clone(&level);
            let setter: Box<Callback> = Box::new(move |args: &CallbackArgs<'_>| {
                write.set(args.arg(0)?.as_f64()?);
                args.env().get_undefined()
            });
            define_properties(
                &object,
                vec![PropertyDescriptor::accessor("level", Some(getter), Some(setter))],
            )?;

            assert_eq!(object.get_named("level")?.as_f64()?, 1.0);
            object.set_named("level", env.create_number(4.0)?)?;
            assert_eq!(object.get_named("level")?.as_f64()?, 4.0);
            Ok(())
        })
        .unwrap();
    assert_eq!(level.get(), 4.0);
}

#[test]
fn test_getter_without_setter_ignores_writes() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;
            object.set_named("raw", env.create_number(10.0)?)?;
            define_properties(
                &object,
                vec![PropertyDescriptor::getter("doubled", |args| {
                    let raw = args.this().get_named("raw")?.as_f64()?;
                    args.env().create_number(raw * 2.0)
                })],
            )?;

            assert_eq!(object.get_named("doubled")?.as_f64()?, 20.0);
            object.set_named("doubled", env.create_number(1.0)?)?;
            assert_eq!(object.get_named("doubled")?.as_f64()?, 20.0);

            object.set_named("raw", env.create_number(3.0)?)?;
            assert_eq!(object.get_named("doubled")?.as_f64()?, 6.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_read_only_values_keep_their_value() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;
            define_properties(
                &object,
                vec![
                    PropertyDescriptor::value("fixed", env.create_number(1.0)?)
                        .with_attributes(PropertyAttributes::ENUMERABLE),
                ],
            )?;
            object.set_named("fixed", env.create_number(2.0)?)?;
            assert_eq!(object.get_named("fixed")?.as_f64()?, 1.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_value_keys_name_properties() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;
            let key = env.create_string("dynamic")?;
            let symbol = env.create_symbol("hidden")?;
            define_properties(
                &object,
                vec![
                    PropertyDescriptor::value(PropertyKey::from(key), env.get_boolean(true)?),
                    PropertyDescriptor::value(symbol, env.get_boolean(false)?),
                ],
            )?;
            assert!(object.get_named("dynamic")?.as_bool()?);
            assert_eq!(object.get_named("hidden")?.value_type()?, ValueType::Undefined);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_one_pin_per_callback_descriptor() {
    let runtime = create_test_runtime();
    let env = runtime.env();
    let base = pinned_count(env);
    runtime
        .with_scope(|root| {
            let env = root.env();
            let native = to_native_descriptors(
                env,
                vec![
                    PropertyDescriptor::value("plain", env.get_null()?),
                    PropertyDescriptor::method("run", |args| args.env().get_null()),
                    PropertyDescriptor::getter("size", |args| args.env().create_number(0.0)),
                    PropertyDescriptor::accessor("empty", None, None),
                ],
            )?;
            assert_eq!(native.len(), 4);
            assert_eq!(native.pinned_len(), 2);
            assert_eq!(pinned_count(env), base + 2);

            // Unattached pins are released with the batch
            drop(native);
            assert_eq!(pinned_count(env), base);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_rejected_batch_releases_its_pins() {
    let runtime = create_test_runtime();
    let env = runtime.env();
    let base = pinned_count(env);
    runtime
        .with_scope(|root| {
            let env = root.env();
            let number = env.create_number(1.0)?;
            let err = define_properties(
                &number,
                vec![PropertyDescriptor::method("run", |args| args.env().get_null())],
            )
            .unwrap_err();
            assert_eq!(err.native_status(), Some(Status::ObjectExpected));
            assert_eq!(pinned_count(env), base);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_descriptor_pins_follow_their_target() {
    let runtime = create_test_runtime();
    let env = runtime.env();
    let base = pinned_count(env);
    runtime
        .with_scope(|root| {
            let env = root.env();
            env.with_scope(|_| {
                let object = env.create_object()?;
                define_properties(
                    &object,
                    vec![
                        PropertyDescriptor::method("a", |args| args.env().get_null()),
                        PropertyDescriptor::method("b", |args| args.env().get_null()),
                    ],
                )?;
                assert_eq!(pinned_count(env), base + 2);
                Ok(())
            })
        })
        .unwrap();
    runtime.collect();
    assert_eq!(pinned_count(env), base);
}
