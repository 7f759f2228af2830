//! Tests for function trampolines: argument marshaling, results, closure
//! state and re-entrant calls

use std::cell::Cell;
use std::rc::Rc;

use napi_bridge::host::{HostError, HostRuntime};
use napi_bridge::{BridgeError, create_function, pinned_count};
use serde_json::json;

use super::create_test_runtime;

fn load_math(runtime: &HostRuntime) {
    runtime
        .load(|_scope, exports| {
            let env = exports.env();
            let add = create_function(env, "add", |args| {
                let sum = args.arg(0)?.as_f64()? + args.arg(1)?.as_f64()?;
                args.env().create_number(sum)
            })?;
            exports.set_named("add", add)?;

            let arity = create_function(env, "arity", |args| {
                args.env().create_number(args.len() as f64)
            })?;
            exports.set_named("arity", arity)?;

            let echo = create_function(env, "echo", |args| args.arg(0))?;
            exports.set_named("echo", echo)
        })
        .unwrap();
}

#[test]
fn test_arguments_and_result() {
    let runtime = create_test_runtime();
    load_math(&runtime);
    let sum = runtime.call_export("add", &[json!(2), json!(3.5)]).unwrap();
    assert_eq!(sum, json!(5.5));
}

#[test]
fn test_missing_arguments_read_as_undefined() {
    let runtime = create_test_runtime();
    load_math(&runtime);
    assert_eq!(runtime.call_export("arity", &[]).unwrap(), json!(0.0));
    assert_eq!(
        runtime.call_export("arity", &[json!(1), json!(2), json!(3)]).unwrap(),
        json!(3.0)
    );
    assert_eq!(runtime.call_export("echo", &[]).unwrap(), json!(null));

    // add(1) reads undefined for the second operand
    let err = runtime.call_export("add", &[json!(1)]).unwrap_err();
    assert!(matches!(err, HostError::Exception { code: Some(code), .. } if code == "ERR_TYPE_MISMATCH"));
}

fn load_ordered(runtime: &HostRuntime) {
    runtime
        .load(|_scope, exports| {
            let env = exports.env();
            let subtract = create_function(env, "subtract", |args| {
                let difference = args.arg(0)?.as_f64()? - args.arg(1)?.as_f64()?;
                args.env().create_number(difference)
            })?;
            exports.set_named("subtract", subtract)?;

            // Joins the first three slots, marking absent ones
            let join = create_function(env, "join", |args| {
                let mut parts = Vec::new();
                for index in 0..3 {
                    let value = args.arg(index)?;
                    if value.is_undefined()? {
                        parts.push("_".to_string());
                    } else {
                        parts.push(value.as_string()?);
                    }
                }
                args.env().create_string(&parts.join(","))
            })?;
            exports.set_named("join", join)
        })
        .unwrap();
}

#[test]
fn test_arguments_arrive_in_order() {
    let runtime = create_test_runtime();
    load_ordered(&runtime);
    assert_eq!(
        runtime.call_export("subtract", &[json!(10), json!(4)]).unwrap(),
        json!(6.0)
    );
    assert_eq!(
        runtime.call_export("subtract", &[json!(4), json!(10)]).unwrap(),
        json!(-6.0)
    );
    assert_eq!(
        runtime
            .call_export("join", &[json!("a"), json!("b"), json!("c")])
            .unwrap(),
        json!("a,b,c")
    );
    // Extra arguments beyond the slots read are ignored
    assert_eq!(
        runtime
            .call_export("join", &[json!("c"), json!("b"), json!("a"), json!("z")])
            .unwrap(),
        json!("c,b,a")
    );
}

#[test]
fn test_short_calls_pad_with_undefined() {
    let runtime = create_test_runtime();
    load_ordered(&runtime);
    assert_eq!(runtime.call_export("join", &[json!("x")]).unwrap(), json!("x,_,_"));
    assert_eq!(runtime.call_export("join", &[]).unwrap(), json!("_,_,_"));

    runtime
        .with_scope(|root| {
            let env = root.env();
            let seen = create_function(env, "seen", |args| {
                let env = args.env();
                assert_eq!(args.len(), 1);
                assert!(args.get(1).is_none());
                assert!(args.arg(1)?.is_undefined()?);
                env.create_number(args.len() as f64)
            })?;
            let undefined = env.get_undefined()?;
            let count = seen.call(&undefined, &[env.create_string("only")?])?;
            assert_eq!(count.as_f64()?, 1.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_arguments_pass_through_unchanged() {
    let runtime = create_test_runtime();
    load_math(&runtime);
    let input = json!({ "name": "widget", "sizes": [1.0, 2.0] });
    let output = runtime.call_export("echo", &[input]).unwrap();
    assert_eq!(output["name"], json!("widget"));
    assert_eq!(output["sizes"]["1"], json!(2.0));
}

#[test]
fn test_receiver_is_the_exports_object() {
    let runtime = create_test_runtime();
    runtime
        .load(|_scope, exports| {
            let env = exports.env();
            exports.set_named("tag", env.create_string("exports")?)?;
            let whoami = create_function(env, "whoami", |args| args.this().get_named("tag"))?;
            exports.set_named("whoami", whoami)
        })
        .unwrap();
    assert_eq!(runtime.call_export("whoami", &[]).unwrap(), json!("exports"));
}

#[test]
fn test_closures_keep_state_between_calls() {
    let runtime = create_test_runtime();
    let calls = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&calls);
    runtime
        .load(move |_scope, exports| {
            let next = create_function(exports.env(), "next", move |args| {
                counter.set(counter.get() + 1);
                args.env().create_number(f64::from(counter.get()))
            })?;
            exports.set_named("next", next)
        })
        .unwrap();

    for expected in 1..=3 {
        let value = runtime.call_export("next", &[]).unwrap();
        assert_eq!(value, json!(f64::from(expected)));
    }
    assert_eq!(calls.get(), 3);
}

#[test]
fn test_plain_calls_have_no_new_target() {
    let runtime = create_test_runtime();
    runtime
        .load(|_scope, exports| {
            let constructed = create_function(exports.env(), "constructed", |args| {
                let constructed = args.new_target()?.is_some();
                args.env().get_boolean(constructed)
            })?;
            exports.set_named("constructed", constructed)
        })
        .unwrap();
    assert_eq!(runtime.call_export("constructed", &[]).unwrap(), json!(false));
}

#[test]
fn test_callbacks_can_reenter_the_host() {
    let runtime = create_test_runtime();
    runtime
        .load(|_scope, exports| {
            let env = exports.env();
            let double = create_function(env, "double", |args| {
                args.env().create_number(args.arg(0)?.as_f64()? * 2.0)
            })?;
            exports.set_named("double", double)?;

            // quadruple(x) = double(double(x)), looked up through `this`
            let quadruple = create_function(env, "quadruple", |args| {
                let env = args.env();
                let double = args.this().get_named("double")?;
                let once = double.call(&args.this(), &[args.arg(0)?])?;
                let twice = env.with_escapable_scope(|_| double.call(&args.this(), &[once]))?;
                assert_eq!(twice.scope_id(), args.scope().id());
                Ok(twice)
            })?;
            exports.set_named("quadruple", quadruple)
        })
        .unwrap();
    assert_eq!(runtime.call_export("quadruple", &[json!(1.5)]).unwrap(), json!(6.0));
    assert_eq!(runtime.scope_depth().unwrap(), 0);
}

#[test]
fn test_functions_are_callable_from_managed_code() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let greet = create_function(env, "greet", |args| {
                let name = args.arg(0)?.as_string()?;
                args.env().create_string(&format!("hello, {name}"))
            })?;
            let undefined = env.get_undefined()?;
            let result = greet.call(&undefined, &[env.create_string("bridge")?])?;
            assert_eq!(result.scope_id(), root.id());
            assert_eq!(result.as_string()?, "hello, bridge");
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_function_pins_are_released_by_collection() {
    let runtime = create_test_runtime();
    let env = runtime.env();
    let base = pinned_count(env);
    runtime
        .with_scope(|root| {
            root.env().with_scope(|scope| {
                create_function(scope.env(), "transient", |args| args.env().get_null())?;
                assert_eq!(pinned_count(env), base + 1);
                Ok(())
            })
        })
        .unwrap();
    runtime.collect();
    assert_eq!(pinned_count(env), base);
}

/// Sets its flag when dropped.
struct DropFlag(Rc<Cell<bool>>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn test_runtime_drop_releases_remaining_closures() {
    let runtime = create_test_runtime();
    let dropped = Rc::new(Cell::new(false));
    let flag = DropFlag(Rc::clone(&dropped));
    runtime
        .load(move |_scope, exports| {
            let held = create_function(exports.env(), "held", move |args| {
                let _ = &flag;
                args.env().get_null()
            })?;
            exports.set_named("held", held)
        })
        .unwrap();
    runtime.collect();
    assert_eq!(pinned_count(runtime.env()), 1);
    assert!(!dropped.get());

    drop(runtime);
    assert!(dropped.get());
}

#[test]
fn test_stale_function_values_are_rejected() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let stale = env.with_scope(|_| create_function(env, "gone", |args| args.env().get_null()))?;
            let undefined = env.get_undefined()?;
            assert!(matches!(stale.call(&undefined, &[]), Err(BridgeError::InvalidScope)));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_returned_receiver_and_arguments_reach_the_caller() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let first = create_function(env, "first", |args| args.arg(0))?;
            let receiver = create_function(env, "receiver", |args| Ok(args.this()))?;

            let this = env.create_object()?;
            this.set_named("tag", env.create_string("receiver")?)?;
            let argument = env.create_string("argument")?;

            let returned = first.call(&this, &[argument])?;
            assert_eq!(returned.scope_id(), root.id());
            assert_eq!(returned.as_string()?, "argument");

            let returned = receiver.call(&this, &[])?;
            assert_eq!(returned.scope_id(), root.id());
            assert!(returned.strict_equals(&this)?);
            runtime.collect();
            assert_eq!(returned.get_named("tag")?.as_string()?, "receiver");
            Ok(())
        })
        .unwrap();
}
