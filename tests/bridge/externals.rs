//! Tests for external values carrying managed data

use std::cell::Cell;
use std::rc::Rc;

use napi_bridge::{BridgeError, Status, ValueType, create_function, pinned_count};
use serde_json::json;

use super::create_test_runtime;

struct Settings {
    name: &'static str,
    dropped: Rc<Cell<bool>>,
}

impl Drop for Settings {
    fn drop(&mut self) {
        self.dropped.set(true);
    }
}

#[test]
fn test_external_data_reads_back() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let external = env.create_external(vec![1u8, 2, 3])?;
            assert_eq!(external.value_type()?, ValueType::External);
            assert_eq!(external.with_external(|bytes: &Vec<u8>| bytes.len())?, 3);

            let err = external.with_external(|_: &String| ()).unwrap_err();
            assert!(matches!(err, BridgeError::TypeMismatch { .. }));

            // Ordinary objects carry no external data
            let object = env.create_object()?;
            let err = object.with_external(|_: &Vec<u8>| ()).unwrap_err();
            assert_eq!(err.native_status(), Some(Status::InvalidArg));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_external_pin_is_released_after_collection() {
    let runtime = create_test_runtime();
    let env = runtime.env();
    let base = pinned_count(env);
    let dropped = Rc::new(Cell::new(false));
    runtime
        .with_scope(|root| {
            let env = root.env();
            env.with_scope(|_| {
                env.create_external(Settings {
                    name: "scratch",
                    dropped: Rc::clone(&dropped),
                })?;
                assert_eq!(pinned_count(env), base + 1);
                Ok(())
            })
        })
        .unwrap();
    runtime.collect();
    assert!(dropped.get());
    assert_eq!(pinned_count(env), base);
}

#[test]
fn test_exported_external_stays_reachable() {
    let runtime = create_test_runtime();
    let dropped = Rc::new(Cell::new(false));
    let settings = Settings {
        name: "exported",
        dropped: Rc::clone(&dropped),
    };
    runtime
        .load(move |_scope, exports| {
            let env = exports.env();
            exports.set_named("settings", env.create_external(settings)?)?;
            let name = create_function(env, "name", |args| {
                let settings = args.this().get_named("settings")?;
                let name = settings.with_external(|settings: &Settings| settings.name)?;
                args.env().create_string(name)
            })?;
            exports.set_named("name", name)
        })
        .unwrap();

    runtime.collect();
    assert!(!dropped.get());
    assert_eq!(runtime.get_export("settings").unwrap(), json!("[External]"));
    assert_eq!(runtime.call_export("name", &[]).unwrap(), json!("exported"));

    drop(runtime);
    assert!(dropped.get());
}
