//! Tests for module loading and exports

use napi_bridge::ffi::{napi_env, napi_value};
use napi_bridge::host::{HostConfig, HostError, HostRuntime};
use napi_bridge::{BridgeError, create_function, init_module};
use serde_json::json;

use super::create_test_runtime;

unsafe extern "C" fn register_greeter(env: napi_env, exports: napi_value) -> napi_value {
    unsafe {
        init_module(env, exports, |_scope, exports| {
            let env = exports.env();
            exports.set_named("greeting", env.create_string("hello")?)?;
            let greet = create_function(env, "greet", |args| {
                let name = args.arg(0)?.as_string()?;
                args.env().create_string(&format!("hello, {name}"))
            })?;
            exports.set_named("greet", greet)
        })
    }
}

#[test]
fn test_raw_registration_entry_point() {
    let runtime = create_test_runtime();
    unsafe { runtime.load_module(register_greeter) }.unwrap();
    assert_eq!(runtime.get_export("greeting").unwrap(), json!("hello"));
    assert_eq!(
        runtime.call_export("greet", &[json!("world")]).unwrap(),
        json!("hello, world")
    );
    assert_eq!(runtime.scope_depth().unwrap(), 0);
}

#[test]
fn test_init_failure_becomes_exception() {
    let runtime = create_test_runtime();
    let err = runtime
        .load(|_scope, _exports| Err(BridgeError::invalid_operation("bad init")))
        .unwrap_err();
    match err {
        HostError::Exception { code, message } => {
            assert_eq!(code.as_deref(), Some("ERR_INVALID_OPERATION"));
            assert!(message.contains("bad init"), "{message}");
        }
        other => panic!("expected an exception, got {other:?}"),
    }
    assert!(!runtime.is_exception_pending().unwrap());
    assert_eq!(runtime.scope_depth().unwrap(), 0);
}

#[test]
fn test_init_panic_is_contained() {
    let runtime = create_test_runtime();
    let err = runtime
        .load(|_scope, _exports| -> napi_bridge::Result<()> { panic!("init exploded") })
        .unwrap_err();
    assert!(
        matches!(&err, HostError::Exception { message, .. } if message.contains("init exploded")),
        "{err}"
    );
    assert_eq!(napi_bridge::scope::depth(), 0);
}

#[test]
fn test_missing_and_non_callable_exports() {
    let runtime = create_test_runtime();
    assert!(matches!(
        runtime.call_export("anything", &[]),
        Err(HostError::MissingExport(_))
    ));

    runtime
        .load(|_scope, exports| exports.set_named("answer", exports.env().create_number(42.0)?))
        .unwrap();
    assert!(matches!(
        runtime.get_export("question"),
        Err(HostError::MissingExport(name)) if name == "question"
    ));
    assert!(matches!(
        runtime.call_export("answer", &[]),
        Err(HostError::NotCallable(name)) if name == "answer"
    ));
}

#[test]
fn test_exports_survive_collection() {
    let runtime = create_test_runtime();
    runtime
        .load(|_scope, exports| {
            let env = exports.env();
            let nested = env.create_object()?;
            nested.set_named("depth", env.create_number(1.0)?)?;
            exports.set_named("nested", nested)
        })
        .unwrap();
    runtime.collect();

    assert_eq!(runtime.get_export("nested").unwrap(), json!({ "depth": 1.0 }));
    let stats = runtime.stats().unwrap();
    assert!(stats.live_objects >= 3, "{stats:?}");
}

#[test]
fn test_config_from_json() {
    let config = HostConfig::from_json(r#"{ "gc_threshold": 0, "max_scope_depth": 8 }"#).unwrap();
    let runtime = HostRuntime::with_config(config.clone()).unwrap();
    assert_eq!(runtime.config().unwrap(), config);

    // Automatic collection is off: unreachable objects stay until asked
    runtime
        .with_scope(|root| root.env().with_scope(|scope| scope.env().create_object().map(|_| ())))
        .unwrap();
    let before = runtime.stats().unwrap().live_objects;
    runtime.collect();
    assert!(runtime.stats().unwrap().live_objects < before);
}

#[test]
fn test_scope_depth_limit_is_reported() {
    let config = HostConfig {
        max_scope_depth: 3,
        ..HostConfig::default()
    };
    let runtime = HostRuntime::with_config(config).unwrap();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let first = napi_bridge::ValueScope::open(env)?;
            let second = napi_bridge::ValueScope::open(env)?;
            let err = napi_bridge::ValueScope::open(env).unwrap_err();
            assert!(err.to_string().contains("depth limit"), "{err}");
            second.close()?;
            first.close()
        })
        .unwrap();
}
