//! Tests for scope tagging, nesting and value liveness

use napi_bridge::scope::{self, ScopeKind, ValueScope};
use napi_bridge::{BridgeError, ValueType};

use super::create_test_runtime;

#[test]
fn test_values_are_tagged_with_innermost_scope() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let outer = env.create_number(1.0)?;
            assert_eq!(outer.scope_id(), root.id());

            let inner = ValueScope::open(env)?;
            let value = env.create_number(2.0)?;
            assert_eq!(value.scope_id(), inner.id());
            assert_eq!(inner.parent(), Some(root.id()));
            assert_eq!(inner.kind(), ScopeKind::Handle);
            assert!(inner.is_current());
            inner.close()?;

            assert!(!value.is_live());
            assert!(outer.is_live());
            assert_eq!(outer.as_f64()?, 1.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_closed_scope_values_are_rejected() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;
            let stale = env.with_scope(|_| env.create_string("temporary"))?;

            assert!(matches!(stale.as_string(), Err(BridgeError::InvalidScope)));
            assert!(matches!(stale.value_type(), Err(BridgeError::InvalidScope)));
            assert!(matches!(
                object.set_named("field", stale),
                Err(BridgeError::InvalidScope)
            ));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_scope_depth_follows_nesting() {
    let runtime = create_test_runtime();
    assert_eq!(runtime.scope_depth().unwrap(), 0);
    runtime
        .with_scope(|root| {
            let env = root.env();
            let base = scope::depth();
            assert_eq!(runtime.scope_depth().unwrap(), 1);

            let handle = ValueScope::open(env)?;
            let escapable = ValueScope::open_escapable(env)?;
            assert_eq!(scope::depth(), base + 2);
            assert_eq!(runtime.scope_depth().unwrap(), 3);
            assert_eq!(scope::current(), Some(escapable.id()));

            escapable.close()?;
            handle.close()?;
            assert_eq!(scope::depth(), base);
            assert_eq!(runtime.scope_depth().unwrap(), 1);
            Ok(())
        })
        .unwrap();
    assert_eq!(runtime.scope_depth().unwrap(), 0);
}

#[test]
fn test_handles_are_released_on_close() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let before = runtime.handle_count().unwrap();
            env.with_scope(|_| {
                for i in 0..50 {
                    env.create_number(f64::from(i))?;
                }
                assert!(runtime.handle_count().unwrap() >= before + 50);
                Ok(())
            })?;
            assert_eq!(runtime.handle_count().unwrap(), before);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_dropping_a_scope_closes_it() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let value = {
                let _scope = ValueScope::open(env)?;
                env.get_boolean(true)?
            };
            assert!(!value.is_live());
            assert_eq!(scope::current(), Some(root.id()));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_objects_survive_collection_while_in_scope() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;
            object.set_named("answer", env.create_number(42.0)?)?;

            // Churn enough scopes to trigger collections
            for _ in 0..10 {
                env.with_scope(|_| env.create_object().map(|_| ()))?;
            }
            runtime.collect();

            assert_eq!(object.value_type()?, ValueType::Object);
            assert_eq!(object.get_named("answer")?.as_f64()?, 42.0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_values_from_another_scope_stack_are_not_current() {
    let first = create_test_runtime();
    let second = create_test_runtime();
    first
        .with_scope(|_| {
            // Values for `second` need a scope opened for `second`
            let err = second.env().create_number(1.0);
            assert!(matches!(err, Err(BridgeError::InvalidScope)));
            Ok(())
        })
        .unwrap();
}
