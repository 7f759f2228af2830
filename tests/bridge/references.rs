//! Tests for strong and weak references

use napi_bridge::{Reference, Status};

use super::create_test_runtime;

#[test]
fn test_strong_reference_outlives_its_scope() {
    let runtime = create_test_runtime();
    let reference = runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;
            object.set_named("id", env.create_number(7.0)?)?;
            Reference::strong(&object)
        })
        .unwrap();
    runtime.collect();

    let id = runtime
        .with_scope(|_| {
            let object = reference.get_value()?.expect("strong target is alive");
            object.get_named("id")?.as_f64()
        })
        .unwrap();
    assert_eq!(id, 7.0);
}

#[test]
fn test_weak_reference_clears_after_collection() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let reference = env.with_scope(|_| {
                let object = env.create_object()?;
                let reference = Reference::weak(&object)?;
                assert!(reference.get_value()?.is_some());
                Ok(reference)
            })?;
            runtime.collect();

            assert!(reference.is_weak());
            assert!(reference.get_value()?.is_none());
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_weak_reference_sees_rooted_target() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let object = env.create_object()?;
            let reference = Reference::weak(&object)?;
            runtime.collect();

            let target = reference.get_value()?.expect("target is still in scope");
            assert!(target.strict_equals(&object)?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_toggling_strength() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let mut reference = env.with_scope(|_| Reference::strong(&env.create_object()?))?;
            runtime.collect();
            assert!(reference.get_value()?.is_some());

            reference.make_weak()?;
            reference.make_weak()?;
            assert!(reference.is_weak());
            runtime.collect();
            assert!(reference.get_value()?.is_none());

            // A collected target cannot be revived
            reference.make_strong()?;
            assert!(!reference.is_weak());
            assert!(reference.get_value()?.is_none());
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_release_deletes_native_reference() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let env = root.env();
            let before = runtime.reference_count().unwrap();
            let object = env.create_object()?;
            let first = Reference::strong(&object)?;
            let second = Reference::weak(&object)?;
            assert_eq!(runtime.reference_count().unwrap(), before + 2);

            first.release()?;
            assert_eq!(runtime.reference_count().unwrap(), before + 1);
            drop(second);
            assert_eq!(runtime.reference_count().unwrap(), before);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_primitives_cannot_be_referenced() {
    let runtime = create_test_runtime();
    runtime
        .with_scope(|root| {
            let number = root.env().create_number(3.0)?;
            let err = Reference::strong(&number).unwrap_err();
            assert_eq!(err.native_status(), Some(Status::ObjectExpected));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_reference_outliving_its_runtime_leaves_others_alone() {
    let old_runtime = create_test_runtime();
    let stale = old_runtime
        .with_scope(|root| Reference::strong(&root.env().create_object()?))
        .unwrap();
    drop(old_runtime);

    // A new runtime may land at the old environment's address
    let runtime = create_test_runtime();
    let live = runtime
        .with_scope(|root| {
            let object = root.env().create_object()?;
            object.set_named("kept", root.env().get_boolean(true)?)?;
            Reference::strong(&object)
        })
        .unwrap();
    let before = runtime.reference_count().unwrap();

    // Deleting the stale reference must not touch the new runtime's
    assert!(stale.release().is_err());
    assert_eq!(runtime.reference_count().unwrap(), before);
    runtime.collect();
    let kept = runtime
        .with_scope(|_| {
            let object = live.get_value()?.expect("strong target is alive");
            object.get_named("kept")?.as_bool()
        })
        .unwrap();
    assert!(kept);
}
