//! Persistent references that outlive value scopes.

use tracing::{trace, warn};

use crate::env::Env;
use crate::error::{BridgeError, Result};
use crate::ffi::{napi_ref, napi_value};
use crate::prelude::*;
use crate::value::Value;

/// A handle to a host object that survives scope closure.
///
/// A strong reference keeps the object alive; a weak one lets the
/// collector reclaim it, after which [`Reference::get_value`] yields
/// `None`. The native reference is released exactly once, either by
/// [`Reference::release`] or on drop.
pub struct Reference {
    env: Env,
    raw: Option<napi_ref>,
    weak: bool,
}

impl Reference {
    /// Create a reference to `value`, strong unless `weak` is set.
    pub fn new(value: &Value, weak: bool) -> Result<Reference> {
        let env = value.env();
        let target = value.raw()?;
        let mut raw: napi_ref = ptr::null_mut();
        let initial = if weak { 0 } else { 1 };
        env.call(|api| unsafe { (api.create_reference)(env.raw(), target, initial, &mut raw) })?;
        trace!(reference = ?raw, weak, "reference created");
        Ok(Reference {
            env,
            raw: Some(raw),
            weak,
        })
    }

    pub fn strong(value: &Value) -> Result<Reference> {
        Self::new(value, false)
    }

    pub fn weak(value: &Value) -> Result<Reference> {
        Self::new(value, true)
    }

    pub fn env(&self) -> Env {
        self.env
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_none()
    }

    fn handle(&self) -> Result<napi_ref> {
        self.raw.ok_or(BridgeError::ReferenceReleased)
    }

    /// Drop the count to zero so the target becomes collectable. Idempotent.
    pub fn make_weak(&mut self) -> Result<()> {
        let raw = self.handle()?;
        if self.weak {
            return Ok(());
        }
        let mut count = 0u32;
        self.env
            .call(|api| unsafe { (api.reference_unref)(self.env.raw(), raw, &mut count) })?;
        self.weak = true;
        Ok(())
    }

    /// Raise the count to one so the target stays alive. Idempotent.
    pub fn make_strong(&mut self) -> Result<()> {
        let raw = self.handle()?;
        if !self.weak {
            return Ok(());
        }
        let mut count = 0u32;
        self.env
            .call(|api| unsafe { (api.reference_ref)(self.env.raw(), raw, &mut count) })?;
        self.weak = false;
        Ok(())
    }

    /// Materialize the target in the current scope.
    ///
    /// Returns `None` when a weak reference's target was collected.
    pub fn get_value(&self) -> Result<Option<Value>> {
        let raw = self.handle()?;
        let value = self.env.create_value(|api, out| unsafe {
            (api.get_reference_value)(self.env.raw(), raw, out)
        })?;
        // The host reports a collected target as a null handle
        let handle: napi_value = value.raw()?;
        Ok((!handle.is_null()).then_some(value))
    }

    /// Release the native reference now.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(raw) = self.raw.take() else {
            return Ok(());
        };
        trace!(reference = ?raw, "reference released");
        self.env
            .call(|api| unsafe { (api.delete_reference)(self.env.raw(), raw) })
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(%err, "failed to release reference");
        }
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("raw", &self.raw)
            .field("weak", &self.weak)
            .finish()
    }
}
