//! Registry of managed payloads whose address was handed to the host.
//!
//! A pinned payload stays at a fixed heap address until the finalizer
//! attached to its owning host object releases it. The host only ever sees
//! an opaque `data` pointer carrying the entry's id. Ids are never reused,
//! so a stale pointer cannot name a payload pinned later at the same
//! address; trampolines map it back through [`resolve`], which refuses ids
//! that are not live entries.

use std::any::Any;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::callback::CallbackClosure;
use crate::env::Env;
use crate::error::Result;
use crate::ffi::release_pinned;
use crate::prelude::*;
use crate::value::Value;

/// Payload kept alive on behalf of the host.
pub(crate) enum Pinned {
    Closure(CallbackClosure),
    Instance(Box<dyn Any>),
}

/// Opaque key of a pinned payload. Equal to the `data` pointer handed to the host.
///
/// The pointer is an id, not an address, and never points at the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinnedHandle(usize);

impl PinnedHandle {
    pub fn from_ptr(data: *mut c_void) -> PinnedHandle {
        PinnedHandle(data as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    env: usize,
    /// Address from `Box::into_raw`
    payload: usize,
}

/// Live id -> entry.
fn table() -> &'static Mutex<FxHashMap<usize, Entry>> {
    static TABLE: OnceLock<Mutex<FxHashMap<usize, Entry>>> = OnceLock::new();
    TABLE.get_or_init(Default::default)
}

fn next_id() -> usize {
    // Zero would be a null data pointer
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn pin(env: Env, payload: Pinned) -> PinnedHandle {
    let id = next_id();
    let entry = Entry {
        env: env.raw() as usize,
        payload: Box::into_raw(Box::new(payload)) as usize,
    };
    table().lock().insert(id, entry);
    trace!(handle = id, "payload pinned");
    PinnedHandle(id)
}

/// Borrow the payload behind a data pointer.
///
/// # Safety
/// The caller must make sure the entry is not released while the returned
/// borrow is alive. Trampolines satisfy this because the host keeps the
/// owning object reachable for the duration of the call.
pub(crate) unsafe fn resolve<'a>(data: *mut c_void) -> Option<&'a Pinned> {
    let entry = *table().lock().get(&(data as usize))?;
    // SAFETY: live entries hold an address produced by Box::into_raw in `pin`
    Some(unsafe { &*(entry.payload as *const Pinned) })
}

/// Remove an entry and hand back its payload without dropping it.
pub(crate) fn take(handle: PinnedHandle) -> Option<Pinned> {
    let entry = table().lock().remove(&handle.0)?;
    // SAFETY: the entry was live, so its address came from Box::into_raw and has not been freed
    Some(*unsafe { Box::from_raw(entry.payload as *mut Pinned) })
}

/// Drop the payload behind `handle`. Returns false for unknown handles.
pub(crate) fn release(handle: PinnedHandle) -> bool {
    // The table lock is released before the payload drops
    match take(handle) {
        Some(payload) => {
            drop(payload);
            debug!(handle = handle.0, "pinned payload released");
            true
        }
        None => false,
    }
}

/// Number of payloads currently pinned for `env`.
pub fn pinned_count(env: Env) -> usize {
    let owner = env.raw() as usize;
    table()
        .lock()
        .values()
        .filter(|entry| entry.env == owner)
        .count()
}

// ============================================================================
// PinGuard
// ============================================================================

/// Pins that have not yet been handed to a host finalizer.
///
/// Anything still held when the guard drops is released, so a failed
/// registration never leaks its closures.
#[derive(Default)]
pub(crate) struct PinGuard {
    handles: Vec<PinnedHandle>,
}

impl PinGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, handle: PinnedHandle) {
        self.handles.push(handle);
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn handles(&self) -> &[PinnedHandle] {
        &self.handles
    }

    /// Attach one release finalizer per pin to `owner`.
    ///
    /// Each pin leaves the guard once the host accepted its finalizer.
    pub(crate) fn attach_to(mut self, owner: &Value) -> Result<()> {
        let env = owner.env();
        let raw = owner.raw()?;
        while let Some(&handle) = self.handles.last() {
            env.call(|api| unsafe {
                (api.add_finalizer)(
                    env.raw(),
                    raw,
                    handle.as_ptr(),
                    Some(release_pinned),
                    ptr::null_mut(),
                    ptr::null_mut(),
                )
            })?;
            self.handles.pop();
        }
        Ok(())
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            if !release(handle) {
                warn!(handle = handle.0, "pending pin was already released");
            }
        }
    }
}
