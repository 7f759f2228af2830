//! Prelude module shared by the bridge and the reference host.
//!
//! Re-exports the collection types used across the crate so every module
//! reaches for the same hasher.

pub use core::{
    cell::{Cell, RefCell},
    ffi::{c_char, c_void},
    marker::PhantomData,
    ptr,
};

pub use std::rc::Rc;

// FxHashMap/FxHashSet - rustc-hash for small integer keys
pub use rustc_hash::{FxHashMap, FxHashSet};

// ═══════════════════════════════════════════════════════════════════════════════
// IndexMap - insertion-ordered maps with FxHasher
// ═══════════════════════════════════════════════════════════════════════════════

pub type IndexMap<K, V> =
    indexmap::IndexMap<K, V, core::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Create an empty IndexMap
#[inline]
pub fn index_map_new<K, V>() -> IndexMap<K, V> {
    IndexMap::with_hasher(Default::default())
}
