//! Process-wide type descriptor cache.
//!
//! Descriptors are pure metadata: built once per Rust type on first use and
//! shared read-only by every connection afterwards.

use crate::object::BackendObject;
use dashmap::DashMap;
use objsync_protocol::TypeDescriptor;
use std::any::TypeId;
use std::sync::{Arc, OnceLock};

static DESCRIPTORS: OnceLock<DashMap<TypeId, Arc<TypeDescriptor>>> = OnceLock::new();

fn cache() -> &'static DashMap<TypeId, Arc<TypeDescriptor>> {
    DESCRIPTORS.get_or_init(DashMap::new)
}

/// Returns the cached descriptor of `T`, building it on first use.
pub fn descriptor_of<T: BackendObject>() -> Arc<TypeDescriptor> {
    let key = TypeId::of::<T>();
    if let Some(found) = cache().get(&key) {
        return found.clone();
    }
    // Built outside the shard lock; a racing builder produces the same value.
    let built = Arc::new(T::describe());
    cache().entry(key).or_insert(built).clone()
}

/// Number of types described so far in this process.
pub fn cached_types() -> usize {
    cache().len()
}
