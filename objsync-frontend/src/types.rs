//! Per-connection type descriptor cache.
//!
//! The owning side sends each descriptor in full once and elides it
//! afterwards, so every full descriptor seen on the wire is remembered.

use objsync_protocol::{TypeDescriptor, TypeRef};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct TypeCache {
    types: HashMap<String, Arc<TypeDescriptor>>,
}

impl TypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches a full descriptor, replacing any earlier one of the same name.
    pub fn insert(&mut self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.types
            .insert(descriptor.name.clone(), descriptor.clone());
        descriptor
    }

    pub fn get(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.types.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns the effective descriptor of a reference's type.
    ///
    /// An elided type missing from the cache is a peer bug; the object is
    /// still usable, just without properties, methods or signals.
    pub fn resolve(&mut self, type_ref: Option<&TypeRef>) -> Arc<TypeDescriptor> {
        match type_ref {
            Some(TypeRef::Full(descriptor)) => match self.types.get(&descriptor.name) {
                Some(cached) if cached.as_ref() == descriptor => cached.clone(),
                _ => self.insert(descriptor.clone()),
            },
            Some(TypeRef::Omitted(omitted)) => match self.types.get(&omitted.name) {
                Some(cached) => cached.clone(),
                None => {
                    tracing::warn!(
                        "Expected cached type description for {} to create object",
                        omitted.name
                    );
                    Arc::new(TypeDescriptor::empty(omitted.name.clone()))
                }
            },
            None => {
                tracing::warn!("Object reference without a type");
                Arc::new(TypeDescriptor::empty(""))
            }
        }
    }
}
