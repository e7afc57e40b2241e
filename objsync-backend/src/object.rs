//! Backend objects and their shared handles.
//!
//! Application types implement [`BackendObject`] and are wrapped in an
//! [`Object`]. The wrapper carries the object's identity and its binding to
//! the connection it is active on; the registry only ever sees the erased
//! [`ObjectHandle`].

use crate::error::{BackendError, MethodError};
use crate::types::descriptor_of;
use crate::value::{convert, FromValue, Value};
use objsync_protocol::{ObjectId, TypeDescriptor};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An application type that can be shared with the consuming side.
pub trait BackendObject: Any + Send {
    /// Declares the type's properties, methods and signals.
    ///
    /// Called once per process and cached, see [`descriptor_of`].
    fn describe() -> TypeDescriptor
    where
        Self: Sized;

    /// Returns the current value of a declared property.
    fn read_property(&self, name: &str) -> Option<Value>;

    /// Runs a declared method. Writable properties arrive here through
    /// their `set<Name>` setter.
    fn invoke(&mut self, method: &str, args: Args) -> Result<Vec<Value>, MethodError> {
        let _ = args;
        Err(MethodError::NotImplemented(method.to_string()))
    }

    /// Called when the object becomes active on a connection.
    fn activated(&mut self, emitter: Emitter) {
        let _ = emitter;
    }

    /// Called when the connection removes the object.
    fn deactivated(&mut self) {}
}

struct Binding {
    connection: u64,
    emitter: Emitter,
}

struct ObjectMeta {
    id: Mutex<Option<ObjectId>>,
    descriptor: Arc<TypeDescriptor>,
    binding: Mutex<Option<Binding>>,
}

struct ObjectCell<T: ?Sized> {
    meta: ObjectMeta,
    data: Mutex<T>,
}

/// Typed shared handle to a backend object.
pub struct Object<T: BackendObject> {
    cell: Arc<ObjectCell<T>>,
}

impl<T: BackendObject> Object<T> {
    /// Wraps a value, publishing it under its type's cached descriptor.
    pub fn new(value: T) -> Self {
        Self::with_descriptor(value, descriptor_of::<T>())
    }

    /// Wraps a value under an explicit descriptor, e.g. a renamed one.
    pub fn with_descriptor(value: T, descriptor: Arc<TypeDescriptor>) -> Self {
        Self {
            cell: Arc::new(ObjectCell {
                meta: ObjectMeta {
                    id: Mutex::new(None),
                    descriptor,
                    binding: Mutex::new(None),
                },
                data: Mutex::new(value),
            }),
        }
    }

    /// Locks the object's state.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.cell.data.lock()
    }

    /// Returns the type-erased handle.
    pub fn handle(&self) -> ObjectHandle {
        let cell: Arc<ObjectCell<dyn BackendObject>> = self.cell.clone();
        ObjectHandle { cell }
    }

    /// Identifier, once the object has been activated at least once.
    pub fn identifier(&self) -> Option<ObjectId> {
        self.cell.meta.id.lock().clone()
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.cell.meta.descriptor
    }

    /// Returns whether the object is currently active on a connection.
    pub fn is_active(&self) -> bool {
        self.cell.meta.binding.lock().is_some()
    }

    /// Emitter of the current activation.
    pub fn emitter(&self) -> Option<Emitter> {
        self.cell
            .meta
            .binding
            .lock()
            .as_ref()
            .map(|b| b.emitter.clone())
    }

    /// Announces that a property changed. No-op while inactive.
    pub fn changed(&self, property: &str) {
        if let Some(emitter) = self.emitter() {
            emitter.changed(property);
        }
    }

    /// Re-sends all properties. No-op while inactive.
    pub fn reset_properties(&self) {
        if let Some(emitter) = self.emitter() {
            emitter.reset_properties();
        }
    }

    /// Emits a signal. Dropped silently while inactive.
    pub fn emit(&self, signal: &str, args: Vec<Value>) -> Result<(), BackendError> {
        match self.emitter() {
            Some(emitter) => emitter.emit(signal, args),
            None => Ok(()),
        }
    }
}

impl<T: BackendObject> Clone for Object<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: BackendObject> fmt::Debug for Object<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handle().fmt(f)
    }
}

impl<T: BackendObject> From<Object<T>> for ObjectHandle {
    fn from(object: Object<T>) -> Self {
        object.handle()
    }
}

impl<T: BackendObject> From<&Object<T>> for ObjectHandle {
    fn from(object: &Object<T>) -> Self {
        object.handle()
    }
}

/// Type-erased handle to a backend object.
#[derive(Clone)]
pub struct ObjectHandle {
    cell: Arc<ObjectCell<dyn BackendObject>>,
}

impl ObjectHandle {
    pub fn identifier(&self) -> Option<ObjectId> {
        self.cell.meta.id.lock().clone()
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.cell.meta.descriptor
    }

    pub fn type_name(&self) -> &str {
        &self.cell.meta.descriptor.name
    }

    /// Returns whether both handles refer to the same object.
    pub fn ptr_eq(&self, other: &ObjectHandle) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.cell) as *const (),
            Arc::as_ptr(&other.cell) as *const (),
        )
    }

    /// Returns the identifier, assigning a fresh one on first activation.
    pub(crate) fn ensure_identifier(&self) -> ObjectId {
        self.cell
            .meta
            .id
            .lock()
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// Assigns a caller-chosen identifier. Fails if another one is already set.
    pub(crate) fn assign_identifier(&self, id: &str) -> bool {
        let mut slot = self.cell.meta.id.lock();
        match slot.as_deref() {
            Some(existing) => existing == id,
            None => {
                *slot = Some(id.to_string());
                true
            }
        }
    }

    pub(crate) fn bound_connection(&self) -> Option<u64> {
        self.cell.meta.binding.lock().as_ref().map(|b| b.connection)
    }

    pub(crate) fn bind(&self, connection: u64, emitter: Emitter) {
        *self.cell.meta.binding.lock() = Some(Binding {
            connection,
            emitter: emitter.clone(),
        });
        self.cell.data.lock().activated(emitter);
    }

    pub(crate) fn unbind(&self) {
        self.cell.meta.binding.lock().take();
        self.cell.data.lock().deactivated();
    }

    /// Reads every declared property, in declaration order.
    pub(crate) fn read_properties(&self) -> Vec<(String, Value)> {
        let data = self.cell.data.lock();
        self.cell
            .meta
            .descriptor
            .properties
            .iter()
            .map(|p| (p.name.clone(), data.read_property(&p.name).unwrap_or_default()))
            .collect()
    }

    pub(crate) fn invoke(&self, method: &str, args: Args) -> Result<Vec<Value>, MethodError> {
        self.cell.data.lock().invoke(method, args)
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("identifier", &self.identifier())
            .field("type", &self.type_name())
            .finish()
    }
}

/// Work queued by application code for the connection to carry out.
#[derive(Debug)]
pub(crate) enum LocalEvent {
    Reset {
        identifier: ObjectId,
    },
    Emit {
        identifier: ObjectId,
        signal: String,
        args: Vec<Value>,
    },
}

/// Signal and change notification capability of one active object.
///
/// Handed to [`BackendObject::activated`]. Notifications are queued and
/// sent when the application next drives the connection.
#[derive(Clone)]
pub struct Emitter {
    identifier: ObjectId,
    descriptor: Arc<TypeDescriptor>,
    events: mpsc::UnboundedSender<LocalEvent>,
}

impl Emitter {
    pub(crate) fn new(
        identifier: ObjectId,
        descriptor: Arc<TypeDescriptor>,
        events: mpsc::UnboundedSender<LocalEvent>,
    ) -> Self {
        Self {
            identifier,
            descriptor,
            events,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Queues a signal emission after checking it against the signal table.
    pub fn emit(&self, signal: &str, args: Vec<Value>) -> Result<(), BackendError> {
        let declared = self
            .descriptor
            .signal(signal)
            .ok_or_else(|| BackendError::UnknownSignal {
                type_name: self.descriptor.name.clone(),
                signal: signal.to_string(),
            })?;
        if declared.params.len() != args.len() {
            return Err(BackendError::SignalArity {
                signal: signal.to_string(),
                expected: declared.params.len(),
                actual: args.len(),
            });
        }
        self.send(LocalEvent::Emit {
            identifier: self.identifier.clone(),
            signal: signal.to_string(),
            args,
        });
        Ok(())
    }

    /// Announces that a property changed. All properties are re-sent.
    pub fn changed(&self, property: &str) {
        if self.descriptor.property(property).is_none() {
            tracing::warn!(
                "changed() for undeclared property {} on {}",
                property,
                self.descriptor.name
            );
        }
        self.reset_properties();
    }

    pub fn reset_properties(&self) {
        self.send(LocalEvent::Reset {
            identifier: self.identifier.clone(),
        });
    }

    fn send(&self, event: LocalEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Dropping notification for {}: connection gone", self.identifier);
        }
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// Decoded arguments of one method call.
#[derive(Debug, Clone)]
pub struct Args {
    method: String,
    values: Vec<Value>,
}

impl Args {
    pub fn new(method: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Decodes argument `index`.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, MethodError> {
        match self.values.get(index) {
            Some(value) => convert(index, value),
            None => Err(MethodError::WrongArgumentCount {
                method: self.method.clone(),
                expected: index + 1,
                actual: self.values.len(),
            }),
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
