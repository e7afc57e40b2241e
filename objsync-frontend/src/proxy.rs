//! Local proxies of remote objects.
//!
//! A [`Proxy`] is a reference counted handle. The connection's table only
//! holds weak entries, so when the application drops the last handle the
//! proxy queues its release. The connection sends OBJECT_DEREF for it later,
//! and only if the table still maps the identifier to that very instance: a
//! dying proxy may already have been replaced by a fresh one.

use crate::error::FrontendError;
use crate::value::Value;
use objsync_protocol::{ObjectId, TypeDescriptor};
use serde_json::{Map, Value as Json};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Callback attached to a signal or change notification.
pub type SignalHandler = Rc<dyn Fn(&[Value])>;

/// Identifies a connected handler for [`Proxy::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Releases queued by dropped proxies: identifier and instance serial.
#[derive(Debug, Default)]
pub(crate) struct ReleaseQueue {
    released: RefCell<Vec<(ObjectId, u64)>>,
}

impl ReleaseQueue {
    fn push(&self, identifier: ObjectId, serial: u64) {
        self.released.borrow_mut().push((identifier, serial));
    }

    fn take(&self) -> Vec<(ObjectId, u64)> {
        std::mem::take(&mut *self.released.borrow_mut())
    }
}

struct ProxyState {
    data: Option<Map<String, Json>>,
    waiting_for_data: bool,
    handlers: HashMap<String, Vec<(HandlerId, SignalHandler)>>,
    next_handler: u64,
}

pub(crate) struct ProxyInner {
    identifier: ObjectId,
    descriptor: Arc<TypeDescriptor>,
    serial: u64,
    instantiated: bool,
    state: RefCell<ProxyState>,
    releases: Rc<ReleaseQueue>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        self.releases.push(self.identifier.clone(), self.serial);
    }
}

/// Handle to a remote object.
#[derive(Clone)]
pub struct Proxy {
    inner: Rc<ProxyInner>,
}

impl Proxy {
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.inner.descriptor
    }

    pub fn type_name(&self) -> &str {
        &self.inner.descriptor.name
    }

    /// Whether this object was constructed by this side with OBJECT_CREATE.
    pub fn is_instantiated(&self) -> bool {
        self.inner.instantiated
    }

    /// Whether a property snapshot has been received.
    pub fn has_data(&self) -> bool {
        self.inner.state.borrow().data.is_some()
    }

    /// Raw cached value of a property, without resolving object references.
    pub fn cached_property(&self, name: &str) -> Option<Json> {
        self.inner
            .state
            .borrow()
            .data
            .as_ref()
            .and_then(|data| data.get(name).cloned())
    }

    pub fn ptr_eq(&self, other: &Proxy) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attaches `handler` to a signal or to a `<property>Changed`
    /// notification. Fails with [`FrontendError::UnknownSignal`] if the type
    /// declares neither.
    ///
    /// Handlers are owned by the proxy; a handler capturing a handle to its
    /// own proxy keeps it alive forever.
    pub fn connect(
        &self,
        signal: &str,
        handler: impl Fn(&[Value]) + 'static,
    ) -> Result<HandlerId, FrontendError> {
        if !self.accepts(signal) {
            return Err(FrontendError::UnknownSignal {
                type_name: self.type_name().to_string(),
                signal: signal.to_string(),
            });
        }
        let mut state = self.inner.state.borrow_mut();
        let id = HandlerId(state.next_handler);
        state.next_handler += 1;
        state
            .handlers
            .entry(signal.to_string())
            .or_default()
            .push((id, Rc::new(handler)));
        Ok(id)
    }

    /// Detaches a handler. Returns whether it was connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut state = self.inner.state.borrow_mut();
        for handlers in state.handlers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(h, _)| *h == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    fn accepts(&self, signal: &str) -> bool {
        let descriptor = &self.inner.descriptor;
        if descriptor.signal(signal).is_some() {
            return true;
        }
        signal
            .strip_suffix("Changed")
            .is_some_and(|property| descriptor.property(property).is_some())
    }

    pub(crate) fn set_waiting_for_data(&self, waiting: bool) {
        self.inner.state.borrow_mut().waiting_for_data = waiting;
    }

    /// Replaces the property snapshot. Returns the declared properties whose
    /// value changed, or nothing when the snapshot answers this side's own
    /// blocking query: nobody could have read the old values.
    pub(crate) fn reset_data(&self, data: Map<String, Json>) -> Vec<String> {
        let mut state = self.inner.state.borrow_mut();
        let previous = state.data.replace(data);
        if state.waiting_for_data {
            return Vec::new();
        }
        let Some(current) = state.data.as_ref() else {
            return Vec::new();
        };
        self.inner
            .descriptor
            .properties
            .iter()
            .filter(|p| match &previous {
                Some(old) => old.get(&p.name) != current.get(&p.name),
                None => current.contains_key(&p.name),
            })
            .map(|p| p.name.clone())
            .collect()
    }

    /// Calls every handler connected to `signal`.
    pub(crate) fn deliver(&self, signal: &str, args: &[Value]) {
        // Cloned out so handlers may connect or disconnect while running.
        let handlers: Vec<SignalHandler> = match self.inner.state.borrow().handlers.get(signal) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in handlers {
            handler(args);
        }
    }

    fn serial(&self) -> u64 {
        self.inner.serial
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("identifier", &self.identifier())
            .field("type", &self.type_name())
            .finish()
    }
}

struct Entry {
    proxy: Weak<ProxyInner>,
    serial: u64,
}

/// Identifier to proxy table of one connection.
pub(crate) struct ProxyTable {
    entries: HashMap<ObjectId, Entry>,
    releases: Rc<ReleaseQueue>,
    next_serial: u64,
}

impl Default for ProxyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            releases: Rc::new(ReleaseQueue::default()),
            next_serial: 1,
        }
    }

    /// Number of identifiers mapped, including proxies whose release is
    /// still queued.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the live proxy for `identifier`.
    pub fn live(&self, identifier: &str) -> Option<Proxy> {
        let entry = self.entries.get(identifier)?;
        entry.proxy.upgrade().map(|inner| Proxy { inner })
    }

    /// Creates a proxy for `identifier`, replacing any dying instance.
    pub fn insert(
        &mut self,
        identifier: &str,
        descriptor: Arc<TypeDescriptor>,
        instantiated: bool,
    ) -> Proxy {
        if self.entries.contains_key(identifier) {
            tracing::debug!(
                "Replacing proxy {} because the existing instance is being released",
                identifier
            );
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        let proxy = Proxy {
            inner: Rc::new(ProxyInner {
                identifier: identifier.to_string(),
                descriptor,
                serial,
                instantiated,
                state: RefCell::new(ProxyState {
                    data: None,
                    waiting_for_data: false,
                    handlers: HashMap::new(),
                    next_handler: 1,
                }),
                releases: self.releases.clone(),
            }),
        };
        self.entries.insert(
            identifier.to_string(),
            Entry {
                proxy: Rc::downgrade(&proxy.inner),
                serial: proxy.serial(),
            },
        );
        proxy
    }

    /// Drains queued releases, returning the identifiers to dereference.
    pub fn take_releases(&mut self) -> Vec<ObjectId> {
        let mut released = Vec::new();
        for (identifier, serial) in self.releases.take() {
            match self.entries.get(&identifier) {
                Some(entry) if entry.serial == serial => {
                    self.entries.remove(&identifier);
                    released.push(identifier);
                }
                Some(_) => {
                    tracing::debug!(
                        "Ignoring release of {}: a newer proxy replaced it",
                        identifier
                    );
                }
                None => {
                    tracing::warn!("Releasing proxy {} which isn't in the table", identifier);
                }
            }
        }
        released
    }
}
