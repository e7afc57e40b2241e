//! Per-connection object registry.
//!
//! Tracks which objects are active on a connection and why they are kept
//! alive: an explicit reference from the consumer (`client_ref`), counted
//! structural references from other objects' properties, the snapshot taken
//! at the start of a sync epoch, having been sent since that epoch began, a
//! grace period, or being a singleton.

use crate::error::BackendError;
use crate::object::{Emitter, LocalEvent, ObjectHandle};
use objsync_protocol::{ObjectId, ObjectRef, TypeDescriptor, TypeRef};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Bookkeeping for one active object.
#[derive(Debug)]
pub struct ObjectRecord {
    pub handle: ObjectHandle,
    /// Explicitly acquired by the consumer.
    pub client_ref: bool,
    /// Number of distinct active parents whose properties embed this object.
    pub structural_refs: usize,
    /// Children embedded in this object's last serialization, with multiplicity.
    pub children: HashMap<ObjectId, usize>,
    /// Structural reference snapshot of the epoch in flight.
    pub sync_pending_ref: bool,
    /// Sent to the consumer since the last SYNC went out. The consumer may
    /// acknowledge that SYNC before it sees the reference.
    pub sent_since_sync: bool,
    /// Removal is deferred until this instant.
    pub grace_until: Instant,
    pub singleton: bool,
}

impl ObjectRecord {
    pub fn sync_ref(&self) -> bool {
        self.structural_refs > 0
    }

    /// Neither the consumer nor another object holds this one.
    pub fn is_unreferenced(&self) -> bool {
        !self.client_ref && !self.sync_ref() && !self.singleton
    }

    pub fn is_removable(&self, now: Instant) -> bool {
        self.is_unreferenced()
            && !self.sync_pending_ref
            && !self.sent_since_sync
            && now >= self.grace_until
    }

    fn refs_changed(&mut self, now: Instant, grace: Duration) {
        if !self.client_ref && self.structural_refs == 0 {
            self.grace_until = now + grace;
        }
    }
}

/// Registry of the objects active on one connection.
pub struct Registry {
    connection: u64,
    records: HashMap<ObjectId, ObjectRecord>,
    known_types: HashSet<String>,
    events: mpsc::UnboundedSender<LocalEvent>,
    grace_period: Duration,
    created_since_sync: usize,
    pending_release: bool,
}

impl Registry {
    pub(crate) fn new(
        connection: u64,
        events: mpsc::UnboundedSender<LocalEvent>,
        grace_period: Duration,
    ) -> Self {
        Self {
            connection,
            records: HashMap::new(),
            known_types: HashSet::new(),
            events,
            grace_period,
            created_since_sync: 0,
            pending_release: false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ObjectHandle> {
        self.records.get(id).map(|r| &r.handle)
    }

    pub fn record(&self, id: &str) -> Option<&ObjectRecord> {
        self.records.get(id)
    }

    /// Objects activated since the counter was last taken.
    pub fn created_since_sync(&self) -> usize {
        self.created_since_sync
    }

    /// Whether some object may become removable at a coming epoch.
    pub fn has_pending_release(&self) -> bool {
        self.pending_release
    }

    /// Activates `handle` on this connection, assigning an id if it never had one.
    ///
    /// Objects keep their id across deactivation, so a removed object that
    /// is serialized again comes back under the same identifier.
    pub fn activate(&mut self, handle: &ObjectHandle, now: Instant) -> Result<ObjectId, BackendError> {
        self.check_claim(handle)?;
        let id = handle.ensure_identifier();
        match self.records.get(&id) {
            Some(record) if record.handle.ptr_eq(handle) => Ok(id),
            Some(_) => Err(BackendError::DuplicateIdentifier { identifier: id }),
            None => {
                self.insert(handle, id.clone(), now);
                Ok(id)
            }
        }
    }

    /// Activates `handle` under a caller-chosen identifier.
    pub fn activate_as(
        &mut self,
        handle: &ObjectHandle,
        id: &str,
        now: Instant,
    ) -> Result<(), BackendError> {
        self.check_claim(handle)?;
        if self.records.contains_key(id) || !handle.assign_identifier(id) {
            return Err(BackendError::DuplicateIdentifier {
                identifier: id.to_string(),
            });
        }
        self.insert(handle, id.to_string(), now);
        Ok(())
    }

    fn check_claim(&self, handle: &ObjectHandle) -> Result<(), BackendError> {
        match handle.bound_connection() {
            Some(connection) if connection != self.connection => Err(BackendError::ForeignObject(
                handle.identifier().unwrap_or_default(),
            )),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, handle: &ObjectHandle, id: ObjectId, now: Instant) {
        let emitter = Emitter::new(id.clone(), handle.descriptor().clone(), self.events.clone());
        self.records.insert(
            id.clone(),
            ObjectRecord {
                handle: handle.clone(),
                client_ref: false,
                structural_refs: 0,
                children: HashMap::new(),
                sync_pending_ref: false,
                sent_since_sync: true,
                grace_until: now + self.grace_period,
                singleton: false,
            },
        );
        self.created_since_sync += 1;
        self.pending_release = true;
        handle.bind(self.connection, emitter);
        tracing::debug!(
            "[conn {}] Activated {} ({})",
            self.connection,
            id,
            handle.type_name()
        );
    }

    /// Produces the wire reference for `handle`, activating it if needed.
    ///
    /// Every reference restarts the grace period of an otherwise
    /// unreferenced object and keeps it through the end of the epoch in
    /// flight. The descriptor is elided once the consumer has acknowledged
    /// the type.
    pub fn reference(&mut self, handle: &ObjectHandle, now: Instant) -> Result<ObjectRef, BackendError> {
        let id = self.activate(handle, now)?;
        let grace = self.grace_period;
        if let Some(record) = self.records.get_mut(&id) {
            record.sent_since_sync = true;
            record.refs_changed(now, grace);
            if record.is_unreferenced() {
                self.pending_release = true;
            }
        }
        let type_ref = self.type_ref(handle.descriptor());
        Ok(ObjectRef::new(id, Some(type_ref)))
    }

    /// Full descriptor until the consumer has acknowledged the type.
    pub fn type_ref(&self, descriptor: &TypeDescriptor) -> TypeRef {
        if self.known_types.contains(&descriptor.name) {
            TypeRef::omitted(descriptor.name.clone())
        } else {
            TypeRef::Full(descriptor.clone())
        }
    }

    /// Records that the consumer holds the named type's descriptor.
    pub fn acknowledge_type(&mut self, name: &str) {
        if !self.known_types.contains(name) {
            self.known_types.insert(name.to_string());
        }
    }

    pub fn is_type_known(&self, name: &str) -> bool {
        self.known_types.contains(name)
    }

    pub fn mark_singleton(&mut self, id: &str) {
        if let Some(record) = self.records.get_mut(id) {
            record.singleton = true;
        }
    }

    /// Sets or clears the consumer's explicit reference. Returns false for
    /// unknown objects.
    pub fn set_client_ref(&mut self, id: &str, referenced: bool, now: Instant) -> bool {
        let grace = self.grace_period;
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.client_ref = referenced;
        if !referenced {
            record.refs_changed(now, grace);
            self.pending_release = true;
        }
        true
    }

    /// Replaces the recorded children of `parent` with those found in its
    /// latest serialization, adjusting the children's structural counts.
    pub fn update_children(&mut self, parent: &str, children: &[ObjectId], now: Instant) {
        let mut current: HashMap<ObjectId, usize> = HashMap::new();
        for child in children {
            *current.entry(child.clone()).or_insert(0) += 1;
        }

        let Some(record) = self.records.get_mut(parent) else {
            return;
        };
        let added: Vec<ObjectId> = current
            .keys()
            .filter(|id| !record.children.contains_key(*id))
            .cloned()
            .collect();
        let previous = std::mem::replace(&mut record.children, current);

        for id in added {
            if let Some(child) = self.records.get_mut(&id) {
                child.structural_refs += 1;
            }
        }
        for id in previous.keys() {
            if !self.records.get(parent).is_some_and(|r| r.children.contains_key(id)) {
                self.release_child(id, now);
            }
        }
    }

    fn release_child(&mut self, id: &str, now: Instant) {
        let grace = self.grace_period;
        if let Some(child) = self.records.get_mut(id) {
            child.structural_refs = child.structural_refs.saturating_sub(1);
            child.refs_changed(now, grace);
            self.pending_release = true;
        }
    }

    /// Snapshots every structural reference for a new epoch. References
    /// sent before this point reach the consumer ahead of the SYNC.
    pub(crate) fn begin_epoch(&mut self) {
        self.created_since_sync = 0;
        for record in self.records.values_mut() {
            record.sync_pending_ref = record.sync_ref();
            record.sent_since_sync = false;
        }
    }

    /// Ends an epoch: removes every object nothing holds any more and
    /// releases the structural edges of objects unreachable from a root.
    ///
    /// Objects held by the snapshot, or sent after the SYNC went out,
    /// survive until the next epoch.
    pub(crate) fn end_epoch(&mut self, now: Instant) -> Vec<ObjectHandle> {
        let mut removed = Vec::new();
        loop {
            let batch: Vec<ObjectId> = self
                .records
                .iter()
                .filter(|(_, r)| r.is_removable(now))
                .map(|(id, _)| id.clone())
                .collect();
            if batch.is_empty() {
                break;
            }
            for id in batch {
                if let Some(handle) = self.remove(&id, now) {
                    removed.push(handle);
                }
            }
        }

        self.release_unreachable(now);
        for record in self.records.values_mut() {
            record.sync_pending_ref = false;
        }
        self.pending_release = self.records.values().any(ObjectRecord::is_unreferenced);
        removed
    }

    /// Drops the children of objects that no root reaches, so that
    /// reference cycles fall to zero and are reclaimed at a later epoch.
    fn release_unreachable(&mut self, now: Instant) {
        let mut reached: HashSet<ObjectId> = HashSet::new();
        let mut stack: Vec<ObjectId> = self
            .records
            .iter()
            .filter(|(_, r)| {
                r.client_ref || r.singleton || r.sent_since_sync || now < r.grace_until
            })
            .map(|(id, _)| id.clone())
            .collect();
        while let Some(id) = stack.pop() {
            if !reached.insert(id.clone()) {
                continue;
            }
            if let Some(record) = self.records.get(&id) {
                stack.extend(
                    record
                        .children
                        .keys()
                        .filter(|child| !reached.contains(*child))
                        .cloned(),
                );
            }
        }

        let unreachable: Vec<ObjectId> = self
            .records
            .iter()
            .filter(|(id, r)| !reached.contains(*id) && !r.children.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for id in unreachable {
            let children = self
                .records
                .get_mut(&id)
                .map(|r| std::mem::take(&mut r.children))
                .unwrap_or_default();
            tracing::debug!(
                "[conn {}] Releasing {} edges of unreachable {}",
                self.connection,
                children.len(),
                id
            );
            for child in children.keys() {
                self.release_child(child, now);
            }
        }
    }

    /// Removes an object, releasing its children and deactivating it.
    pub fn remove(&mut self, id: &str, now: Instant) -> Option<ObjectHandle> {
        let record = self.records.remove(id)?;
        for child in record.children.keys() {
            self.release_child(child, now);
        }
        record.handle.unbind();
        tracing::debug!("[conn {}] Removed {}", self.connection, id);
        Some(record.handle)
    }

    /// Deactivates every object, e.g. when the connection closes.
    pub(crate) fn clear(&mut self) {
        for (_, record) in self.records.drain() {
            record.handle.unbind();
        }
    }
}
