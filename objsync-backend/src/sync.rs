//! Reclamation epochs.
//!
//! An epoch starts with SYNC and ends with the consumer's matching
//! SYNC_ACK. Only one epoch is in flight at a time. Removal decisions are
//! made when the epoch ends, against the structural references snapshotted
//! when it began.

use crate::config::SyncConfig;
use crate::error::BackendError;
use crate::object::ObjectHandle;
use crate::registry::Registry;
use std::time::Instant;

/// Epoch bookkeeping of one connection.
#[derive(Debug)]
pub struct SyncState {
    serial: u64,
    in_flight: Option<u64>,
    last_completed: Instant,
}

impl SyncState {
    pub fn new(now: Instant) -> Self {
        Self {
            serial: 0,
            in_flight: None,
            last_completed: now,
        }
    }

    /// Serial of the epoch awaiting its acknowledgement.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Serial of the most recently started epoch.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether a new epoch should start now.
    pub fn is_due(&self, registry: &Registry, config: &SyncConfig, now: Instant) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        registry.created_since_sync() > config.object_threshold
            || (registry.has_pending_release()
                && now.duration_since(self.last_completed) >= config.sync_interval())
    }

    /// When the interval trigger next allows an epoch.
    pub fn interval_deadline(&self, config: &SyncConfig) -> Instant {
        self.last_completed + config.sync_interval()
    }

    /// Starts an epoch and returns its serial, or `None` if one is in flight.
    pub fn begin(&mut self, registry: &mut Registry) -> Option<u64> {
        if self.in_flight.is_some() {
            return None;
        }
        registry.begin_epoch();
        self.serial += 1;
        self.in_flight = Some(self.serial);
        Some(self.serial)
    }

    /// Ends the epoch acknowledged by `serial`, returning the removed objects.
    pub fn complete(
        &mut self,
        registry: &mut Registry,
        serial: u64,
        now: Instant,
    ) -> Result<Vec<ObjectHandle>, BackendError> {
        if self.in_flight != Some(serial) {
            return Err(BackendError::SyncSerialMismatch {
                expected: self.in_flight,
                actual: serial,
            });
        }
        self.in_flight = None;
        self.last_completed = now;
        Ok(registry.end_epoch(now))
    }
}
