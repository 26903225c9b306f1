//! The authoritative device repository.
//!
//! All engine mutations funnel through the conditional operations here: a
//! replace or remove succeeds only if the stored device is the exact
//! instance the caller read. There are no per-device locks; learn and sweep
//! restart on a failed condition.

use crate::device::{Device, DeviceKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Key → device table with compare-and-swap mutation semantics.
#[derive(Default)]
pub struct DeviceTable {
    devices: DashMap<DeviceKey, Arc<Device>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        DeviceTable {
            devices: DashMap::new(),
        }
    }

    /// Looks up the current device for `key`.
    pub fn get(&self, key: DeviceKey) -> Option<Arc<Device>> {
        self.devices.get(&key).map(|r| r.value().clone())
    }

    /// Inserts `device` unless `key` is already bound. Returns true on
    /// insert.
    pub fn insert_if_absent(&self, key: DeviceKey, device: Arc<Device>) -> bool {
        match self.devices.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(device);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Replaces the device bound to `key` only if it is still `expected`.
    /// The condition is instance identity, not structural equality; the
    /// engine never republishes an equal-but-distinct instance.
    pub fn replace(&self, key: DeviceKey, expected: &Arc<Device>, device: Arc<Device>) -> bool {
        match self.devices.entry(key) {
            Entry::Occupied(mut slot) => {
                if Arc::ptr_eq(slot.get(), expected) {
                    slot.insert(device);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Removes the binding for `key` only if it is still `expected`.
    pub fn remove(&self, key: DeviceKey, expected: &Arc<Device>) -> bool {
        self.devices
            .remove_if(&key, |_, current| Arc::ptr_eq(current, expected))
            .is_some()
    }

    /// Snapshot of the live devices. The snapshot is consistent per entry,
    /// not across entries.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
