//! Primary and secondary device indices.
//!
//! Indices map projections of entity fields (an [`EntityKey`]) to device
//! keys so lookups avoid full-table scans. They are updated optimistically,
//! outside the repository's atomic swap: a learn attempt that swapped the
//! repository but loses the index update fails as a whole and retries, and
//! cleanup re-derives index membership from a device's surviving entities
//! instead of keeping reference counts.

use crate::device::{Device, DeviceKey};
use crate::entity::{DeviceField, Entity, FieldSet};
use dashmap::{DashMap, DashSet};
use hosttrack_types::{MacAddress, SwitchPort, VlanId};
use std::net::Ipv4Addr;

/// The projection of an entity onto one index's key fields.
///
/// Fields outside the schema are normalized away so that equal projections
/// hash equally regardless of what else the entity carried. An absent VLAN
/// inside the schema is a real key value (untagged), not a missing one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    fields: FieldSet,
    mac: Option<MacAddress>,
    vlan: Option<VlanId>,
    ipv4: Option<Ipv4Addr>,
    port: Option<SwitchPort>,
}

impl EntityKey {
    /// Projects `entity` onto `fields`.
    pub fn new(fields: FieldSet, entity: &Entity) -> Self {
        Self::from_parts(
            fields,
            Some(entity.mac()),
            entity.vlan(),
            entity.ipv4(),
            entity.port(),
        )
    }

    /// Builds a key from loose query fields.
    pub fn from_parts(
        fields: FieldSet,
        mac: Option<MacAddress>,
        vlan: Option<VlanId>,
        ipv4: Option<Ipv4Addr>,
        port: Option<SwitchPort>,
    ) -> Self {
        EntityKey {
            fields,
            mac: if fields.contains(DeviceField::Mac) {
                mac
            } else {
                None
            },
            vlan: if fields.contains(DeviceField::Vlan) {
                vlan
            } else {
                None
            },
            ipv4: if fields.contains(DeviceField::Ipv4) {
                ipv4
            } else {
                None
            },
            port: if fields.contains(DeviceField::Port) {
                port
            } else {
                None
            },
        }
    }

    /// Returns true if every schema field that requires a value has one.
    pub fn is_complete(&self) -> bool {
        for field in self.fields.iter() {
            let present = match field {
                DeviceField::Mac => self.mac.is_some(),
                DeviceField::Vlan => true,
                DeviceField::Ipv4 => self.ipv4.is_some(),
                DeviceField::Port => self.port.is_some(),
            };
            if !present {
                return false;
            }
        }
        true
    }
}

/// Common contract of the unique and multi indices.
pub trait DeviceIndex: Send + Sync {
    /// The key fields this index is built over.
    fn key_fields(&self) -> FieldSet;

    /// Exact lookup. Only meaningful on a unique index; a multi index
    /// reports nothing here.
    fn find_by_entity(&self, entity: &Entity) -> Option<DeviceKey>;

    /// Candidate lookup by (possibly partial) entity fields.
    fn query_by_entity(&self, entity: &Entity) -> Vec<DeviceKey>;

    /// Every device key the index knows about.
    fn all_keys(&self) -> Vec<DeviceKey>;

    /// Indexes every qualifying entity of `device` under `key`. Returns
    /// false if a different device already owns one of the projections,
    /// which aborts the caller's learn attempt.
    fn update_device(&self, device: &Device, key: DeviceKey) -> bool;

    /// Indexes a single entity under `key`, overwriting any prior owner.
    fn update_entity(&self, entity: &Entity, key: DeviceKey);

    /// Drops the index entry for `entity` unless one of the device's
    /// `remaining` entities projects onto the same key. Membership is
    /// re-derived from the live entity set, never counted.
    fn remove_entity_if_needed(&self, entity: &Entity, key: DeviceKey, remaining: &[Entity]);
}

/// Index enforcing one device per key projection; used for the primary
/// index and per-class identity indices.
pub struct DeviceUniqueIndex {
    key_fields: FieldSet,
    index: DashMap<EntityKey, DeviceKey>,
}

impl DeviceUniqueIndex {
    pub fn new(key_fields: FieldSet) -> Self {
        DeviceUniqueIndex {
            key_fields,
            index: DashMap::new(),
        }
    }
}

impl DeviceIndex for DeviceUniqueIndex {
    fn key_fields(&self) -> FieldSet {
        self.key_fields
    }

    fn find_by_entity(&self, entity: &Entity) -> Option<DeviceKey> {
        let key = EntityKey::new(self.key_fields, entity);
        if !key.is_complete() {
            return None;
        }
        self.index.get(&key).map(|r| *r.value())
    }

    fn query_by_entity(&self, entity: &Entity) -> Vec<DeviceKey> {
        self.find_by_entity(entity).into_iter().collect()
    }

    fn all_keys(&self) -> Vec<DeviceKey> {
        self.index.iter().map(|r| *r.value()).collect()
    }

    fn update_device(&self, device: &Device, key: DeviceKey) -> bool {
        for entity in device.entities() {
            let ek = EntityKey::new(self.key_fields, entity);
            if !ek.is_complete() {
                continue;
            }
            match self.index.entry(ek) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(key);
                }
                dashmap::mapref::entry::Entry::Occupied(slot) => {
                    if *slot.get() != key {
                        // Another device owns this projection; the caller
                        // lost a race and must restart.
                        return false;
                    }
                }
            }
        }
        true
    }

    fn update_entity(&self, entity: &Entity, key: DeviceKey) {
        let ek = EntityKey::new(self.key_fields, entity);
        if ek.is_complete() {
            self.index.insert(ek, key);
        }
    }

    fn remove_entity_if_needed(&self, entity: &Entity, key: DeviceKey, remaining: &[Entity]) {
        let ek = EntityKey::new(self.key_fields, entity);
        if !ek.is_complete() {
            return;
        }
        for other in remaining {
            if EntityKey::new(self.key_fields, other) == ek {
                return;
            }
        }
        self.index.remove_if(&ek, |_, owner| *owner == key);
    }
}

/// Index mapping a (possibly partial) key projection to the set of devices
/// exhibiting it; used for secondary lookups such as "find by IP".
pub struct DeviceMultiIndex {
    key_fields: FieldSet,
    index: DashMap<EntityKey, DashSet<DeviceKey>>,
}

impl DeviceMultiIndex {
    pub fn new(key_fields: FieldSet) -> Self {
        DeviceMultiIndex {
            key_fields,
            index: DashMap::new(),
        }
    }

    /// Candidate lookup by loose query fields.
    pub fn query_by_parts(
        &self,
        mac: Option<MacAddress>,
        vlan: Option<VlanId>,
        ipv4: Option<Ipv4Addr>,
        port: Option<SwitchPort>,
    ) -> Vec<DeviceKey> {
        let key = EntityKey::from_parts(self.key_fields, mac, vlan, ipv4, port);
        match self.index.get(&key) {
            Some(set) => set.iter().map(|k| *k).collect(),
            None => Vec::new(),
        }
    }
}

impl DeviceIndex for DeviceMultiIndex {
    fn key_fields(&self) -> FieldSet {
        self.key_fields
    }

    fn find_by_entity(&self, _entity: &Entity) -> Option<DeviceKey> {
        None
    }

    fn query_by_entity(&self, entity: &Entity) -> Vec<DeviceKey> {
        let key = EntityKey::new(self.key_fields, entity);
        match self.index.get(&key) {
            Some(set) => set.iter().map(|k| *k).collect(),
            None => Vec::new(),
        }
    }

    fn all_keys(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<DeviceKey> = self
            .index
            .iter()
            .flat_map(|r| r.value().iter().map(|k| *k).collect::<Vec<_>>())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    fn update_device(&self, device: &Device, key: DeviceKey) -> bool {
        for entity in device.entities() {
            self.update_entity(entity, key);
        }
        true
    }

    fn update_entity(&self, entity: &Entity, key: DeviceKey) {
        let ek = EntityKey::new(self.key_fields, entity);
        if !ek.is_complete() {
            return;
        }
        self.index.entry(ek).or_default().insert(key);
    }

    fn remove_entity_if_needed(&self, entity: &Entity, key: DeviceKey, remaining: &[Entity]) {
        let ek = EntityKey::new(self.key_fields, entity);
        if !ek.is_complete() {
            return;
        }
        for other in remaining {
            if EntityKey::new(self.key_fields, other) == ek {
                return;
            }
        }
        if let Some(set) = self.index.get(&ek) {
            set.remove(&key);
        }
        self.index.remove_if(&ek, |_, set| set.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{DefaultEntityClass, DEFAULT_KEY_FIELDS};
    use hosttrack_types::NodeId;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn entity(mac: u64, vlan: Option<u16>, ipv4: Option<[u8; 4]>) -> Entity {
        Entity::new(
            MacAddress::from_u64(mac),
            vlan.map(|v| VlanId::new(v).unwrap()),
            ipv4.map(Ipv4Addr::from),
            Some(SwitchPort::new(NodeId::new(1), 1)),
            Some(0),
        )
    }

    const IP_FIELDS: FieldSet = FieldSet::of(&[DeviceField::Ipv4]);

    #[test]
    fn test_unique_index_round_trip() {
        let index = DeviceUniqueIndex::new(DEFAULT_KEY_FIELDS);
        let e = entity(0xa, Some(10), None);
        index.update_entity(&e, 7);
        assert_eq!(index.find_by_entity(&e), Some(7));

        // Same (MAC, VLAN) key regardless of other fields.
        let e2 = entity(0xa, Some(10), Some([10, 0, 0, 1]));
        assert_eq!(index.find_by_entity(&e2), Some(7));

        // Different VLAN is a different key.
        assert_eq!(index.find_by_entity(&entity(0xa, Some(20), None)), None);
    }

    #[test]
    fn test_unique_index_conflict_detected() {
        let index = DeviceUniqueIndex::new(DEFAULT_KEY_FIELDS);
        let e = entity(0xa, None, None);
        index.update_entity(&e, 1);

        let device = Device::new(2, e, Arc::new(DefaultEntityClass));
        assert!(!index.update_device(&device, 2));
        // The same owner is never a conflict.
        let device1 = Device::new(1, entity(0xa, None, None), Arc::new(DefaultEntityClass));
        assert!(index.update_device(&device1, 1));
    }

    #[test]
    fn test_unique_index_incomplete_key_skipped() {
        let fields = FieldSet::of(&[DeviceField::Mac, DeviceField::Ipv4]);
        let index = DeviceUniqueIndex::new(fields);
        let no_ip = entity(0xa, None, None);
        index.update_entity(&no_ip, 3);
        assert_eq!(index.find_by_entity(&no_ip), None);
    }

    #[test]
    fn test_remove_entity_rederives_from_remaining() {
        let index = DeviceMultiIndex::new(IP_FIELDS);
        let e1 = entity(0xa, None, Some([10, 0, 0, 1]));
        let e2 = entity(0xb, None, Some([10, 0, 0, 1]));
        index.update_entity(&e1, 5);

        // Another remaining entity still projects to 10.0.0.1: entry stays.
        index.remove_entity_if_needed(&e1, 5, std::slice::from_ref(&e2));
        assert_eq!(index.query_by_entity(&e1), vec![5]);

        // No remaining entity covers the key anymore: entry goes.
        index.remove_entity_if_needed(&e1, 5, &[]);
        assert!(index.query_by_entity(&e1).is_empty());
    }

    #[test]
    fn test_unique_remove_only_when_owner_matches() {
        let index = DeviceUniqueIndex::new(DEFAULT_KEY_FIELDS);
        let e = entity(0xa, None, None);
        index.update_entity(&e, 9);
        // A stale deleter for a different owner must not clobber the entry.
        index.remove_entity_if_needed(&e, 4, &[]);
        assert_eq!(index.find_by_entity(&e), Some(9));
        index.remove_entity_if_needed(&e, 9, &[]);
        assert_eq!(index.find_by_entity(&e), None);
    }

    #[test]
    fn test_multi_index_partial_query() {
        let index = DeviceMultiIndex::new(IP_FIELDS);
        index.update_entity(&entity(0xa, None, Some([10, 0, 0, 1])), 1);
        index.update_entity(&entity(0xb, None, Some([10, 0, 0, 1])), 2);

        let mut keys = index.query_by_parts(None, None, Some(Ipv4Addr::new(10, 0, 0, 1)), None);
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2]);
        assert!(index
            .query_by_parts(None, None, Some(Ipv4Addr::new(10, 0, 0, 2)), None)
            .is_empty());
    }
}
