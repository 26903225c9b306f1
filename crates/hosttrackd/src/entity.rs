//! Observed host identities and the field sets that index them.
//!
//! An [`Entity`] is one identity sample extracted from an observed packet:
//! source MAC, optional VLAN tag, optional IPv4 sender address, the ingress
//! port, and when it was seen. Entities are immutable except for the
//! last-seen timestamp, which may be refreshed in place (it never
//! participates in equality, ordering, or index membership).

use hosttrack_types::{MacAddress, SwitchPort, VlanId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sentinel stored in the timestamp slot when no observation time is known.
const NO_TIMESTAMP: i64 = i64::MIN;

/// One field of an [`Entity`] that can participate in an index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceField {
    Mac,
    Vlan,
    Ipv4,
    Port,
}

impl DeviceField {
    const ALL: [DeviceField; 4] = [
        DeviceField::Mac,
        DeviceField::Vlan,
        DeviceField::Ipv4,
        DeviceField::Port,
    ];

    const fn bit(self) -> u8 {
        match self {
            DeviceField::Mac => 0b0001,
            DeviceField::Vlan => 0b0010,
            DeviceField::Ipv4 => 0b0100,
            DeviceField::Port => 0b1000,
        }
    }
}

impl fmt::Display for DeviceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceField::Mac => "MAC",
            DeviceField::Vlan => "VLAN",
            DeviceField::Ipv4 => "IPV4",
            DeviceField::Port => "PORT",
        };
        write!(f, "{}", s)
    }
}

/// A small set of [`DeviceField`]s, used both as an index-key schema and as
/// the change set attached to CHANGE events.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FieldSet(u8);

impl FieldSet {
    /// The empty field set.
    pub const EMPTY: FieldSet = FieldSet(0);

    /// Builds a field set from a slice of fields.
    pub const fn of(fields: &[DeviceField]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < fields.len() {
            bits |= fields[i].bit();
            i += 1;
        }
        FieldSet(bits)
    }

    /// Returns this set with `field` added.
    pub const fn with(self, field: DeviceField) -> Self {
        FieldSet(self.0 | field.bit())
    }

    /// Returns this set with `field` removed.
    pub const fn without(self, field: DeviceField) -> Self {
        FieldSet(self.0 & !field.bit())
    }

    /// Returns true if `field` is a member of this set.
    pub const fn contains(self, field: DeviceField) -> bool {
        self.0 & field.bit() != 0
    }

    /// Returns the union of the two sets.
    pub const fn union(self, other: FieldSet) -> Self {
        FieldSet(self.0 | other.0)
    }

    /// Returns true if the set has no members.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the number of members.
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates the members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = DeviceField> {
        DeviceField::ALL
            .into_iter()
            .filter(move |f| self.contains(*f))
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, "}}")
    }
}

/// One observed (MAC, VLAN, IPv4, port, timestamp) identity sample.
pub struct Entity {
    mac: MacAddress,
    vlan: Option<VlanId>,
    ipv4: Option<Ipv4Addr>,
    port: Option<SwitchPort>,
    // Millis since epoch; refreshed in place. Excluded from Eq/Ord/Hash.
    last_seen: AtomicI64,
}

impl Entity {
    /// Creates a new entity sample.
    pub fn new(
        mac: MacAddress,
        vlan: Option<VlanId>,
        ipv4: Option<Ipv4Addr>,
        port: Option<SwitchPort>,
        last_seen: Option<i64>,
    ) -> Self {
        Entity {
            mac,
            vlan,
            ipv4,
            port,
            last_seen: AtomicI64::new(last_seen.unwrap_or(NO_TIMESTAMP)),
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn vlan(&self) -> Option<VlanId> {
        self.vlan
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4
    }

    pub fn port(&self) -> Option<SwitchPort> {
        self.port
    }

    /// Returns true if the observation carries an ingress port.
    pub fn has_port(&self) -> bool {
        self.port.is_some()
    }

    /// Returns when this entity was last observed, if known.
    pub fn last_seen(&self) -> Option<i64> {
        match self.last_seen.load(AtomicOrdering::Acquire) {
            NO_TIMESTAMP => None,
            ts => Some(ts),
        }
    }

    /// Refreshes the last-seen timestamp in place.
    ///
    /// This is the single sanctioned in-place update on published state: the
    /// timestamp does not participate in index membership, so no repository
    /// swap is needed to record it.
    pub fn refresh_last_seen(&self, last_seen: i64) {
        self.last_seen.store(last_seen, AtomicOrdering::Release);
    }

    fn identity(&self) -> (MacAddress, Option<VlanId>, Option<Ipv4Addr>, Option<SwitchPort>) {
        (self.mac, self.vlan, self.ipv4, self.port)
    }
}

impl Clone for Entity {
    fn clone(&self) -> Self {
        Entity {
            mac: self.mac,
            vlan: self.vlan,
            ipv4: self.ipv4,
            port: self.port,
            last_seen: AtomicI64::new(self.last_seen.load(AtomicOrdering::Acquire)),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for Entity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("mac", &self.mac)
            .field("vlan", &self.vlan)
            .field("ipv4", &self.ipv4)
            .field("port", &self.port)
            .field("last_seen", &self.last_seen())
            .finish()
    }
}

/// Checks whether `entity` carries every field in `key_fields`.
///
/// MAC is always present. An absent VLAN means "untagged", which is a valid
/// key value rather than a missing one, so VLAN never fails the check.
pub fn all_key_fields_present(entity: &Entity, key_fields: FieldSet) -> bool {
    for field in key_fields.iter() {
        match field {
            DeviceField::Mac | DeviceField::Vlan => {}
            DeviceField::Ipv4 => {
                if entity.ipv4().is_none() {
                    return false;
                }
            }
            DeviceField::Port => {
                if entity.port().is_none() {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use hosttrack_types::NodeId;
    use pretty_assertions::assert_eq;

    fn mac(n: u64) -> MacAddress {
        MacAddress::from_u64(n)
    }

    #[test]
    fn test_field_set_membership() {
        let set = FieldSet::of(&[DeviceField::Mac, DeviceField::Vlan]);
        assert!(set.contains(DeviceField::Mac));
        assert!(set.contains(DeviceField::Vlan));
        assert!(!set.contains(DeviceField::Ipv4));
        assert_eq!(set.len(), 2);
        assert_eq!(set.without(DeviceField::Mac).len(), 1);
        assert!(FieldSet::EMPTY.is_empty());
    }

    #[test]
    fn test_field_set_union_and_display() {
        let a = FieldSet::of(&[DeviceField::Ipv4]);
        let b = FieldSet::of(&[DeviceField::Port]);
        let u = a.union(b);
        assert!(u.contains(DeviceField::Ipv4));
        assert!(u.contains(DeviceField::Port));
        assert_eq!(u.to_string(), "{IPV4, PORT}");
    }

    #[test]
    fn test_entity_equality_ignores_timestamp() {
        let a = Entity::new(mac(1), None, None, None, Some(100));
        let b = Entity::new(mac(1), None, None, None, Some(999));
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_entity_ordering_by_identity() {
        let a = Entity::new(mac(1), None, None, None, None);
        let b = Entity::new(mac(1), VlanId::new(5).ok(), None, None, None);
        let c = Entity::new(mac(2), None, None, None, None);
        assert!(a < b); // None vlan sorts before Some
        assert!(b < c);
    }

    #[test]
    fn test_refresh_last_seen() {
        let e = Entity::new(mac(1), None, None, None, None);
        assert_eq!(e.last_seen(), None);
        e.refresh_last_seen(42);
        assert_eq!(e.last_seen(), Some(42));
    }

    #[test]
    fn test_all_key_fields_present() {
        let port = SwitchPort::new(NodeId::new(1), 1);
        let bare = Entity::new(mac(1), None, None, None, None);
        let full = Entity::new(mac(1), None, Some(Ipv4Addr::new(10, 0, 0, 1)), Some(port), None);

        let mac_vlan = FieldSet::of(&[DeviceField::Mac, DeviceField::Vlan]);
        assert!(all_key_fields_present(&bare, mac_vlan));

        let with_ip = mac_vlan.with(DeviceField::Ipv4);
        assert!(!all_key_fields_present(&bare, with_ip));
        assert!(all_key_fields_present(&full, with_ip));

        let with_port = mac_vlan.with(DeviceField::Port);
        assert!(!all_key_fields_present(&bare, with_port));
        assert!(all_key_fields_present(&full, with_port));
    }
}
