//! The immutable device aggregate.
//!
//! A [`Device`] is a value object: every mutation (new entity, new
//! attachment point, dropped entities, metadata change) is a pure function
//! returning a fresh instance, and the repository swap is the only side
//! effect that publishes it. Published devices are therefore safe to read
//! from any thread without synchronization.

use crate::attachment::{compare_attachment_points, AttachmentPoint};
use crate::class::EntityClass;
use crate::entity::Entity;
use crate::oracle::TopologyOracle;
use hosttrack_types::{MacAddress, NodeId, SwitchPort, VlanId};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Stable numeric device identifier. Assigned once, never reused.
pub type DeviceKey = u64;

/// Outcome of folding an observed attachment into a device.
pub enum ApUpdate {
    /// Nothing to persist.
    Unchanged,
    /// Attachment bookkeeping changed (timestamps, candidate list) but the
    /// authoritative location did not.
    Refreshed(Device),
    /// The authoritative attachment point changed.
    Moved(Device),
}

/// An aggregated network endpoint: one or more entities sharing a
/// classifier key, plus where the endpoint is attached.
#[derive(Clone)]
pub struct Device {
    key: DeviceKey,
    /// Sorted by entity identity so membership and insertion position come
    /// from one binary search.
    entities: Vec<Entity>,
    /// Current attachment points, at most one per L2 domain.
    attachment_points: Vec<AttachmentPoint>,
    /// Prior/candidate attachment points, kept for resurrection.
    old_aps: Vec<AttachmentPoint>,
    class: Arc<dyn EntityClass>,
    dhcp_client_name: Option<String>,
    static_host: bool,
}

impl Device {
    /// Creates a device from its first observed entity. The caller has
    /// already validated the entity's port as a learnable attachment point.
    pub fn new(key: DeviceKey, entity: Entity, class: Arc<dyn EntityClass>) -> Self {
        let attachment_points = match entity.port() {
            Some(port) => vec![AttachmentPoint::new(port, entity.last_seen().unwrap_or(0))],
            None => Vec::new(),
        };
        Device {
            key,
            entities: vec![entity],
            attachment_points,
            old_aps: Vec::new(),
            class,
            dhcp_client_name: None,
            static_host: false,
        }
    }

    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// The device MAC address. All entities of a device share it, since MAC
    /// is part of every class key.
    pub fn mac(&self) -> MacAddress {
        self.entities[0].mac()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn attachment_points(&self) -> &[AttachmentPoint] {
        &self.attachment_points
    }

    pub fn old_attachment_points(&self) -> &[AttachmentPoint] {
        &self.old_aps
    }

    pub fn entity_class(&self) -> &Arc<dyn EntityClass> {
        &self.class
    }

    pub fn dhcp_client_name(&self) -> Option<&str> {
        self.dhcp_client_name.as_deref()
    }

    pub fn is_static_host(&self) -> bool {
        self.static_host
    }

    /// Distinct VLANs across the device's entities. `None` means untagged.
    pub fn vlans(&self) -> Vec<Option<VlanId>> {
        let mut vlans: Vec<_> = self.entities.iter().map(|e| e.vlan()).collect();
        vlans.sort();
        vlans.dedup();
        vlans
    }

    /// Distinct IPv4 addresses across the device's entities.
    pub fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        let mut ips: Vec<_> = self.entities.iter().filter_map(|e| e.ipv4()).collect();
        ips.sort();
        ips.dedup();
        ips
    }

    /// The authoritative attachment point, when the device has any.
    pub fn primary_attachment_point(&self) -> Option<&AttachmentPoint> {
        self.attachment_points.first()
    }

    /// Returns true if any current attachment point is on `port`.
    pub fn is_attached_to_port(&self, port: &SwitchPort) -> bool {
        self.attachment_points.iter().any(|ap| ap.port() == *port)
    }

    /// Returns true if any current attachment point is on `node`.
    pub fn is_attached_to_node(&self, node: NodeId) -> bool {
        self.attachment_points
            .iter()
            .any(|ap| ap.port().node() == node)
    }

    /// Position of `entity` in the sorted entity list: `Ok(index)` when
    /// present, `Err(insertion_index)` when absent.
    pub fn entity_index(&self, entity: &Entity) -> Result<usize, usize> {
        self.entities.binary_search(entity)
    }

    /// Returns a copy of this device with `entity` inserted at `at` (the
    /// insertion position reported by [`Device::entity_index`]).
    pub fn with_entity(&self, entity: Entity, at: usize) -> Device {
        let mut next = self.clone();
        next.entities.insert(at, entity);
        next
    }

    /// Returns a copy of this device holding only `entities` (already in
    /// sorted order); attachment history and metadata carry over.
    pub fn with_entities(&self, entities: Vec<Entity>) -> Device {
        let mut next = self.clone();
        next.entities = entities;
        next
    }

    /// Returns a copy with the static-host flag set.
    pub fn with_static_host(&self, static_host: bool) -> Device {
        let mut next = self.clone();
        next.static_host = static_host;
        next
    }

    /// Returns a copy with the snooped DHCP client name attached.
    pub fn with_dhcp_client_name(&self, name: Option<String>) -> Device {
        let mut next = self.clone();
        next.dhcp_client_name = name;
        next
    }

    /// Elects the best attachment point per L2 domain.
    fn ap_map(
        aps: &[AttachmentPoint],
        topology: &dyn TopologyOracle,
    ) -> BTreeMap<u64, AttachmentPoint> {
        let mut by_domain: BTreeMap<u64, AttachmentPoint> = BTreeMap::new();
        for ap in aps {
            let domain = topology.l2_domain_id(ap.port().node());
            match by_domain.get(&domain) {
                Some(best)
                    if compare_attachment_points(topology, best, ap) != Ordering::Less => {}
                _ => {
                    by_domain.insert(domain, *ap);
                }
            }
        }
        by_domain
    }

    /// Folds a sighting on `port` at `last_seen` into the attachment state.
    ///
    /// The port may resurrect a prior candidate attachment point, refresh
    /// the current one, or displace it after winning the resolver
    /// comparison. Displacement within one broadcast domain does not count
    /// as a move.
    pub fn update_attachment_point(
        &self,
        port: SwitchPort,
        last_seen: i64,
        topology: &dyn TopologyOracle,
    ) -> ApUpdate {
        let mut new_ap = AttachmentPoint::new(port, last_seen);
        let mut old_aps = self.old_aps.clone();
        let mut resurrected = false;
        if let Some(pos) = old_aps.iter().position(|ap| ap.port() == port) {
            new_ap = old_aps.remove(pos).touched(last_seen);
            resurrected = true;
        }

        let mut by_domain = Self::ap_map(&self.attachment_points, topology);
        if by_domain.is_empty() {
            // The device exists but has no live attachment point; either the
            // host really moved here or its old switch went away. Both count
            // as a move.
            let mut next = self.clone();
            next.attachment_points = vec![new_ap];
            next.old_aps = old_aps;
            return ApUpdate::Moved(next);
        }

        let domain = topology.l2_domain_id(port.node());
        let current = match by_domain.get(&domain) {
            Some(current) => *current,
            None => {
                // First sighting in this L2 domain.
                by_domain.insert(domain, new_ap);
                let mut next = self.clone();
                next.attachment_points = by_domain.into_values().collect();
                next.old_aps = old_aps;
                return ApUpdate::Moved(next);
            }
        };

        if current.same_port(&new_ap) {
            let refreshed = current.touched(last_seen);
            if refreshed == current && old_aps == self.old_aps {
                return ApUpdate::Unchanged;
            }
            by_domain.insert(domain, refreshed);
            let mut next = self.clone();
            next.attachment_points = by_domain.into_values().collect();
            next.old_aps = old_aps;
            return ApUpdate::Refreshed(next);
        }

        if compare_attachment_points(topology, &current, &new_ap) == Ordering::Less {
            // The new location wins; demote the incumbent to a candidate.
            by_domain.insert(domain, new_ap);
            if !old_aps.iter().any(|ap| ap.same_port(&current)) {
                old_aps.push(current);
            }
            let mut next = self.clone();
            next.attachment_points = by_domain.into_values().collect();
            next.old_aps = old_aps;
            if topology.in_same_broadcast_domain(&current.port(), &new_ap.port()) {
                ApUpdate::Refreshed(next)
            } else {
                ApUpdate::Moved(next)
            }
        } else if resurrected {
            // The incumbent stands; put the refreshed candidate back.
            if !old_aps.iter().any(|ap| ap.same_port(&new_ap)) {
                old_aps.push(new_ap);
            }
            let mut next = self.clone();
            next.old_aps = old_aps;
            ApUpdate::Refreshed(next)
        } else {
            ApUpdate::Unchanged
        }
    }

    /// Re-elects attachment points after a topology change, dropping any on
    /// ports that are no longer valid attachment points. Returns the
    /// replacement device when the election changed (the device moved).
    pub fn refresh_attachment_points(
        &self,
        topology: &dyn TopologyOracle,
        is_valid: &dyn Fn(&SwitchPort) -> bool,
    ) -> Option<Device> {
        if self.attachment_points.is_empty() {
            return None;
        }
        let live: Vec<AttachmentPoint> = self
            .attachment_points
            .iter()
            .copied()
            .filter(|ap| is_valid(&ap.port()))
            .collect();
        let by_domain = Self::ap_map(&live, topology);
        if by_domain.len() == self.attachment_points.len() {
            return None;
        }
        let mut next = self.clone();
        next.attachment_points = by_domain.into_values().collect();
        Some(next)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("key", &self.key)
            .field("class", &self.class.name())
            .field("entities", &self.entities)
            .field("attachment_points", &self.attachment_points)
            .field("static_host", &self.static_host)
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} (key {})", self.class.name(), self.mac(), self.key)
    }
}
