//! The device tracker: learning, lookup, expiration, and lifecycle hooks.
//!
//! Writers race through optimistic loops: read the current device, derive a
//! replacement, publish it with a conditional repository update, and restart
//! from the lookup when the condition fails. At least one racing writer
//! always commits, so the loops make progress; a configurable attempt cap
//! guards against pathological contention and index-consistency bugs.

use crate::class::{AllowAll, DefaultEntityClassifier, EntityClass, EntityClassifier, EntityPolicy};
use crate::config::TrackerConfig;
use crate::device::{ApUpdate, Device, DeviceKey};
use crate::entity::{
    all_key_fields_present, now_millis, DeviceField, Entity, FieldSet,
};
use crate::error::{Result, TrackerError};
use crate::events::{DeviceEvent, DeviceListener, EventDispatcher, HostLinkSink};
use crate::index::{DeviceIndex, DeviceMultiIndex, DeviceUniqueIndex};
use crate::oracle::{DefaultTopology, TopologyOracle};
use crate::repository::DeviceTable;
use crate::stats::{TrackerStats, TrackerStatsSnapshot};
use dashmap::{DashMap, DashSet};
use hosttrack_types::{MacAddress, NodeId, SwitchPort, VlanId};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-class index state, created lazily the first time a class is seen.
struct ClassState {
    /// Identity index for the class; present only when the class's key
    /// fields differ from the primary index's.
    class_index: Option<DeviceUniqueIndex>,
    secondary: HashMap<FieldSet, DeviceMultiIndex>,
}

impl ClassState {
    fn new(class: &dyn EntityClass, primary_fields: FieldSet, per_class: &[FieldSet]) -> Self {
        let class_index = if class.key_fields() != primary_fields {
            Some(DeviceUniqueIndex::new(class.key_fields()))
        } else {
            None
        };
        let secondary = per_class
            .iter()
            .map(|fields| (*fields, DeviceMultiIndex::new(*fields)))
            .collect();
        ClassState {
            class_index,
            secondary,
        }
    }
}

/// Result of resolving an entity to a device key.
enum Lookup {
    Existing(DeviceKey),
    /// No key anywhere; the entity would found a new device of this class.
    New(Arc<dyn EntityClass>),
    Unclassifiable,
}

/// The host/device tracking engine.
///
/// Learns devices from observed [`Entity`] samples, answers
/// where-is-this-address lookups, ages out stale state, and notifies
/// listeners of every committed change.
pub struct DeviceTracker {
    config: TrackerConfig,
    devices: DeviceTable,
    primary_index: DeviceUniqueIndex,
    /// Global secondary indices, fixed at wiring time.
    secondary_indexes: HashMap<FieldSet, DeviceMultiIndex>,
    /// Field sets every class gets a secondary index for.
    per_class_index_fields: Vec<FieldSet>,
    class_states: DashMap<String, Arc<ClassState>>,
    classifier: Arc<dyn EntityClassifier>,
    policy: Arc<dyn EntityPolicy>,
    topology: Arc<dyn TopologyOracle>,
    dispatcher: EventDispatcher,
    suppressed_ports: DashSet<SwitchPort>,
    /// Static hosts waiting for their port to come up.
    pending_static_hosts: DashMap<SwitchPort, Entity>,
    key_counter: AtomicU64,
    stats: TrackerStats,
}

impl DeviceTracker {
    /// Creates a tracker with the default classifier, policy, and topology.
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(DefaultEntityClassifier::new()),
            Arc::new(AllowAll),
            Arc::new(DefaultTopology),
        )
    }

    /// Creates a tracker with explicit collaborators.
    pub fn with_collaborators(
        config: TrackerConfig,
        classifier: Arc<dyn EntityClassifier>,
        policy: Arc<dyn EntityPolicy>,
        topology: Arc<dyn TopologyOracle>,
    ) -> Self {
        let primary_index = DeviceUniqueIndex::new(classifier.key_fields());
        let mut tracker = DeviceTracker {
            config,
            devices: DeviceTable::new(),
            primary_index,
            secondary_indexes: HashMap::new(),
            per_class_index_fields: Vec::new(),
            class_states: DashMap::new(),
            classifier,
            policy,
            topology,
            dispatcher: EventDispatcher::new(),
            suppressed_ports: DashSet::new(),
            pending_static_hosts: DashMap::new(),
            key_counter: AtomicU64::new(0),
            stats: TrackerStats::new(),
        };
        // Find-by-IP is the common external lookup; every class gets the
        // index.
        tracker.add_index(true, FieldSet::of(&[DeviceField::Ipv4]));
        tracker
    }

    /// Registers a secondary index. Wiring-time only: indexes added after
    /// devices have been learned will miss them.
    pub fn add_index(&mut self, per_class: bool, key_fields: FieldSet) {
        if per_class {
            self.per_class_index_fields.push(key_fields);
        } else {
            self.secondary_indexes
                .insert(key_fields, DeviceMultiIndex::new(key_fields));
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Registers a device-update listener.
    pub fn add_listener(&self, listener: Arc<dyn DeviceListener>) {
        self.dispatcher.add_listener(listener);
    }

    /// Installs the host-link sink notified of attachment edges.
    pub fn set_host_link_sink(&self, sink: Arc<dyn HostLinkSink>) {
        self.dispatcher.set_host_link_sink(sink);
    }

    /// Point-in-time counter snapshot.
    pub fn stats(&self) -> TrackerStatsSnapshot {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Lookup API
    // ------------------------------------------------------------------

    /// Looks up the device for a fully-keyed identity. Fails if a key field
    /// required by the active classifier is missing.
    pub fn find_device(
        &self,
        mac: MacAddress,
        vlan: Option<VlanId>,
        ipv4: Option<Ipv4Addr>,
        port: Option<SwitchPort>,
    ) -> Result<Option<Arc<Device>>> {
        let entity = Entity::new(mac, vlan, ipv4, port, None);
        let required = self.classifier.key_fields();
        if !all_key_fields_present(&entity, required) {
            return Err(TrackerError::MissingKeyFields { required });
        }
        Ok(self.find_device_by_entity(&entity))
    }

    /// Class-scoped lookup, for callers that already know the entity class
    /// (e.g., resolving a destination in the source's class).
    pub fn find_class_device(
        &self,
        class: &Arc<dyn EntityClass>,
        mac: MacAddress,
        vlan: Option<VlanId>,
        ipv4: Option<Ipv4Addr>,
    ) -> Result<Option<Arc<Device>>> {
        let entity = Entity::new(mac, vlan, ipv4, None, None);
        let required = class.key_fields();
        if !all_key_fields_present(&entity, required) {
            return Err(TrackerError::MissingKeyFields { required });
        }
        let mut key = self.primary_index.find_by_entity(&entity);
        if key.is_none() {
            let class_state = self.class_state(class);
            if let Some(class_index) = &class_state.class_index {
                key = class_index.find_by_entity(&entity);
            }
        }
        Ok(key.and_then(|k| self.devices.get(k)))
    }

    fn find_device_by_entity(&self, entity: &Entity) -> Option<Arc<Device>> {
        let mut key = self.primary_index.find_by_entity(entity);
        if key.is_none() {
            let class = self.classifier.classify(entity)?;
            let class_state = self.class_state(&class);
            if let Some(class_index) = &class_state.class_index {
                key = class_index.find_by_entity(entity);
            }
        }
        self.devices.get(key?)
    }

    pub fn get_device(&self, key: DeviceKey) -> Option<Arc<Device>> {
        self.devices.get(key)
    }

    pub fn all_devices(&self) -> Vec<Arc<Device>> {
        self.devices.snapshot()
    }

    /// Finds devices matching the supplied fields. Uses a secondary index
    /// when one exists for exactly this field combination, otherwise falls
    /// back to a full scan; either way results are filtered by every
    /// supplied field (a port matches against attachment points).
    pub fn query_devices(
        &self,
        mac: Option<MacAddress>,
        vlan: Option<VlanId>,
        ipv4: Option<Ipv4Addr>,
        port: Option<SwitchPort>,
    ) -> Vec<Arc<Device>> {
        let fields = query_fields(mac, vlan, ipv4, port);
        let candidates = match self.secondary_indexes.get(&fields) {
            Some(index) => index
                .query_by_parts(mac, vlan, ipv4, port)
                .into_iter()
                .filter_map(|key| self.devices.get(key))
                .collect(),
            None => self.devices.snapshot(),
        };
        candidates
            .into_iter()
            .filter(|device| device_matches(device, mac, vlan, ipv4, port))
            .collect()
    }

    /// Class-scoped [`DeviceTracker::query_devices`].
    pub fn query_class_devices(
        &self,
        class: &Arc<dyn EntityClass>,
        mac: Option<MacAddress>,
        vlan: Option<VlanId>,
        ipv4: Option<Ipv4Addr>,
        port: Option<SwitchPort>,
    ) -> Vec<Arc<Device>> {
        let class_state = self.class_state(class);
        let fields = query_fields(mac, vlan, ipv4, port);
        let candidates: Vec<Arc<Device>> =
            if let Some(index) = class_state.secondary.get(&fields) {
                index
                    .query_by_parts(mac, vlan, ipv4, port)
                    .into_iter()
                    .filter_map(|key| self.devices.get(key))
                    .collect()
            } else if let Some(class_index) = &class_state.class_index {
                class_index
                    .all_keys()
                    .into_iter()
                    .filter_map(|key| self.devices.get(key))
                    .collect()
            } else {
                self.devices.snapshot()
            };
        candidates
            .into_iter()
            .filter(|device| device.entity_class().name() == class.name())
            .filter(|device| device_matches(device, mac, vlan, ipv4, port))
            .collect()
    }

    // ------------------------------------------------------------------
    // Learning
    // ------------------------------------------------------------------

    /// Merges one observed entity into the device model.
    ///
    /// Returns the merged device, or `Ok(None)` when the observation is
    /// rejected (unclassifiable, disallowed by policy, or a previously
    /// unseen identity on a non-learnable port). All committed events are
    /// dispatched before returning, on every path.
    pub fn learn_entity(&self, entity: Entity) -> Result<Option<Arc<Device>>> {
        if entity.last_seen().is_none() {
            entity.refresh_last_seen(now_millis());
        }

        let mut delete_queue: Vec<DeviceKey> = Vec::new();
        let mut events: Vec<DeviceEvent> = Vec::new();
        let mut attempts = 0u32;

        let outcome = loop {
            if attempts >= self.config.max_learn_attempts {
                break Err(TrackerError::RetryExhausted { attempts });
            }
            if attempts > 0 {
                TrackerStats::bump(&self.stats.learn_retries);
            }
            attempts += 1;

            let device = match self.lookup(&entity) {
                Lookup::Unclassifiable => {
                    debug!(?entity, "entity could not be classified; not learning");
                    break Ok(None);
                }
                Lookup::New(class) => {
                    if let Some(port) = entity.port() {
                        if !self.is_valid_attachment_point(&port) {
                            TrackerStats::bump(&self.stats.non_learnable_port_skips);
                            debug!(?entity, "not learning new device on non-attachment port");
                            break Ok(None);
                        }
                    }
                    if !self.policy.is_entity_allowed(&entity, class.as_ref()) {
                        TrackerStats::bump(&self.stats.observations_not_allowed);
                        debug!(class = class.name(), ?entity, "entity not allowed");
                        break Ok(None);
                    }

                    let key = self.key_counter.fetch_add(1, AtomicOrdering::Relaxed);
                    let device = Arc::new(Device::new(key, entity.clone(), class.clone()));
                    self.devices.insert_if_absent(key, device.clone());
                    if !self.update_identity_indexes(&device, key) {
                        // Lost the primary index to a concurrent writer;
                        // undo the insert after the loop and retry.
                        delete_queue.push(key);
                        continue;
                    }
                    self.update_secondary_indexes(&entity, &class, key);
                    TrackerStats::bump(&self.stats.devices_learned);
                    debug!(device = %device, key, "new device learned");
                    events.push(DeviceEvent::Added(device.clone()));
                    break Ok(Some(device));
                }
                Lookup::Existing(key) => match self.devices.get(key) {
                    Some(device) => device,
                    None => {
                        // Indexed key without a device: lost a race with a
                        // deleter. Retry until the stale entry is gone.
                        debug!(key, "no device for indexed key; retrying");
                        continue;
                    }
                },
            };

            // Pre-existing device for this entity.
            let key = device.key();
            let class = device.entity_class().clone();
            if !self.policy.is_entity_allowed(&entity, class.as_ref()) {
                TrackerStats::bump(&self.stats.observations_not_allowed);
                debug!(class = class.name(), ?entity, "entity not allowed");
                break Ok(None);
            }
            if let Some(port) = entity.port() {
                if !self.is_valid_attachment_point(&port) {
                    // Known device heard on a non-learnable port: let the
                    // observation pass through without learning it.
                    break Ok(Some(device));
                }
            }

            let device = match device.entity_index(&entity) {
                Ok(found) => {
                    // Timestamp-only refresh; index membership is untouched.
                    device.entities()[found]
                        .refresh_last_seen(entity.last_seen().unwrap_or_else(now_millis));
                    device
                }
                Err(insert_at) => {
                    let changed = find_changed_fields(&device, &entity);
                    let updated = Arc::new(device.with_entity(entity.clone(), insert_at));
                    if !self.devices.replace(key, &device, updated.clone()) {
                        continue;
                    }
                    if !self.update_identity_indexes(&updated, key) {
                        continue;
                    }
                    self.update_secondary_indexes(&entity, &class, key);
                    if !changed.is_empty() {
                        TrackerStats::bump(&self.stats.devices_changed);
                        events.push(DeviceEvent::Changed(updated.clone(), changed));
                    }
                    updated
                }
            };

            let Some(port) = entity.port() else {
                break Ok(Some(device));
            };
            let seen = entity.last_seen().unwrap_or_else(now_millis);
            match device.update_attachment_point(port, seen, self.topology.as_ref()) {
                ApUpdate::Unchanged => break Ok(Some(device)),
                ApUpdate::Refreshed(next) => {
                    let next = Arc::new(next);
                    if !self.devices.replace(key, &device, next.clone()) {
                        continue;
                    }
                    break Ok(Some(next));
                }
                ApUpdate::Moved(next) => {
                    let next = Arc::new(next);
                    if !self.devices.replace(key, &device, next.clone()) {
                        continue;
                    }
                    TrackerStats::bump(&self.stats.devices_moved);
                    debug!(device = %next, "device moved");
                    events.push(DeviceEvent::Moved {
                        device: next.clone(),
                        previous: Some(device),
                    });
                    break Ok(Some(next));
                }
            }
        };

        // Deletions from failed index updates go out first, then the
        // accumulated events, regardless of how the loop exited.
        let mut dispatch_events = Vec::with_capacity(delete_queue.len() + events.len());
        for key in delete_queue {
            if let Some(stale) = self.devices.get(key) {
                self.delete_device(&stale);
                TrackerStats::bump(&self.stats.devices_deleted);
                dispatch_events.push(DeviceEvent::Deleted(stale));
            }
        }
        dispatch_events.extend(events);
        self.dispatcher.dispatch(dispatch_events);

        outcome
    }

    fn lookup(&self, entity: &Entity) -> Lookup {
        if let Some(key) = self.primary_index.find_by_entity(entity) {
            return Lookup::Existing(key);
        }
        let Some(class) = self.classifier.classify(entity) else {
            return Lookup::Unclassifiable;
        };
        let class_state = self.class_state(&class);
        if let Some(class_index) = &class_state.class_index {
            if let Some(key) = class_index.find_by_entity(entity) {
                return Lookup::Existing(key);
            }
        }
        Lookup::New(class)
    }

    /// Returns true if hosts may be learned on `port` right now.
    pub fn is_valid_attachment_point(&self, port: &SwitchPort) -> bool {
        !self.topology.is_internal_port(port)
            && self.topology.is_enabled_port(port)
            && !self.suppressed_ports.contains(port)
    }

    // ------------------------------------------------------------------
    // Suppressed ports
    // ------------------------------------------------------------------

    /// Stops learning attachment points on `port`.
    pub fn add_suppressed_port(&self, port: SwitchPort) {
        self.suppressed_ports.insert(port);
    }

    pub fn remove_suppressed_port(&self, port: SwitchPort) {
        self.suppressed_ports.remove(&port);
    }

    pub fn suppressed_ports(&self) -> Vec<SwitchPort> {
        self.suppressed_ports.iter().map(|p| *p).collect()
    }

    // ------------------------------------------------------------------
    // Static hosts
    // ------------------------------------------------------------------

    /// Provisions a static host. If the port is currently down the host is
    /// parked in the pending table and learned on the next port-up event.
    pub fn add_static_host(
        &self,
        ipv4: Ipv4Addr,
        mac: MacAddress,
        port: SwitchPort,
        vlan: Option<VlanId>,
    ) -> Result<()> {
        let entity = Entity::new(mac, vlan, Some(ipv4), Some(port), Some(now_millis()));
        if self.topology.is_enabled_port(&port) {
            if let Some(device) = self.learn_entity(entity)? {
                self.mark_static_host(device.key());
            }
        } else {
            debug!(%port, %ipv4, "port down; parking static host in pending table");
            self.pending_static_hosts.insert(port, entity);
        }
        Ok(())
    }

    /// Removes the static host(s) carrying `ipv4`, active or pending.
    pub fn remove_static_host(&self, ipv4: Ipv4Addr) {
        let mut events = Vec::new();
        for device in self.query_devices(None, None, Some(ipv4), None) {
            if device.is_static_host() && self.delete_device(&device) {
                TrackerStats::bump(&self.stats.devices_deleted);
                events.push(DeviceEvent::Deleted(device));
            }
        }
        self.pending_static_hosts
            .retain(|_, entity| entity.ipv4() != Some(ipv4));
        self.dispatcher.dispatch(events);
    }

    /// Static hosts that are currently learned.
    pub fn active_static_hosts(&self) -> Vec<Arc<Device>> {
        self.devices
            .snapshot()
            .into_iter()
            .filter(|device| device.is_static_host())
            .collect()
    }

    /// Static hosts parked until their port comes up.
    pub fn inactive_static_hosts(&self) -> Vec<Entity> {
        self.pending_static_hosts
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn mark_static_host(&self, key: DeviceKey) {
        for _ in 0..self.config.max_learn_attempts {
            let Some(device) = self.devices.get(key) else {
                return;
            };
            if device.is_static_host() {
                return;
            }
            let flagged = Arc::new(device.with_static_host(true));
            if self.devices.replace(key, &device, flagged) {
                return;
            }
        }
        warn!(key, "gave up setting static-host flag under contention");
    }

    // ------------------------------------------------------------------
    // Port / node lifecycle
    // ------------------------------------------------------------------

    /// Port came up: learn any static host parked on it.
    pub fn on_port_up(&self, port: SwitchPort) -> Result<()> {
        let Some(entity) = self
            .pending_static_hosts
            .get(&port)
            .map(|entry| entry.value().clone())
        else {
            return Ok(());
        };
        info!(%port, "port up; learning pending static host");
        entity.refresh_last_seen(now_millis());
        if let Some(device) = self.learn_entity(entity)? {
            self.mark_static_host(device.key());
            self.pending_static_hosts.remove(&port);
        }
        Ok(())
    }

    /// Port went down: remove every device attached there.
    pub fn on_port_down(&self, port: SwitchPort) {
        debug!(%port, "port down; removing attached devices");
        self.remove_devices_where(|device| device.is_attached_to_port(&port));
    }

    /// Switch went away: remove every device attached to it.
    pub fn on_node_down(&self, node: NodeId) {
        debug!(%node, "node down; removing attached devices");
        self.remove_devices_where(|device| device.is_attached_to_node(node));
    }

    fn remove_devices_where(&self, predicate: impl Fn(&Device) -> bool) {
        let mut events = Vec::new();
        for device in self.devices.snapshot() {
            if predicate(&device) && self.delete_device(&device) {
                TrackerStats::bump(&self.stats.devices_deleted);
                events.push(DeviceEvent::Deleted(device));
            }
        }
        self.dispatcher.dispatch(events);
    }

    // ------------------------------------------------------------------
    // Reclassification and topology changes
    // ------------------------------------------------------------------

    /// Reclassifies every device belonging to one of the named classes:
    /// devices whose entities no longer classify into their current class
    /// are deleted and their entities relearned from scratch.
    pub fn entity_classes_changed(&self, class_names: &HashSet<String>) {
        for device in self.devices.snapshot() {
            if class_names.contains(device.entity_class().name()) {
                self.reclassify_device(&device);
            }
        }
    }

    fn reclassify_device(&self, device: &Arc<Device>) {
        let current = device.entity_class().name();
        let needs_reclassify = device.entities().iter().any(|entity| {
            match self.classifier.classify(entity) {
                Some(class) => class.name() != current,
                None => true,
            }
        });
        if !needs_reclassify {
            return;
        }
        debug!(device = %device, "reclassifying device");
        if self.delete_device(device) {
            TrackerStats::bump(&self.stats.devices_deleted);
            self.dispatcher
                .dispatch(vec![DeviceEvent::Deleted(device.clone())]);
        }
        for entity in device.entities() {
            if let Err(err) = self.learn_entity(entity.clone()) {
                warn!(%err, device = %device, "failed to relearn entity during reclassification");
            }
        }
    }

    /// Topology changed: re-elect attachment points everywhere, announcing
    /// devices whose election changed as moved.
    pub fn on_topology_change(&self) {
        let mut events = Vec::new();
        for device in self.devices.snapshot() {
            let Some(next) = device.refresh_attachment_points(self.topology.as_ref(), &|port| {
                self.is_valid_attachment_point(port)
            }) else {
                continue;
            };
            let next = Arc::new(next);
            if self.devices.replace(device.key(), &device, next.clone()) {
                TrackerStats::bump(&self.stats.devices_moved);
                events.push(DeviceEvent::Moved {
                    device: next,
                    previous: Some(device),
                });
            }
            // A lost race means a concurrent writer republished; its state
            // is newer than this election.
        }
        self.dispatcher.dispatch(events);
    }

    // ------------------------------------------------------------------
    // Expiration
    // ------------------------------------------------------------------

    /// One expiration pass over the whole table; returns how many devices
    /// were removed. Invoked by the periodic sweep and directly by tests.
    pub fn cleanup_expired(&self, now: i64) -> usize {
        TrackerStats::bump(&self.stats.cleanup_runs);
        let cutoff = now.saturating_sub(self.config.entity_timeout_ms as i64);
        let mut removed_devices = 0usize;

        'devices: for snapshot_device in self.devices.snapshot() {
            let mut device = snapshot_device;
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                if attempts > self.config.max_learn_attempts {
                    error!(
                        device = %device,
                        "cleanup kept losing conditional updates; suspected index inconsistency"
                    );
                    continue 'devices;
                }

                let mut expired: Vec<Entity> = Vec::new();
                let mut kept: Vec<Entity> = Vec::new();
                for entity in device.entities() {
                    match entity.last_seen() {
                        Some(seen) if seen < cutoff => expired.push(entity.clone()),
                        _ => kept.push(entity.clone()),
                    }
                }
                if expired.is_empty() {
                    continue 'devices;
                }

                for entity in &expired {
                    self.remove_entity(entity, device.entity_class(), device.key(), &kept);
                }
                TrackerStats::add(&self.stats.entities_expired, expired.len() as u64);

                let mut events = Vec::new();
                if !kept.is_empty() {
                    let replacement = Arc::new(device.with_entities(kept));
                    if !self.devices.replace(device.key(), &device, replacement.clone()) {
                        // Concurrent modification: re-read and re-partition.
                        match self.devices.get(device.key()) {
                            Some(current) => {
                                device = current;
                                continue;
                            }
                            None => continue 'devices,
                        }
                    }
                    // The CHANGE fields are the union of the deltas of all
                    // removed entities against the surviving device.
                    let mut changed = FieldSet::EMPTY;
                    for entity in &expired {
                        changed = changed.union(find_changed_fields(&replacement, entity));
                    }
                    if !changed.is_empty() {
                        TrackerStats::bump(&self.stats.devices_changed);
                        events.push(DeviceEvent::Changed(replacement, changed));
                    }
                } else {
                    if !self.devices.remove(device.key(), &device) {
                        match self.devices.get(device.key()) {
                            Some(current) => {
                                device = current;
                                continue;
                            }
                            None => continue 'devices,
                        }
                    }
                    debug!(device = %device, "device expired");
                    TrackerStats::bump(&self.stats.devices_deleted);
                    removed_devices += 1;
                    events.push(DeviceEvent::Deleted(device.clone()));
                }
                self.dispatcher.dispatch(events);
                continue 'devices;
            }
        }
        removed_devices
    }

    // ------------------------------------------------------------------
    // Index maintenance
    // ------------------------------------------------------------------

    fn class_state(&self, class: &Arc<dyn EntityClass>) -> Arc<ClassState> {
        if let Some(state) = self.class_states.get(class.name()) {
            return state.clone();
        }
        let state = Arc::new(ClassState::new(
            class.as_ref(),
            self.classifier.key_fields(),
            &self.per_class_index_fields,
        ));
        self.class_states
            .entry(class.name().to_string())
            .or_insert(state)
            .value()
            .clone()
    }

    /// Updates the primary and class identity indices for `device`.
    /// A false return means a concurrent writer owns one of the keys and
    /// the caller must restart.
    fn update_identity_indexes(&self, device: &Arc<Device>, key: DeviceKey) -> bool {
        if !self.primary_index.update_device(device, key) {
            return false;
        }
        let class_state = self.class_state(device.entity_class());
        if let Some(class_index) = &class_state.class_index {
            if !class_index.update_device(device, key) {
                return false;
            }
        }
        true
    }

    fn update_secondary_indexes(
        &self,
        entity: &Entity,
        class: &Arc<dyn EntityClass>,
        key: DeviceKey,
    ) {
        for index in self.secondary_indexes.values() {
            index.update_entity(entity, key);
        }
        let class_state = self.class_state(class);
        for index in class_state.secondary.values() {
            index.update_entity(entity, key);
        }
    }

    /// Releases index entries for `entity` that none of `remaining` still
    /// derives.
    fn remove_entity(
        &self,
        entity: &Entity,
        class: &Arc<dyn EntityClass>,
        key: DeviceKey,
        remaining: &[Entity],
    ) {
        for index in self.secondary_indexes.values() {
            index.remove_entity_if_needed(entity, key, remaining);
        }
        let class_state = self.class_state(class);
        for index in class_state.secondary.values() {
            index.remove_entity_if_needed(entity, key, remaining);
        }
        self.primary_index
            .remove_entity_if_needed(entity, key, remaining);
        if let Some(class_index) = &class_state.class_index {
            class_index.remove_entity_if_needed(entity, key, remaining);
        }
    }

    /// Releases every index entry of `device` and removes it from the
    /// repository. Returns false if the stored instance was already
    /// replaced or removed.
    fn delete_device(&self, device: &Arc<Device>) -> bool {
        for entity in device.entities() {
            self.remove_entity(entity, device.entity_class(), device.key(), &[]);
        }
        if self.devices.remove(device.key(), device) {
            true
        } else {
            debug!(device = %device, "device already replaced; skipping removal");
            false
        }
    }
}

/// The set of fields a query supplied, used to pick a secondary index.
fn query_fields(
    mac: Option<MacAddress>,
    vlan: Option<VlanId>,
    ipv4: Option<Ipv4Addr>,
    port: Option<SwitchPort>,
) -> FieldSet {
    let mut fields = FieldSet::EMPTY;
    if mac.is_some() {
        fields = fields.with(DeviceField::Mac);
    }
    if vlan.is_some() {
        fields = fields.with(DeviceField::Vlan);
    }
    if ipv4.is_some() {
        fields = fields.with(DeviceField::Ipv4);
    }
    if port.is_some() {
        fields = fields.with(DeviceField::Port);
    }
    fields
}

fn device_matches(
    device: &Device,
    mac: Option<MacAddress>,
    vlan: Option<VlanId>,
    ipv4: Option<Ipv4Addr>,
    port: Option<SwitchPort>,
) -> bool {
    if let Some(mac) = mac {
        if device.mac() != mac {
            return false;
        }
    }
    if let Some(vlan) = vlan {
        if !device.vlans().contains(&Some(vlan)) {
            return false;
        }
    }
    if let Some(ipv4) = ipv4 {
        if !device.ipv4_addresses().contains(&ipv4) {
            return false;
        }
    }
    if let Some(port) = port {
        if !device.is_attached_to_port(&port) {
            return false;
        }
    }
    true
}

/// Which of the new entity's fields carry information the device does not
/// already have. Feeds the CHANGE event's field set.
fn find_changed_fields(device: &Device, new_entity: &Entity) -> FieldSet {
    let mut ipv4_new = new_entity.ipv4().is_some();
    let mut vlan_new = new_entity.vlan().is_some();
    let mut port_new = new_entity.port().is_some();
    for entity in device.entities() {
        if ipv4_new && entity.ipv4() == new_entity.ipv4() {
            ipv4_new = false;
        }
        if vlan_new && entity.vlan() == new_entity.vlan() {
            vlan_new = false;
        }
        if port_new && entity.port() == new_entity.port() {
            port_new = false;
        }
    }
    let mut fields = FieldSet::EMPTY;
    if ipv4_new {
        fields = fields.with(DeviceField::Ipv4);
    }
    if vlan_new {
        fields = fields.with(DeviceField::Vlan);
    }
    if port_new {
        fields = fields.with(DeviceField::Port);
    }
    fields
}
