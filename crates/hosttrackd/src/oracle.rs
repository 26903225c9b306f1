//! Topology and switch-inventory collaborator interface.
//!
//! The tracking engine never inspects links or port state itself; everything
//! it needs to know about the network graph comes through this trait.

use hosttrack_types::{NodeId, SwitchPort};

/// Read-only view of topology and port state, supplied by the topology and
/// switch-inventory services.
///
/// Implementations must be cheap to call: the learning path consults the
/// oracle on every observation.
pub trait TopologyOracle: Send + Sync {
    /// Returns true if `port` is an inter-switch (internal) link port.
    /// Hosts are never learned on internal ports.
    fn is_internal_port(&self, port: &SwitchPort) -> bool;

    /// Returns true if `port` is administratively and operationally up.
    fn is_enabled_port(&self, port: &SwitchPort) -> bool;

    /// Returns the L2 (openflow) domain identifier for a switch. Devices
    /// keep one attachment point per distinct domain.
    fn l2_domain_id(&self, node: NodeId) -> u64;

    /// Returns true if `port` sits on a broadcast-domain boundary (e.g., a
    /// link into a non-openflow segment). Broadcast-boundary ports get a
    /// longer stability timeout before an attachment point flips.
    fn is_broadcast_domain_port(&self, port: &SwitchPort) -> bool;

    /// Returns true if the two ports belong to the same broadcast domain.
    /// A device shifting between such ports has not really moved.
    fn in_same_broadcast_domain(&self, a: &SwitchPort, b: &SwitchPort) -> bool;
}

/// Default oracle: one flat L2 domain, no broadcast boundaries, every port
/// enabled and external. Suitable for single-switch deployments and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTopology;

impl TopologyOracle for DefaultTopology {
    fn is_internal_port(&self, _port: &SwitchPort) -> bool {
        false
    }

    fn is_enabled_port(&self, _port: &SwitchPort) -> bool {
        true
    }

    fn l2_domain_id(&self, _node: NodeId) -> u64 {
        0
    }

    fn is_broadcast_domain_port(&self, _port: &SwitchPort) -> bool {
        false
    }

    fn in_same_broadcast_domain(&self, _a: &SwitchPort, _b: &SwitchPort) -> bool {
        false
    }
}
