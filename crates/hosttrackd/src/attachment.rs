//! Attachment points and the resolver that arbitrates between them.

use crate::oracle::TopologyOracle;
use hosttrack_types::SwitchPort;
use std::cmp::Ordering;

/// Silence on a port after which a re-appearing host counts as freshly
/// attached there (activeSince is reset), in milliseconds.
pub const INACTIVITY_INTERVAL_MS: i64 = 30_000;

/// Stability offset when both candidate ports are broadcast-domain
/// boundaries, in milliseconds.
pub const EXTERNAL_TO_EXTERNAL_TIMEOUT_MS: i64 = 5_000;

/// Stability offset when only the newer candidate port is a broadcast-domain
/// boundary, in milliseconds.
pub const OPENFLOW_TO_EXTERNAL_TIMEOUT_MS: i64 = 30_000;

/// Where a device is currently believed to be connected: a port plus the
/// window `[active_since, last_seen]` over which it has been seen there.
///
/// Invariant: `active_since <= last_seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentPoint {
    port: SwitchPort,
    active_since: i64,
    last_seen: i64,
}

impl AttachmentPoint {
    /// Creates an attachment point first seen at `last_seen`.
    pub const fn new(port: SwitchPort, last_seen: i64) -> Self {
        AttachmentPoint {
            port,
            active_since: last_seen,
            last_seen,
        }
    }

    pub const fn port(&self) -> SwitchPort {
        self.port
    }

    pub const fn active_since(&self) -> i64 {
        self.active_since
    }

    pub const fn last_seen(&self) -> i64 {
        self.last_seen
    }

    /// Returns true if both attachment points reference the same port.
    /// Timestamps are deliberately not compared.
    pub fn same_port(&self, other: &AttachmentPoint) -> bool {
        self.port == other.port
    }

    /// Returns this attachment point with the sighting at `last_seen`
    /// folded in. A gap longer than [`INACTIVITY_INTERVAL_MS`] re-arms
    /// `active_since`: the host is considered to have freshly appeared on
    /// the port again after that much silence.
    pub fn touched(&self, last_seen: i64) -> Self {
        let mut ap = *self;
        if self.last_seen + INACTIVITY_INTERVAL_MS < last_seen {
            ap.active_since = last_seen;
        }
        if last_seen > self.last_seen {
            ap.last_seen = last_seen;
        }
        ap
    }
}

/// Decides which of two attachment points for the same device is
/// authoritative.
///
/// Returns `Ordering::Less` when `newer` supersedes `older` and
/// `Ordering::Greater` when `older` stands. The rule is asymmetric on
/// purpose: a location backed by a broadcast-domain boundary port must stay
/// quiet for longer before it loses to fresh observations, which prevents
/// rapid flapping between a genuine new location and stale broadcast noise.
pub fn compare_attachment_points(
    topology: &dyn TopologyOracle,
    older: &AttachmentPoint,
    newer: &AttachmentPoint,
) -> Ordering {
    let old_domain = topology.l2_domain_id(older.port().node());
    let new_domain = topology.l2_domain_id(newer.port().node());
    if old_domain < new_domain {
        return Ordering::Less;
    } else if old_domain > new_domain {
        return Ordering::Greater;
    }

    // The switch-local software stack port always wins.
    if !older.port().is_local() && newer.port().is_local() {
        return Ordering::Less;
    } else if older.port().is_local() && !newer.port().is_local() {
        return Ordering::Greater;
    }

    // Normalize so the nominally "old" side has the earlier activeSince.
    if older.active_since() > newer.active_since() {
        return compare_attachment_points(topology, newer, older).reverse();
    }

    let old_bd = topology.is_broadcast_domain_port(&older.port());
    let new_bd = topology.is_broadcast_domain_port(&newer.port());

    if !new_bd && old_bd {
        return Ordering::Less;
    }
    let active_offset = if new_bd && old_bd {
        EXTERNAL_TO_EXTERNAL_TIMEOUT_MS
    } else if new_bd {
        OPENFLOW_TO_EXTERNAL_TIMEOUT_MS
    } else {
        0
    };

    if newer.active_since() > older.last_seen() + active_offset
        || newer.last_seen() > older.last_seen() + INACTIVITY_INTERVAL_MS
    {
        return Ordering::Less;
    }
    Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::DefaultTopology;
    use hosttrack_types::{NodeId, PortKind};
    use std::collections::HashMap;

    fn port(node: u64, port_no: u32) -> SwitchPort {
        SwitchPort::new(NodeId::new(node), port_no)
    }

    /// Oracle with per-node domains and a configurable broadcast-port set.
    struct TestTopology {
        domains: HashMap<u64, u64>,
        broadcast_ports: Vec<SwitchPort>,
    }

    impl TestTopology {
        fn flat() -> Self {
            TestTopology {
                domains: HashMap::new(),
                broadcast_ports: Vec::new(),
            }
        }
    }

    impl TopologyOracle for TestTopology {
        fn is_internal_port(&self, _port: &SwitchPort) -> bool {
            false
        }

        fn is_enabled_port(&self, _port: &SwitchPort) -> bool {
            true
        }

        fn l2_domain_id(&self, node: NodeId) -> u64 {
            self.domains.get(&node.as_u64()).copied().unwrap_or(0)
        }

        fn is_broadcast_domain_port(&self, port: &SwitchPort) -> bool {
            self.broadcast_ports.contains(port)
        }

        fn in_same_broadcast_domain(&self, _a: &SwitchPort, _b: &SwitchPort) -> bool {
            false
        }
    }

    #[test]
    fn test_touched_within_inactivity_window() {
        let ap = AttachmentPoint::new(port(1, 1), 1_000);
        let ap = ap.touched(10_000);
        assert_eq!(ap.active_since(), 1_000);
        assert_eq!(ap.last_seen(), 10_000);
    }

    #[test]
    fn test_touched_after_long_silence_rearms_active_since() {
        let ap = AttachmentPoint::new(port(1, 1), 1_000);
        let ap = ap.touched(1_000 + INACTIVITY_INTERVAL_MS + 1);
        assert_eq!(ap.active_since(), ap.last_seen());
    }

    #[test]
    fn test_touched_never_rewinds() {
        let ap = AttachmentPoint::new(port(1, 1), 5_000);
        let ap = ap.touched(4_000);
        assert_eq!(ap.last_seen(), 5_000);
        assert_eq!(ap.active_since(), 5_000);
    }

    #[test]
    fn test_local_port_preferred() {
        let topo = DefaultTopology;
        let physical = AttachmentPoint::new(port(1, 1), 1_000);
        let local = AttachmentPoint::new(
            SwitchPort::with_kind(NodeId::new(1), 0xfffe, PortKind::Local),
            500,
        );
        assert_eq!(
            compare_attachment_points(&topo, &physical, &local),
            Ordering::Less
        );
        assert_eq!(
            compare_attachment_points(&topo, &local, &physical),
            Ordering::Greater
        );
    }

    #[test]
    fn test_fresh_sighting_beats_stale_port() {
        let topo = TestTopology::flat();
        let old = AttachmentPoint::new(port(1, 1), 1_000);
        // Active well past the old port's lastSeen: the new port wins.
        let new = AttachmentPoint::new(port(1, 2), 40_000);
        assert_eq!(compare_attachment_points(&topo, &old, &new), Ordering::Less);
    }

    #[test]
    fn test_recent_old_port_stands_against_broadcast_noise() {
        let mut topo = TestTopology::flat();
        topo.broadcast_ports.push(port(1, 2));
        let old = AttachmentPoint::new(port(1, 1), 1_000).touched(20_000);
        // Seen on a broadcast boundary shortly after: old wins, offset 30s.
        let new = AttachmentPoint::new(port(1, 2), 21_000);
        assert_eq!(
            compare_attachment_points(&topo, &old, &new),
            Ordering::Greater
        );
    }

    #[test]
    fn test_non_broadcast_beats_broadcast() {
        let mut topo = TestTopology::flat();
        topo.broadcast_ports.push(port(1, 1));
        let old = AttachmentPoint::new(port(1, 1), 1_000);
        let new = AttachmentPoint::new(port(1, 2), 1_500);
        assert_eq!(compare_attachment_points(&topo, &old, &new), Ordering::Less);
    }

    #[test]
    fn test_comparator_antisymmetry_over_generated_pairs() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut topo = TestTopology::flat();
        topo.broadcast_ports.push(port(1, 3));
        topo.broadcast_ports.push(port(2, 3));
        topo.domains.insert(2, 1);

        for _ in 0..500 {
            let mk = |rng: &mut rand::rngs::StdRng| {
                let p = port(rng.gen_range(1..=2), rng.gen_range(1..=4));
                let active = rng.gen_range(0..60_000);
                let seen = active + rng.gen_range(0..60_000);
                AttachmentPoint::new(p, active).touched(seen)
            };
            let a = mk(&mut rng);
            let b = mk(&mut rng);
            // The order only has to hold for distinct ports, and an exact
            // activeSince tie falls to the incumbent by argument position.
            if a.same_port(&b) || a.active_since() == b.active_since() {
                continue;
            }
            assert_eq!(
                compare_attachment_points(&topo, &a, &b),
                compare_attachment_points(&topo, &b, &a).reverse(),
                "antisymmetry violated for {:?} vs {:?}",
                a,
                b
            );
        }
    }
}
