//! Switch and port reference types.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A switch datapath identifier.
///
/// Rendered as 16 hex digits, the conventional OpenFlow DPID notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a node identifier from a raw datapath id.
    pub const fn new(dpid: u64) -> Self {
        NodeId(dpid)
    }

    /// Returns the raw datapath id.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(dpid: u64) -> Self {
        NodeId(dpid)
    }
}

/// Kind of switch port a host observation arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Regular data-plane port (default).
    #[default]
    Physical,
    /// The switch-local software stack port (OFPP_LOCAL). Attachment-point
    /// resolution always prefers a local port over a physical one.
    Local,
}

impl PortKind {
    /// Returns true if this is the switch-local software stack port.
    pub const fn is_local(&self) -> bool {
        matches!(self, PortKind::Local)
    }
}

/// A reference to one port on one switch.
///
/// # Examples
///
/// ```
/// use hosttrack_types::{NodeId, SwitchPort};
///
/// let port = SwitchPort::new(NodeId::new(0x1a), 3);
/// assert_eq!(port.to_string(), "000000000000001a/3");
/// assert_eq!(port, "000000000000001a/3".parse().unwrap());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwitchPort {
    node: NodeId,
    port: u32,
    kind: PortKind,
}

impl SwitchPort {
    /// Creates a physical switch port reference.
    pub const fn new(node: NodeId, port: u32) -> Self {
        SwitchPort {
            node,
            port,
            kind: PortKind::Physical,
        }
    }

    /// Creates a switch port reference of an explicit kind.
    pub const fn with_kind(node: NodeId, port: u32, kind: PortKind) -> Self {
        SwitchPort { node, port, kind }
    }

    /// Returns the switch this port belongs to.
    pub const fn node(&self) -> NodeId {
        self.node
    }

    /// Returns the port number on the switch.
    pub const fn port(&self) -> u32 {
        self.port
    }

    /// Returns the port kind.
    pub const fn kind(&self) -> PortKind {
        self.kind
    }

    /// Returns true if this is the switch-local software stack port.
    pub const fn is_local(&self) -> bool {
        self.kind.is_local()
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.port)
    }
}

impl FromStr for SwitchPort {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, port) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidSwitchPort(s.to_string()))?;
        let dpid = u64::from_str_radix(node, 16)
            .map_err(|_| ParseError::InvalidSwitchPort(s.to_string()))?;
        let port: u32 = port
            .parse()
            .map_err(|_| ParseError::InvalidSwitchPort(s.to_string()))?;
        Ok(SwitchPort::new(NodeId::new(dpid), port))
    }
}
