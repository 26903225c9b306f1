//! Shared network value types for the hosttrackd SDN controller.
//!
//! This crate provides type-safe representations of the network primitives
//! the host tracking engine is built on:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`NodeId`]: switch datapath identifiers
//! - [`SwitchPort`]: a (switch, port) attachment reference

mod mac;
mod port;
mod vlan;

pub use mac::MacAddress;
pub use port::{NodeId, PortKind, SwitchPort};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid switch port reference: {0}")]
    InvalidSwitchPort(String),
}
