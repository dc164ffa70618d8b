//! Core types and constants for the dlarp protocol.

use core::fmt;
use core::net::Ipv4Addr;

use crate::time::Timestamp;
use crate::wire::DecodeError;

/// UDP port every dlarp endpoint binds to.
pub const DLARP_PORT: u16 = 654;

/// Fixed header size: type(1) seq(4) request(4) src(4) dst(4) hops(1) metric(8).
pub const HEADER_SIZE: usize = 26;

/// Per-hop metric used when the transport supplies no link quality.
pub const DEFAULT_LINK_COST: f64 = 1.0;

/// Network address of a node interface.
pub type Address = Ipv4Addr;

/// Identifier of a local network interface, assigned by the node manager.
pub type InterfaceId = u32;

/// Discovery / agreement correlation id.
pub type RequestId = u32;

/// One candidate route to a destination.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoutingTableEntry {
    pub destination: Address,
    pub next_hop: Address,
    pub interface: InterfaceId,
    /// Sequence number of the message that produced this entry.
    pub seq_no: u32,
    /// Accumulated path cost, lower is better.
    pub metric: f64,
    pub hop_count: u8,
    /// Absolute expiry instant. The entry is usable while `lifetime > now`.
    pub lifetime: Timestamp,
}

impl RoutingTableEntry {
    /// Returns true while the entry may be selected.
    #[inline]
    pub fn is_valid(&self, now: Timestamp) -> bool {
        self.lifetime > now
    }
}

/// Forwarding decision handed back to the IP layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub destination: Address,
    /// Neighbor the packet must be handed to.
    pub gateway: Address,
    /// Local address to use as the packet source.
    pub source: Address,
    pub interface: InterfaceId,
}

/// The addressing part of a data packet, as seen by the forwarding layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub source: Address,
    pub destination: Address,
}

impl DataHeader {
    pub fn new(source: Address, destination: Address) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// Errors surfaced by protocol operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] DecodeError),

    #[error("no route to host {0}")]
    NoRouteToHost(Address),

    #[error("duplicate route request {request_id} from {originator}")]
    DuplicateRequest {
        request_id: RequestId,
        originator: Address,
    },

    #[error("agreement rejected: {agrees} agreeing votes, {threshold} required")]
    AgreementRejected { agrees: usize, threshold: usize },

    #[error("failed to bind endpoint on interface {iface}")]
    EndpointBindFailure { iface: InterfaceId },

    #[error("unknown interface {0}")]
    UnknownInterface(InterfaceId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Lifecycle state of a pending discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    /// RREQ flooded, waiting for a reply or timeout.
    Requested,
    /// A reply arrived and the candidate is being voted on.
    AwaitingAgreement,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryState::Requested => write!(f, "requested"),
            DiscoveryState::AwaitingAgreement => write!(f, "awaiting-agreement"),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::string::ToString;

    use super::*;

    fn entry(lifetime: u64) -> RoutingTableEntry {
        RoutingTableEntry {
            destination: Ipv4Addr::new(10, 0, 0, 3),
            next_hop: Ipv4Addr::new(10, 0, 0, 2),
            interface: 1,
            seq_no: 1,
            metric: 2.0,
            hop_count: 2,
            lifetime: Timestamp::from_millis(lifetime),
        }
    }

    #[test]
    fn test_entry_validity_is_strict() {
        let e = entry(1000);
        assert!(e.is_valid(Timestamp::from_millis(999)));
        assert!(!e.is_valid(Timestamp::from_millis(1000)));
    }

    #[test]
    fn test_error_display() {
        let err = Error::NoRouteToHost(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(err.to_string(), "no route to host 10.0.0.9");

        let err = Error::AgreementRejected {
            agrees: 1,
            threshold: 2,
        };
        assert_eq!(
            err.to_string(),
            "agreement rejected: 1 agreeing votes, 2 required"
        );

        let err = Error::EndpointBindFailure { iface: 3 };
        assert_eq!(err.to_string(), "failed to bind endpoint on interface 3");
    }

    #[test]
    fn test_decode_error_converts() {
        let err: Error = DecodeError::InvalidMessageType(9).into();
        assert!(matches!(
            err,
            Error::MalformedPacket(DecodeError::InvalidMessageType(9))
        ));
    }
}
