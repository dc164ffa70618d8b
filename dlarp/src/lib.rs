#![forbid(unsafe_code)]
//! dlarp - Distributed local-agreement routing for ad hoc wireless networks
//!
//! An on-demand routing protocol for multi-hop wireless networks. Nodes find
//! their neighbors through periodic Hellos, flood route requests only when
//! traffic needs a destination they cannot reach, and put every discovered
//! route to a vote among their live neighbors before committing it.
//!
//! This crate is `no_std` but **requires the `alloc` crate**. It owns no
//! sockets, clocks or timer wheels: the hosting environment implements the
//! capability traits in [`traits`] and drives the node through
//! [`Node::handle_event`].
//!
//! # Key Properties
//!
//! - Neighbors expire exactly `neighbor_timeout` after their last Hello
//! - Each destination keeps several candidate routes, the lowest metric wins
//! - Duplicate route requests are suppressed per (request id, originator)
//! - A route is committed only after more than `quorum_fraction` of the live
//!   neighbors agree on its metric
//! - Every handler runs to completion without blocking
//!
//! # Example (basic usage)
//!
//! ```ignore
//! use core::net::Ipv4Addr;
//! use dlarp::{DataHeader, DlarpConfig, Error, Node, NoopObserver};
//! use dlarp::traits::test_impls::{MockClock, MockRandom, MockTimer, MockTransport};
//!
//! let mut node = Node::new(
//!     DlarpConfig::default(),
//!     MockTransport::new(),
//!     MockTimer::new(),
//!     MockRandom::new(),
//!     MockClock::new(),
//!     NoopObserver,
//! )
//! .unwrap();
//! let me = Ipv4Addr::new(10, 0, 0, 1);
//! node.interface_up(1, me).unwrap();
//! node.attach();
//!
//! // Nothing is known yet: the lookup fails and a discovery starts.
//! let far = Ipv4Addr::new(10, 0, 0, 9);
//! let header = DataHeader::new(me, far);
//! assert_eq!(node.route_output(&header), Err(Error::NoRouteToHost(far)));
//! assert_eq!(node.pending_requests().len(), 1);
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Core types (RoutingTableEntry, Route, Error, etc.)
//! - [`wire`] - Wire format serialization
//! - [`traits`] - Transport, Timer, Clock, Random traits
//! - [`node`] - Main Node struct and public API
//! - [`neighbor`] - Hello exchange and neighbor liveness
//! - [`table`] - Multi-path routing table
//! - [`discovery`] - RREQ flooding and RREP return
//! - [`agreement`] - Neighbor vote on discovered routes
//! - [`forwarding`] - Per-packet decisions for the IP layer
//! - [`observer`] - Structured protocol events
//! - [`time`] - Timestamp and Duration types
//! - [`config`] - Runtime protocol configuration

#![no_std]

// Prevent test features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It includes mock transports and timers intended only for tests and simulation."
);

extern crate alloc;

pub mod agreement;
pub mod config;
pub mod discovery;
pub mod forwarding;
pub mod neighbor;
pub mod node;
pub mod observer;
pub mod table;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

#[cfg(test)]
mod harness;

// Re-export main types at crate root
pub use agreement::AgreementRound;
pub use config::DlarpConfig;
pub use discovery::PendingRequest;
pub use forwarding::InputCallbacks;
pub use neighbor::{NeighborRecord, NeighborTable};
pub use node::{Node, NodeEvent};
pub use observer::{NoopObserver, Observer, ProtocolEvent, TracingObserver};
pub use table::RoutingTable;
pub use time::{Duration, Timestamp};
pub use traits::{Clock, Random, Timer, TimerId, TimerKind, Transport};
pub use types::{
    Address, DataHeader, DiscoveryState, Error, InterfaceId, RequestId, Route, RoutingTableEntry,
};
pub use wire::{Decode, DecodeError, DlarpMessage, Encode, MessageType};

// Re-export constants
pub use types::{DEFAULT_LINK_COST, DLARP_PORT, HEADER_SIZE};
