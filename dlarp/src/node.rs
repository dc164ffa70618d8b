//! Node implementation - the protocol state machine of one router.
//!
//! A `Node` owns all protocol state for a single router and is driven by the
//! hosting environment through [`Node::handle_event`]. Handlers never block:
//! each one reads the clock, mutates state, hands datagrams to the transport
//! and (re)arms timers, then returns.
//!
//! # Usage
//!
//! ```ignore
//! use core::net::Ipv4Addr;
//! use dlarp::{DlarpConfig, NoopObserver, Node, NodeEvent};
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
//! node.interface_up(1, Ipv4Addr::new(10, 0, 0, 1)).unwrap();
//! node.attach();
//!
//! // The environment fires the Hello timer when it comes due.
//! let (id, _, kind) = node.timer().active()[0];
//! node.handle_event(NodeEvent::TimerFired { id, kind });
//! ```

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use crate::agreement::AgreementRound;
use crate::config::DlarpConfig;
use crate::discovery::DiscoveryTables;
use crate::neighbor::NeighborTable;
use crate::observer::{Observer, ProtocolEvent};
use crate::table::RoutingTable;
use crate::time::Timestamp;
use crate::traits::{Clock, Random, Timer, TimerId, TimerKind, Transport};
use crate::types::{
    Address, Error, InterfaceId, RequestId, RoutingTableEntry, DEFAULT_LINK_COST, DLARP_PORT,
};
use crate::wire::{Decode, DlarpMessage, Encode, MessageType};

/// Input pushed into a node by its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A datagram arrived on `iface` from neighbor `from`.
    PacketArrived {
        iface: InterfaceId,
        from: Address,
        data: Vec<u8>,
    },
    /// A timer scheduled through [`Timer::schedule`] came due.
    TimerFired { id: TimerId, kind: TimerKind },
}

/// The main protocol node.
///
/// Generic over:
/// - `T`: Transport implementation
/// - `Tm`: Timer scheduler
/// - `R`: Random number generator
/// - `Clk`: Clock
/// - `O`: Observer receiving protocol events
pub struct Node<T, Tm, R, Clk, O> {
    // Dependencies (injected)
    pub(crate) transport: T,
    pub(crate) timer: Tm,
    pub(crate) random: R,
    pub(crate) clock: Clk,
    pub(crate) observer: O,

    pub(crate) config: DlarpConfig,
    pub(crate) interfaces: BTreeMap<InterfaceId, Address>,
    attached: bool,

    // Counters
    seq_no: u32,
    pub(crate) next_request_id: RequestId,

    // Tables
    pub(crate) neighbors: NeighborTable,
    pub(crate) routes: RoutingTable,
    pub(crate) discovery: DiscoveryTables,
    pub(crate) rounds: BTreeMap<RequestId, AgreementRound>,

    // Periodic timers, at most one of each outstanding
    pub(crate) hello_timer: Option<TimerId>,
    pub(crate) sweep_timer: Option<TimerId>,
}

impl<T, Tm, R, Clk, O> Node<T, Tm, R, Clk, O>
where
    T: Transport,
    Tm: Timer,
    R: Random,
    Clk: Clock,
    O: Observer,
{
    /// Create a node with no interfaces. Fails if `config` does not validate.
    pub fn new(
        config: DlarpConfig,
        transport: T,
        timer: Tm,
        random: R,
        clock: Clk,
        observer: O,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            transport,
            timer,
            random,
            clock,
            observer,
            neighbors: NeighborTable::new(config.max_neighbors),
            routes: RoutingTable::new(config.max_routes_per_destination),
            discovery: DiscoveryTables::new(config.max_seen_requests),
            rounds: BTreeMap::new(),
            config,
            interfaces: BTreeMap::new(),
            attached: false,
            seq_no: 0,
            next_request_id: 0,
            hello_timer: None,
            sweep_timer: None,
        })
    }

    // --- Lifecycle ---

    /// Bring up `iface` with local address `addr` and open its endpoint.
    ///
    /// On bind failure the interface is not started and
    /// [`Error::EndpointBindFailure`] is returned.
    pub fn interface_up(&mut self, iface: InterfaceId, addr: Address) -> Result<(), Error> {
        match self.interfaces.get(&iface) {
            Some(current) if *current == addr => return Ok(()),
            Some(_) => self.interface_down(iface)?,
            None => {}
        }
        let now = self.now();
        if self.transport.bind(iface, addr, DLARP_PORT).is_err() {
            self.emit(now, ProtocolEvent::EndpointBindFailed { iface, addr });
            return Err(Error::EndpointBindFailure { iface });
        }
        self.interfaces.insert(iface, addr);
        self.emit(now, ProtocolEvent::InterfaceUp { iface, addr });
        Ok(())
    }

    /// Tear down `iface` and drop all state learned through it.
    pub fn interface_down(&mut self, iface: InterfaceId) -> Result<(), Error> {
        if self.interfaces.remove(&iface).is_none() {
            return Err(Error::UnknownInterface(iface));
        }
        self.transport.close(iface);
        for neighbor in self.neighbors.remove_interface(iface) {
            self.routes.remove_via(neighbor);
        }
        self.routes.remove_interface(iface);
        self.forget_interface_paths(iface);
        let now = self.now();
        self.emit(now, ProtocolEvent::InterfaceDown { iface });
        Ok(())
    }

    /// An address was removed from `iface`. Tears the interface down if it was its address.
    pub fn address_removed(&mut self, iface: InterfaceId, addr: Address) -> Result<(), Error> {
        match self.interfaces.get(&iface) {
            None => Err(Error::UnknownInterface(iface)),
            Some(current) if *current == addr => self.interface_down(iface),
            Some(_) => Ok(()),
        }
    }

    /// Join the protocol: arm the first Hello (with jitter) and the sweep.
    ///
    /// Calling this again has no effect.
    pub fn attach(&mut self) {
        if self.attached {
            return;
        }
        self.attached = true;
        let now = self.now();
        self.schedule_hello(now);
        self.schedule_sweep(now);
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Reseed the jitter source on stream `stream`. Returns the number of streams used.
    pub fn assign_stream(&mut self, stream: u64) -> u64 {
        self.random.reseed(stream);
        1
    }

    // --- Event entry point ---

    /// Single entry point for everything the environment delivers.
    pub fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::PacketArrived { iface, from, data } => self.handle_packet(iface, from, &data),
            NodeEvent::TimerFired { id, kind } => self.handle_timer(id, kind),
        }
    }

    /// Decode and dispatch one inbound datagram.
    pub fn handle_packet(&mut self, iface: InterfaceId, from: Address, data: &[u8]) {
        if !self.interfaces.contains_key(&iface) || self.is_local(from) {
            return;
        }
        let now = self.now();
        let msg = match DlarpMessage::decode_from_slice(data) {
            Ok(msg) => msg,
            Err(error) => {
                self.emit(
                    now,
                    ProtocolEvent::MalformedPacket {
                        iface,
                        from,
                        len: data.len(),
                        error,
                    },
                );
                return;
            }
        };
        self.emit(
            now,
            ProtocolEvent::MessageReceived {
                iface,
                from,
                message: msg,
            },
        );

        match msg.kind {
            MessageType::Hello => self.handle_hello(iface, &msg, now),
            MessageType::RouteRequest => self.handle_route_request(iface, from, &msg, now),
            MessageType::RouteReply => self.handle_route_reply(iface, from, &msg, now),
            MessageType::Agreement => self.handle_agreement(iface, from, &msg, now),
        }
    }

    /// Dispatch a fired timer. Stale or cancelled ids are ignored.
    pub fn handle_timer(&mut self, id: TimerId, kind: TimerKind) {
        let now = self.now();
        match kind {
            TimerKind::Hello => {
                if self.hello_timer == Some(id) {
                    self.hello_timer = None;
                    self.on_hello_timer(now);
                }
            }
            TimerKind::NeighborSweep => {
                if self.sweep_timer == Some(id) {
                    self.sweep_timer = None;
                    self.on_sweep_timer(now);
                }
            }
            TimerKind::DiscoveryTimeout { request_id } => {
                let current = self
                    .discovery
                    .pending
                    .get_mut(&request_id)
                    .filter(|p| p.timer == Some(id));
                if let Some(p) = current {
                    p.timer = None;
                    self.on_discovery_timeout(request_id, now);
                }
            }
            TimerKind::AgreementWindow { request_id } => {
                let current = self
                    .rounds
                    .get(&request_id)
                    .is_some_and(|r| r.timer == Some(id));
                if current {
                    self.close_agreement_window(request_id, now);
                }
            }
        }
    }

    // --- Queries ---

    /// True iff `addr` sent a Hello within the neighbor timeout.
    pub fn is_neighbor(&self, addr: Address) -> bool {
        self.neighbors.is_neighbor(addr, self.now())
    }

    /// Best usable route to `destination`: not expired, next hop still a live neighbor.
    pub fn best_route(&self, destination: Address) -> Option<RoutingTableEntry> {
        self.best_route_where(destination, self.now(), |_| true)
    }

    pub(crate) fn best_route_where(
        &self,
        destination: Address,
        now: Timestamp,
        filter: impl Fn(&RoutingTableEntry) -> bool,
    ) -> Option<RoutingTableEntry> {
        self.routes.best_route_where(destination, now, |e| {
            self.neighbors.is_neighbor(e.next_hop, now) && filter(e)
        })
    }

    /// Write the routing table, prefixed by our primary address and the current time.
    pub fn print_routing_table<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        match self.primary_address() {
            Some(addr) => writeln!(out, "Node: {}, Time: {}, DLARP Routing table", addr, self.now())?,
            None => writeln!(out, "Node: (no interfaces), Time: {}, DLARP Routing table", self.now())?,
        }
        write!(out, "{}", self.routes)
    }

    /// Address of the lowest-numbered interface, used as our originator identity.
    pub fn primary_address(&self) -> Option<Address> {
        self.interfaces.values().next().copied()
    }

    pub fn interfaces(&self) -> &BTreeMap<InterfaceId, Address> {
        &self.interfaces
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn config(&self) -> &DlarpConfig {
        &self.config
    }

    /// Last sequence number used.
    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timer(&self) -> &Tm {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut Tm {
        &mut self.timer
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    // --- Internal helpers ---

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Sequence number for the next originated message.
    pub(crate) fn next_seq(&mut self) -> u32 {
        self.seq_no = self.seq_no.wrapping_add(1);
        self.seq_no
    }

    pub(crate) fn emit(&mut self, now: Timestamp, event: ProtocolEvent) {
        self.observer.emit(now, event);
    }

    pub(crate) fn is_local(&self, addr: Address) -> bool {
        self.interfaces.values().any(|a| *a == addr)
    }

    pub(crate) fn interface_of(&self, addr: Address) -> Option<InterfaceId> {
        self.interfaces
            .iter()
            .find(|(_, a)| **a == addr)
            .map(|(i, _)| *i)
    }

    pub(crate) fn link_cost(&self, iface: InterfaceId, neighbor: Address) -> f64 {
        match self.transport.link_cost(iface, neighbor) {
            Some(cost) if cost >= 0.0 => cost,
            _ => DEFAULT_LINK_COST,
        }
    }

    pub(crate) fn send_broadcast(&mut self, iface: InterfaceId, msg: DlarpMessage, now: Timestamp) {
        self.transport.broadcast(iface, msg.encode_to_vec());
        self.emit(
            now,
            ProtocolEvent::MessageSent {
                iface,
                to: None,
                message: msg,
            },
        );
    }

    pub(crate) fn send_unicast(
        &mut self,
        iface: InterfaceId,
        to: Address,
        msg: DlarpMessage,
        now: Timestamp,
    ) {
        self.transport.send_to(iface, to, msg.encode_to_vec());
        self.emit(
            now,
            ProtocolEvent::MessageSent {
                iface,
                to: Some(to),
                message: msg,
            },
        );
    }

    /// Broadcast the same message on every interface.
    pub(crate) fn broadcast_all(&mut self, msg: DlarpMessage, now: Timestamp) {
        let ifaces: Vec<InterfaceId> = self.interfaces.keys().copied().collect();
        for iface in ifaces {
            self.send_broadcast(iface, msg, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use core::net::Ipv4Addr;

    use super::*;
    use crate::time::Duration;
    use crate::traits::test_impls::{
        MockClock, MockRandom, MockTimer, MockTransport, RecordingObserver,
    };

    type TestNode = Node<MockTransport, MockTimer, MockRandom, MockClock, RecordingObserver>;

    fn addr(last: u8) -> Address {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn node() -> TestNode {
        let mut n = Node::new(
            DlarpConfig::default(),
            MockTransport::new(),
            MockTimer::new(),
            MockRandom::new(),
            MockClock::new(),
            RecordingObserver::new(),
        )
        .unwrap();
        n.interface_up(1, addr(1)).unwrap();
        n
    }

    fn hello_from(n: &mut TestNode, from: u8, seq: u32) {
        let data = DlarpMessage::hello(seq, addr(from)).encode_to_vec();
        n.handle_event(NodeEvent::PacketArrived {
            iface: 1,
            from: addr(from),
            data,
        });
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DlarpConfig {
            route_timeout: Duration::ZERO,
            ..DlarpConfig::default()
        };
        let result = Node::new(
            config,
            MockTransport::new(),
            MockTimer::new(),
            MockRandom::new(),
            MockClock::new(),
            RecordingObserver::new(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_malformed_packet_changes_nothing() {
        let mut n = node();
        hello_from(&mut n, 2, 1);
        let routes_before = n.routing_table().len();
        let neighbors_before = n.neighbors().len();
        let seq_before = n.seq_no();

        n.handle_packet(1, addr(3), &[1, 2, 3]);

        assert_eq!(n.routing_table().len(), routes_before);
        assert_eq!(n.neighbors().len(), neighbors_before);
        assert_eq!(n.seq_no(), seq_before);
        assert!(n.transport().sent().is_empty());
        assert_eq!(
            n.observer()
                .count(|e| matches!(e, ProtocolEvent::MalformedPacket { len: 3, .. })),
            1
        );
    }

    #[test]
    fn test_attach_schedules_single_hello_with_jitter() {
        let mut n = node();
        n.attach();
        n.attach();
        assert_eq!(n.timer().count(TimerKind::Hello), 1);
        assert_eq!(n.timer().count(TimerKind::NeighborSweep), 1);

        let (_, at) = n.timer().find(TimerKind::Hello).unwrap();
        assert!(at >= Timestamp::from_millis(1000));
        assert!(at <= Timestamp::from_millis(1100));
    }

    #[test]
    fn test_hello_fire_broadcasts_and_rearms() {
        let mut n = node();
        n.interface_up(2, addr(101)).unwrap();
        n.attach();
        let (id, at) = n.timer().find(TimerKind::Hello).unwrap();
        n.clock().set(at);
        n.timer_mut().fire(id);
        n.handle_timer(id, TimerKind::Hello);

        let sent = n.transport_mut().take_sent();
        assert_eq!(sent.len(), 2);
        let first = DlarpMessage::decode_from_slice(&sent[0].data).unwrap();
        let second = DlarpMessage::decode_from_slice(&sent[1].data).unwrap();
        assert_eq!(first.kind, MessageType::Hello);
        assert_eq!(first.src, addr(1));
        assert_eq!(second.src, addr(101));
        // One increment per fire, shared by every interface.
        assert_eq!(first.seq_no, 1);
        assert_eq!(second.seq_no, 1);

        assert_eq!(n.timer().count(TimerKind::Hello), 1);
        let (_, next) = n.timer().find(TimerKind::Hello).unwrap();
        assert!(next >= at + Duration::from_secs(1));
    }

    #[test]
    fn test_stale_timer_ignored() {
        let mut n = node();
        n.attach();
        n.handle_timer(TimerId(999), TimerKind::Hello);
        assert!(n.transport().sent().is_empty());
        assert_eq!(n.timer().count(TimerKind::Hello), 1);
    }

    #[test]
    fn test_hello_creates_neighbor_and_direct_route() {
        let mut n = node();
        n.transport_mut().set_link_cost(1, addr(2), 0.5);
        hello_from(&mut n, 2, 1);

        assert!(n.is_neighbor(addr(2)));
        let route = n.best_route(addr(2)).unwrap();
        assert_eq!(route.next_hop, addr(2));
        assert_eq!(route.metric, 0.5);
        assert_eq!(route.hop_count, 1);
        assert_eq!(
            n.observer()
                .count(|e| matches!(e, ProtocolEvent::NeighborUp { .. })),
            1
        );
    }

    #[test]
    fn test_neighbor_lapses_and_routes_excluded() {
        let mut n = node();
        hello_from(&mut n, 2, 1);
        n.routes.upsert(RoutingTableEntry {
            destination: addr(9),
            next_hop: addr(2),
            interface: 1,
            seq_no: 4,
            metric: 3.0,
            hop_count: 3,
            lifetime: Timestamp::from_secs(60),
        });
        assert!(n.best_route(addr(9)).is_some());

        n.clock().set(Timestamp::from_secs(10));
        assert!(!n.is_neighbor(addr(2)));
        assert!(n.best_route(addr(9)).is_none());
        // Lazy: still stored until the sweep runs.
        assert!(n.routing_table().best_route(addr(9), n.now()).is_some());
    }

    #[test]
    fn test_sweep_removes_expired_neighbor_state() {
        let mut n = node();
        n.attach();
        hello_from(&mut n, 2, 1);
        n.clock().set(Timestamp::from_secs(11));

        let (id, _) = n.timer().find(TimerKind::NeighborSweep).unwrap();
        n.timer_mut().fire(id);
        n.handle_timer(id, TimerKind::NeighborSweep);

        assert!(n.neighbors().is_empty());
        assert!(n.routing_table().is_empty());
        assert_eq!(
            n.observer()
                .count(|e| matches!(e, ProtocolEvent::NeighborExpired { .. })),
            1
        );
        assert_eq!(n.timer().count(TimerKind::NeighborSweep), 1);
    }

    #[test]
    fn test_bind_failure_keeps_interface_down() {
        let mut n = node();
        n.transport_mut().refuse_bind(2);
        assert_eq!(
            n.interface_up(2, addr(50)),
            Err(Error::EndpointBindFailure { iface: 2 })
        );
        assert!(!n.interfaces().contains_key(&2));

        // Packets on the failed interface are not processed.
        let data = DlarpMessage::hello(1, addr(51)).encode_to_vec();
        n.handle_packet(2, addr(51), &data);
        assert!(!n.is_neighbor(addr(51)));
    }

    #[test]
    fn test_interface_down_drops_state() {
        let mut n = node();
        n.interface_up(2, addr(100)).unwrap();
        let data = DlarpMessage::hello(1, addr(102)).encode_to_vec();
        n.handle_packet(2, addr(102), &data);
        hello_from(&mut n, 2, 1);
        assert!(n.is_neighbor(addr(102)));

        n.interface_down(2).unwrap();
        assert!(!n.transport().is_bound(2));
        assert!(!n.is_neighbor(addr(102)));
        assert!(n.best_route(addr(102)).is_none());
        assert!(n.is_neighbor(addr(2)));
        assert_eq!(n.interface_down(2), Err(Error::UnknownInterface(2)));
    }

    #[test]
    fn test_address_removed() {
        let mut n = node();
        assert!(n.address_removed(1, addr(77)).is_ok());
        assert!(n.interfaces().contains_key(&1));
        n.address_removed(1, addr(1)).unwrap();
        assert!(n.interfaces().is_empty());
        assert_eq!(n.primary_address(), None);
    }

    #[test]
    fn test_own_packets_ignored() {
        let mut n = node();
        let data = DlarpMessage::hello(1, addr(1)).encode_to_vec();
        n.handle_packet(1, addr(1), &data);
        assert!(n.neighbors().is_empty());
    }

    #[test]
    fn test_print_routing_table() {
        let mut n = node();
        hello_from(&mut n, 2, 1);
        let mut out = String::new();
        n.print_routing_table(&mut out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Node: 10.0.0.1, Time: 0.000s, DLARP Routing table");
        assert!(lines[1].starts_with("Destination"));
        assert!(lines[2].starts_with("10.0.0.2"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_assign_stream_reseeds() {
        let mut a = node();
        let mut b = node();
        assert_eq!(a.assign_stream(42), 1);
        b.assign_stream(42);
        a.attach();
        b.attach();
        assert_eq!(
            a.timer().find(TimerKind::Hello).map(|(_, at)| at),
            b.timer().find(TimerKind::Hello).map(|(_, at)| at)
        );
    }

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let mut n = node();
        hello_from(&mut n, 2, 1);
        n.attach();
        let mut last = 0;
        for target in [20u8, 21, 22] {
            n.send_route_request(addr(target)).unwrap();
            let (id, at) = n.timer().find(TimerKind::Hello).unwrap();
            n.clock().set(at);
            n.timer_mut().fire(id);
            n.handle_timer(id, TimerKind::Hello);
        }
        for sent in n.transport_mut().take_sent() {
            let msg = DlarpMessage::decode_from_slice(&sent.data).unwrap();
            assert!(msg.seq_no > last, "seq {} after {}", msg.seq_no, last);
            last = msg.seq_no;
        }
        assert_eq!(last, n.seq_no());
    }
}
