//! SimNode wrapper for simulated dlarp nodes.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use dlarp::traits::{Clock, Random, Timer, TimerId, TimerKind, Transport};
use dlarp::{
    Address, DataHeader, DlarpConfig, Duration, Error, InputCallbacks, InterfaceId, MessageType,
    Node, Observer, ProtocolEvent, Route, Timestamp, TracingObserver,
};
use hashbrown::{HashMap, HashSet};

use crate::metrics::ControlCounters;

/// The only interface every simulated node has.
pub const SIM_IFACE: InterfaceId = 1;

const FIRST_ADDRESS: u32 = 0x0A01_0001; // 10.1.0.1

/// Address owned by node `index`.
pub fn node_address(index: usize) -> Address {
    Ipv4Addr::from(FIRST_ADDRESS.wrapping_add(index as u32))
}

/// Inverse of [`node_address`], without a bound check on the node count.
pub fn node_index(addr: Address) -> Option<usize> {
    u32::from(addr)
        .checked_sub(FIRST_ADDRESS)
        .map(|offset| offset as usize)
}

/// A datagram handed to the simulated radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub iface: InterfaceId,
    /// `None` for broadcast.
    pub to: Option<Address>,
    pub data: Vec<u8>,
}

/// Transport that queues sends until the simulator collects them.
#[derive(Debug, Default)]
pub struct SimTransport {
    bound: HashMap<InterfaceId, Address>,
    costs: HashMap<Address, f64>,
    outgoing: Vec<Outgoing>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, iface: InterfaceId) -> bool {
        self.bound.contains_key(&iface)
    }

    /// Replace the link costs reported to the protocol.
    pub fn set_link_costs(&mut self, costs: HashMap<Address, f64>) {
        self.costs = costs;
    }

    /// Take all datagrams queued since the last call.
    pub fn take_sent(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoing)
    }
}

impl Transport for SimTransport {
    type Error = Error;

    fn bind(&mut self, iface: InterfaceId, local: Address, _port: u16) -> Result<(), Self::Error> {
        if self.bound.values().any(|a| *a == local) {
            return Err(Error::EndpointBindFailure { iface });
        }
        self.bound.insert(iface, local);
        Ok(())
    }

    fn close(&mut self, iface: InterfaceId) {
        self.bound.remove(&iface);
    }

    fn broadcast(&mut self, iface: InterfaceId, data: Vec<u8>) {
        self.outgoing.push(Outgoing {
            iface,
            to: None,
            data,
        });
    }

    fn send_to(&mut self, iface: InterfaceId, dest: Address, data: Vec<u8>) {
        self.outgoing.push(Outgoing {
            iface,
            to: Some(dest),
            data,
        });
    }

    fn link_cost(&self, _iface: InterfaceId, neighbor: Address) -> Option<f64> {
        self.costs.get(&neighbor).copied()
    }
}

/// Timer that hands schedule requests to the simulator's event queue.
#[derive(Debug, Default)]
pub struct SimTimer {
    next_id: u64,
    scheduled: Vec<(TimerId, Timestamp, TimerKind)>,
    cancelled: HashSet<TimerId>,
}

impl SimTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers scheduled since the last call.
    pub fn take_scheduled(&mut self) -> Vec<(TimerId, Timestamp, TimerKind)> {
        std::mem::take(&mut self.scheduled)
    }

    /// Consume a due timer. Returns false if it was cancelled.
    pub fn take_due(&mut self, id: TimerId) -> bool {
        !self.cancelled.remove(&id)
    }
}

impl Timer for SimTimer {
    fn schedule(&mut self, at: Timestamp, kind: TimerKind) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.scheduled.push((id, at, kind));
        id
    }

    fn cancel(&mut self, id: TimerId) {
        // Not yet handed to the simulator: drop it in place.
        if let Some(pos) = self.scheduled.iter().position(|(s, ..)| *s == id) {
            self.scheduled.remove(pos);
            return;
        }
        self.cancelled.insert(id);
    }
}

/// Clock for simulation.
///
/// Time is controlled externally by the simulator.
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Timestamp {
        self.current.get()
    }
}

/// Deterministic LCG, one stream per node.
pub struct SimRandom {
    state: u64,
}

impl SimRandom {
    pub fn with_seed(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Random for SimRandom {
    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let range = max.saturating_sub(min);
        if range == 0 {
            return min;
        }
        min + ((self.state >> 11) % range)
    }

    fn reseed(&mut self, seed: u64) {
        self.state = seed;
    }
}

/// Counts protocol activity and forwards every event to `tracing`.
pub struct SimObserver {
    tracing: TracingObserver,
    counters: ControlCounters,
}

impl SimObserver {
    pub fn new(addr: Address) -> Self {
        Self {
            tracing: TracingObserver::new(addr),
            counters: ControlCounters::default(),
        }
    }

    pub fn counters(&self) -> &ControlCounters {
        &self.counters
    }
}

impl Observer for SimObserver {
    fn emit(&mut self, now: Timestamp, event: ProtocolEvent) {
        let c = &mut self.counters;
        match &event {
            ProtocolEvent::MessageSent { message, .. } => match message.kind {
                MessageType::Hello => c.hello_sent += 1,
                MessageType::RouteRequest => c.rreq_sent += 1,
                MessageType::RouteReply => c.rrep_sent += 1,
                MessageType::Agreement => c.agreement_sent += 1,
            },
            ProtocolEvent::MalformedPacket { .. } => c.malformed += 1,
            ProtocolEvent::DuplicateRequest { .. } => c.duplicates_suppressed += 1,
            ProtocolEvent::DiscoveryStarted { .. } => c.discoveries += 1,
            ProtocolEvent::DiscoveryFailed { .. } => c.discovery_failures += 1,
            ProtocolEvent::DiscoveryRefused { .. } => c.discoveries_refused += 1,
            ProtocolEvent::StaleMessage { .. } => c.stale_dropped += 1,
            ProtocolEvent::RouteCommitted { .. } => c.routes_committed += 1,
            ProtocolEvent::AgreementRejected { .. } => c.agreements_rejected += 1,
            ProtocolEvent::NeighborExpired { .. } => c.neighbors_expired += 1,
            _ => {}
        }
        self.tracing.emit(now, event);
    }
}

/// Type alias for simulated nodes.
pub type SimNodeInner = Node<SimTransport, SimTimer, SimRandom, SimClock, SimObserver>;

/// Where a data packet goes after a routing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DataDecision {
    Deliver,
    Forward(Route),
    Drop(Error),
}

#[derive(Default)]
struct Decision(Option<DataDecision>);

impl InputCallbacks for Decision {
    fn local_deliver(&mut self, _packet: &[u8], _header: &DataHeader, _iface: InterfaceId) {
        self.0 = Some(DataDecision::Deliver);
    }

    fn unicast_forward(&mut self, route: &Route, _packet: &[u8], _header: &DataHeader) {
        self.0 = Some(DataDecision::Forward(*route));
    }

    fn error(&mut self, _packet: &[u8], _header: &DataHeader, error: Error) {
        self.0 = Some(DataDecision::Drop(error));
    }
}

/// Wrapper around a dlarp Node for simulation.
pub struct SimNode {
    index: usize,
    inner: SimNodeInner,
    /// When the node was created.
    pub created_at: Timestamp,
}

impl SimNode {
    /// Create node `index`, bring its interface up and join the protocol.
    pub fn new(
        index: usize,
        seed: u64,
        config: DlarpConfig,
        created_at: Timestamp,
    ) -> Result<Self, Error> {
        let addr = node_address(index);
        let mut inner = Node::new(
            config,
            SimTransport::new(),
            SimTimer::new(),
            SimRandom::with_seed(seed),
            SimClock::at(created_at),
            SimObserver::new(addr),
        )?;
        inner.assign_stream(seed.wrapping_add(index as u64));
        inner.interface_up(SIM_IFACE, addr)?;
        inner.attach();
        Ok(Self {
            index,
            inner,
            created_at,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn address(&self) -> Address {
        node_address(self.index)
    }

    /// Get a reference to the inner node.
    pub fn inner(&self) -> &SimNodeInner {
        &self.inner
    }

    /// Get a mutable reference to the inner node.
    pub fn inner_mut(&mut self) -> &mut SimNodeInner {
        &mut self.inner
    }

    pub fn counters(&self) -> &ControlCounters {
        self.inner.observer().counters()
    }

    pub fn neighbor_count(&self) -> usize {
        self.inner.neighbors().live_count(self.inner.clock().now())
    }

    pub fn has_route(&self, destination: Address) -> bool {
        self.inner.best_route(destination).is_some()
    }

    /// Deliver a control datagram from neighbor `from`.
    pub fn handle_datagram(&mut self, from: Address, data: &[u8], now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.handle_packet(SIM_IFACE, from, data);
    }

    /// Fire a timer unless it was cancelled after being queued.
    pub fn handle_timer(&mut self, id: TimerId, kind: TimerKind, now: Timestamp) {
        if !self.inner.timer_mut().take_due(id) {
            return;
        }
        self.inner.clock().set(now);
        self.inner.handle_timer(id, kind);
    }

    /// Routing decision for a packet this node originates.
    pub fn route_output(&mut self, header: &DataHeader, now: Timestamp) -> Result<Route, Error> {
        self.inner.clock().set(now);
        self.inner.route_output(header)
    }

    /// Routing decision for a packet that arrived from a neighbor.
    pub fn route_input(&mut self, payload: &[u8], header: &DataHeader, now: Timestamp) -> DataDecision {
        self.inner.clock().set(now);
        let mut decision = Decision::default();
        self.inner
            .route_input(payload, header, SIM_IFACE, &mut decision);
        decision
            .0
            .unwrap_or(DataDecision::Drop(Error::NoRouteToHost(header.destination)))
    }

    pub fn set_link_costs(&mut self, costs: HashMap<Address, f64>) {
        self.inner.transport_mut().set_link_costs(costs);
    }

    /// Drain datagrams and timers produced by the last handler.
    pub fn take_outgoing(&mut self) -> (Vec<Outgoing>, Vec<(TimerId, Timestamp, TimerKind)>) {
        let sent = self.inner.transport_mut().take_sent();
        let timers = self.inner.timer_mut().take_scheduled();
        (sent, timers)
    }

    /// Render this node's routing table.
    pub fn routing_table_dump(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.inner.print_routing_table(&mut out);
        out
    }

    /// Best route of every destination this node can currently use.
    pub fn usable_routes(&self) -> BTreeMap<Address, (Address, f64)> {
        let mut routes = BTreeMap::new();
        for e in self.inner.routing_table().sorted_entries() {
            if routes.contains_key(&e.destination) {
                continue;
            }
            if let Some(best) = self.inner.best_route(e.destination) {
                routes.insert(e.destination, (best.next_hop, best.metric));
            }
        }
        routes
    }

    /// Hello period of this node.
    pub fn hello_interval(&self) -> Duration {
        self.inner.config().hello_interval
    }
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode")
            .field("index", &self.index)
            .field("address", &self.address())
            .finish()
    }
}
