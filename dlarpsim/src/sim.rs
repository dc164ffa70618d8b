//! Discrete event simulator for dlarp networks.

use std::collections::BinaryHeap;

use dlarp::{DataHeader, DlarpConfig, Duration, Error, Timestamp};
use hashbrown::HashMap;

use crate::event::{DataPacket, Event, PacketKind, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{ControlCounters, RouteSnapshot, SimMetrics, SimulationResult};
use crate::mobility::RandomWaypoint;
use crate::node::{node_address, node_index, DataDecision, Outgoing, SimNode};
use crate::topology::Topology;

/// Node answering echo requests.
pub const ECHO_SERVER: usize = 0;

/// Data packets are dropped after this many hops.
pub const MAX_DATA_HOPS: u8 = 64;

/// Discrete event simulator for dlarp networks.
pub struct Simulator {
    nodes: Vec<SimNode>,
    topology: Topology,
    config: DlarpConfig,
    seed: u64,
    current_time: Timestamp,
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    next_seq: u64,
    /// RNG state for link loss.
    rng_state: u64,
    mobility: Option<RandomWaypoint>,
    snapshot_interval: Option<Duration>,
    next_snapshot: Option<Timestamp>,
    /// Size of generated echo payloads.
    payload_size: usize,
    /// Next data sequence number per flow source.
    packet_seq: HashMap<usize, u64>,
}

impl Simulator {
    pub fn new(seed: u64, config: DlarpConfig) -> Self {
        Self {
            nodes: Vec::new(),
            topology: Topology::new(),
            config,
            seed,
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng_state: seed,
            mobility: None,
            snapshot_interval: None,
            next_snapshot: None,
            payload_size: 64,
            packet_seq: HashMap::new(),
        }
    }

    /// Set the topology. Call before adding nodes so link costs are pushed.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self.refresh_link_costs();
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    /// Enable mobility. The first step runs one `model.step` from now.
    pub fn with_mobility(mut self, model: RandomWaypoint) -> Self {
        let at = self.current_time + model.step;
        self.mobility = Some(model);
        self.schedule(at, Event::MobilityStep);
        self
    }

    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Create the next node, attach it and return its index.
    pub fn add_node(&mut self) -> Result<usize, Error> {
        let index = self.nodes.len();
        let seed = self.seed.wrapping_add(index as u64 * 1000);
        let node = SimNode::new(index, seed, self.config.clone(), self.current_time)?;
        self.nodes.push(node);
        self.refresh_link_costs_of(index);
        self.collect_outgoing(index);
        tracing::debug!(index, addr = %node_address(index), "node added");
        Ok(index)
    }

    pub fn node(&self, index: usize) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut SimNode> {
        self.nodes.get_mut(index)
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Mutable topology. Call [`refresh_link_costs`](Self::refresh_link_costs) after changing costs.
    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    /// Every node except the echo server sends a request every `interval`,
    /// starting at `start`. Sources are staggered by 10 ms.
    pub fn start_echo_traffic(&mut self, start: Timestamp, interval: Duration) {
        for from in 0..self.nodes.len() {
            if from == ECHO_SERVER {
                continue;
            }
            let offset = Duration::from_millis(10 * from as u64 % interval.as_millis().max(1));
            self.schedule(start + offset, Event::AppSend { from, interval });
        }
    }

    /// Originate one echo request from `from` to `to` right now.
    pub fn send_data(&mut self, from: usize, to: usize) {
        let seq = self.next_packet_seq(from);
        let payload = vec![0u8; self.payload_size];
        self.originate(from, to, PacketKind::Request, seq, payload);
    }

    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while self
            .event_queue
            .peek()
            .is_some_and(|event| event.time <= end_time)
        {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
        }

        self.advance_time(end_time);
        self.take_snapshot();
        self.metrics.control = self.control_totals();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.is_empty(),
        }
    }

    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        let now = self.current_time;
        match event {
            Event::ControlDelivery { to, from, data } => {
                if let Some(node) = self.nodes.get_mut(to) {
                    node.handle_datagram(from, &data, now);
                    self.metrics.messages_delivered += 1;
                }
                self.collect_outgoing(to);
            }
            Event::TimerFire { node, id, kind } => {
                if let Some(n) = self.nodes.get_mut(node) {
                    n.handle_timer(id, kind, now);
                }
                self.collect_outgoing(node);
            }
            Event::DataDelivery { to, packet } => self.receive_data(to, packet),
            Event::AppSend { from, interval } => {
                self.send_data(from, ECHO_SERVER);
                self.schedule(now + interval, Event::AppSend { from, interval });
            }
            Event::MobilityStep => {
                let Some(model) = self.mobility.as_mut() else {
                    return;
                };
                model.advance(&mut self.topology, now);
                let next = now + model.step;
                self.refresh_link_costs();
                self.schedule(next, Event::MobilityStep);
            }
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    /// Drain a node's sends and timers into the event queue.
    fn collect_outgoing(&mut self, index: usize) {
        let Some(node) = self.nodes.get_mut(index) else {
            return;
        };
        let (sent, timers) = node.take_outgoing();
        let now = self.current_time;
        for (id, at, kind) in timers {
            self.schedule(
                at.max(now),
                Event::TimerFire {
                    node: index,
                    id,
                    kind,
                },
            );
        }
        for out in sent {
            self.route_control(index, out);
        }
    }

    /// Put a control datagram on the air.
    fn route_control(&mut self, sender: usize, out: Outgoing) {
        self.metrics.messages_sent += 1;

        let receivers = match out.to {
            None => self.topology.neighbors(sender),
            Some(dest) => node_index(dest)
                .filter(|j| *j < self.nodes.len() && self.topology.is_connected(sender, *j))
                .into_iter()
                .collect(),
        };

        let from = node_address(sender);
        for receiver in receivers {
            let Some(delay) = self.link_delay_if_delivered(sender, receiver) else {
                self.metrics.messages_dropped += 1;
                continue;
            };
            self.schedule(
                self.current_time + delay,
                Event::ControlDelivery {
                    to: receiver,
                    from,
                    data: out.data.clone(),
                },
            );
        }
    }

    /// Link delay, or `None` if the link is down or the packet is lost.
    fn link_delay_if_delivered(&mut self, a: usize, b: usize) -> Option<Duration> {
        let (loss_rate, delay) = match self.topology.get_link(a, b) {
            Some(link) if link.active => (link.loss_rate, link.delay),
            _ => return None,
        };
        if loss_rate > 0.0 && self.random_f64() < loss_rate {
            return None;
        }
        Some(delay)
    }

    fn next_packet_seq(&mut self, from: usize) -> u64 {
        let seq = self.packet_seq.entry(from).or_insert(0);
        *seq += 1;
        *seq
    }

    fn originate(&mut self, from: usize, to: usize, kind: PacketKind, seq: u64, payload: Vec<u8>) {
        let now = self.current_time;
        let header = DataHeader::new(node_address(from), node_address(to));
        self.metrics.flow_mut(from, to).record_tx(payload.len(), now);

        let Some(node) = self.nodes.get_mut(from) else {
            return;
        };
        let decision = node.route_output(&header, now);
        self.collect_outgoing(from);

        match decision {
            Ok(route) => {
                let packet = DataPacket {
                    header,
                    kind,
                    seq,
                    sent_at: now,
                    payload,
                    hops: 0,
                };
                self.transmit_data(from, route.gateway, packet);
            }
            Err(error) => {
                tracing::trace!(from, to, seq, %error, "data packet not sent");
                self.metrics.data_no_route += 1;
            }
        }
    }

    fn transmit_data(&mut self, from: usize, gateway: dlarp::Address, mut packet: DataPacket) {
        let hop = node_index(gateway).filter(|j| *j < self.nodes.len());
        let delay = hop.and_then(|to| self.link_delay_if_delivered(from, to));
        match (hop, delay) {
            (Some(to), Some(delay)) => {
                packet.hops = packet.hops.saturating_add(1);
                self.schedule(self.current_time + delay, Event::DataDelivery { to, packet });
            }
            _ => self.metrics.data_link_lost += 1,
        }
    }

    fn receive_data(&mut self, at: usize, packet: DataPacket) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(at) else {
            return;
        };
        let decision = node.route_input(&packet.payload, &packet.header, now);
        self.collect_outgoing(at);

        match decision {
            DataDecision::Deliver => {
                let Some(src) = node_index(packet.header.source) else {
                    return;
                };
                self.metrics.flow_mut(src, at).record_rx(
                    packet.payload.len(),
                    packet.sent_at,
                    packet.hops,
                    now,
                );
                if packet.kind == PacketKind::Request && at == ECHO_SERVER {
                    self.originate(at, src, PacketKind::Echo, packet.seq, packet.payload);
                }
            }
            DataDecision::Forward(_) if packet.hops >= MAX_DATA_HOPS => {
                tracing::debug!(at, seq = packet.seq, "data packet hop limit reached");
                self.metrics.data_ttl_expired += 1;
            }
            DataDecision::Forward(route) => self.transmit_data(at, route.gateway, packet),
            DataDecision::Drop(error) => {
                tracing::trace!(at, seq = packet.seq, %error, "data packet dropped");
                self.metrics.data_no_route += 1;
            }
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        tracing::debug!(time = %self.current_time, ?action, "scenario action");
        match action {
            ScenarioAction::Partition { groups } => self.topology.partition(&groups),
            ScenarioAction::HealPartition => self.topology.heal(),
            ScenarioAction::DisableLink { a, b } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { a, b } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { a, b, rate } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
            ScenarioAction::DumpTables => {
                for node in &self.nodes {
                    tracing::info!("\n{}", node.routing_table_dump());
                }
            }
        }
    }

    /// Push current link costs into every node's transport.
    pub fn refresh_link_costs(&mut self) {
        for index in 0..self.nodes.len() {
            self.refresh_link_costs_of(index);
        }
    }

    fn refresh_link_costs_of(&mut self, index: usize) {
        let costs = self
            .topology
            .neighbors(index)
            .into_iter()
            .filter_map(|j| {
                self.topology
                    .get_link(index, j)
                    .map(|link| (node_address(j), link.cost))
            })
            .collect();
        if let Some(node) = self.nodes.get_mut(index) {
            node.set_link_costs(costs);
        }
    }

    fn maybe_take_snapshot(&mut self) {
        let Some(next) = self.next_snapshot else {
            return;
        };
        if self.current_time >= next {
            self.take_snapshot();
            self.next_snapshot = self.snapshot_interval.map(|interval| next + interval);
        }
    }

    pub fn take_snapshot(&mut self) {
        let mut snapshot = RouteSnapshot::new(self.current_time);
        let sink = node_address(ECHO_SERVER);
        for node in &self.nodes {
            snapshot.record_node(
                node.neighbor_count(),
                node.usable_routes().len(),
                node.index() == ECHO_SERVER || node.has_route(sink),
            );
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Every node's routing table, in node order.
    pub fn routing_tables(&self) -> String {
        self.nodes
            .iter()
            .map(SimNode::routing_table_dump)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn control_totals(&self) -> ControlCounters {
        let mut total = ControlCounters::default();
        for node in &self.nodes {
            total.add(node.counters());
        }
        total
    }

    /// Uniform in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}
