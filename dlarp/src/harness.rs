//! In-memory multi-node network for protocol tests.
//!
//! Nodes share a single virtual clock. Datagrams are delivered with zero
//! delay: broadcasts reach every linked node, unicasts reach the linked node
//! owning the destination address. Each node has one interface (id 1).

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::config::DlarpConfig;
use crate::node::{Node, NodeEvent};
use crate::observer::ProtocolEvent;
use crate::time::Timestamp;
use crate::traits::test_impls::{
    MockClock, MockRandom, MockTimer, MockTransport, RecordingObserver,
};
use crate::types::Address;

pub type TestNode = Node<MockTransport, MockTimer, MockRandom, MockClock, RecordingObserver>;

pub const IFACE: u32 = 1;

/// Delivery rounds allowed per `pump` before assuming a forwarding loop.
const PUMP_LIMIT: usize = 10_000;

pub struct Net {
    pub nodes: Vec<TestNode>,
    links: BTreeSet<(usize, usize)>,
    now: Timestamp,
}

impl Net {
    /// `n` unlinked nodes; node `i` owns 10.0.0.(i + 1).
    pub fn new(n: usize, config: DlarpConfig) -> Self {
        let nodes = (0..n)
            .map(|i| {
                let mut node = Node::new(
                    config.clone(),
                    MockTransport::new(),
                    MockTimer::new(),
                    MockRandom::with_seed(i as u64 + 1),
                    MockClock::new(),
                    RecordingObserver::new(),
                )
                .unwrap();
                node.interface_up(IFACE, Self::addr(i)).unwrap();
                node
            })
            .collect();
        Self {
            nodes,
            links: BTreeSet::new(),
            now: Timestamp::ZERO,
        }
    }

    /// `n` nodes linked 0 - 1 - ... - (n - 1).
    pub fn chain(n: usize, config: DlarpConfig) -> Self {
        let mut net = Self::new(n, config);
        for i in 1..n {
            net.link(i - 1, i);
        }
        net
    }

    pub fn addr(i: usize) -> Address {
        Ipv4Addr::new(10, 0, 0, i as u8 + 1)
    }

    pub fn index_of(&self, addr: Address) -> Option<usize> {
        (0..self.nodes.len()).find(|i| Self::addr(*i) == addr)
    }

    pub fn link(&mut self, a: usize, b: usize) {
        self.links.insert((a.min(b), a.max(b)));
    }

    pub fn unlink(&mut self, a: usize, b: usize) {
        self.links.remove(&(a.min(b), a.max(b)));
    }

    pub fn linked(&self, a: usize, b: usize) -> bool {
        self.links.contains(&(a.min(b), a.max(b)))
    }

    /// Symmetric link cost reported by both transports.
    pub fn set_cost(&mut self, a: usize, b: usize, cost: f64) {
        self.nodes[a]
            .transport_mut()
            .set_link_cost(IFACE, Self::addr(b), cost);
        self.nodes[b]
            .transport_mut()
            .set_link_cost(IFACE, Self::addr(a), cost);
    }

    pub fn attach_all(&mut self) {
        for node in &mut self.nodes {
            node.attach();
        }
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    fn set_time(&mut self, at: Timestamp) {
        self.now = at;
        for node in &self.nodes {
            node.clock().set(at);
        }
    }

    /// Deliver queued datagrams until every transport is quiet.
    pub fn pump(&mut self) {
        let mut rounds = 0;
        while self.step() {
            rounds += 1;
            assert!(rounds < PUMP_LIMIT, "datagrams never settled");
        }
    }

    /// Deliver everything queued right now. Returns false if nothing was queued.
    pub fn step(&mut self) -> bool {
        let mut queued = Vec::new();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            for d in node.transport_mut().take_sent() {
                queued.push((i, d));
            }
        }
        if queued.is_empty() {
            return false;
        }
        for (from, d) in queued {
            let receivers: Vec<usize> = match d.to {
                None => (0..self.nodes.len())
                    .filter(|j| *j != from && self.linked(from, *j))
                    .collect(),
                Some(dest) => self
                    .index_of(dest)
                    .filter(|j| self.linked(from, *j))
                    .into_iter()
                    .collect(),
            };
            for j in receivers {
                self.nodes[j].handle_event(NodeEvent::PacketArrived {
                    iface: IFACE,
                    from: Self::addr(from),
                    data: d.data.clone(),
                });
            }
        }
        true
    }

    /// Fire every timer due at or before `until` in deadline order, pumping after each.
    pub fn run_until(&mut self, until: Timestamp) {
        self.pump();
        loop {
            let next = self
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.timer().active().first().map(|t| (t.1, i, t.0, t.2)))
                .filter(|(at, ..)| *at <= until)
                .min_by_key(|(at, i, id, _)| (*at, *i, *id));
            let Some((at, i, id, kind)) = next else {
                break;
            };
            self.set_time(at.max(self.now));
            self.nodes[i].timer_mut().fire(id);
            self.nodes[i].handle_event(NodeEvent::TimerFired { id, kind });
            self.pump();
        }
        self.set_time(until.max(self.now));
    }

    /// Attach everything and run long enough for every node to Hello at least once.
    pub fn converge_neighbors(&mut self) {
        self.attach_all();
        let at = self.now + self.nodes[0].config().hello_interval * 2;
        self.run_until(at);
    }

    pub fn events(&self, i: usize) -> &[(Timestamp, ProtocolEvent)] {
        &self.nodes[i].observer().events
    }

    pub fn count(&self, i: usize, pred: impl Fn(&ProtocolEvent) -> bool) -> usize {
        self.nodes[i].observer().count(pred)
    }
}
