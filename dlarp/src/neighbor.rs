//! Neighbor liveness tracking through periodic Hello exchange.
//!
//! A neighbor is *live* while its record's expiry lies strictly in the
//! future. Expiry is checked on every read, so a record that timed out is
//! invisible even before the periodic sweep physically removes it.

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::node::Node;
use crate::observer::{Observer, ProtocolEvent};
use crate::time::Timestamp;
use crate::traits::{Clock, Random, Timer, TimerKind, Transport};
use crate::types::{Address, InterfaceId, RoutingTableEntry};
use crate::wire::DlarpMessage;

/// One directly reachable peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeighborRecord {
    pub addr: Address,
    /// Interface the last Hello arrived on.
    pub iface: InterfaceId,
    pub expiry: Timestamp,
    /// Highest Hello sequence number seen while the record was live.
    pub last_seq: u32,
}

impl NeighborRecord {
    #[inline]
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.expiry > now
    }
}

/// Result of feeding a Hello into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelloOutcome {
    /// First Hello, or first after the previous record expired.
    New,
    Refreshed,
    /// Sequence number not newer than the live record's. Ignored.
    Stale,
    /// Table full of live neighbors. Ignored.
    Full,
}

/// Live-neighbor set of one node.
#[derive(Debug)]
pub struct NeighborTable {
    records: HashMap<Address, NeighborRecord>,
    capacity: usize,
}

impl NeighborTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            capacity,
        }
    }

    /// Insert or refresh `addr` with expiry `now + timeout`.
    pub fn refresh(
        &mut self,
        addr: Address,
        iface: InterfaceId,
        seq: u32,
        now: Timestamp,
        timeout: crate::time::Duration,
    ) -> HelloOutcome {
        let expiry = now + timeout;
        if let Some(record) = self.records.get_mut(&addr) {
            if record.is_live(now) {
                if seq <= record.last_seq {
                    return HelloOutcome::Stale;
                }
                record.iface = iface;
                record.expiry = expiry;
                record.last_seq = seq;
                return HelloOutcome::Refreshed;
            }
            *record = NeighborRecord {
                addr,
                iface,
                expiry,
                last_seq: seq,
            };
            return HelloOutcome::New;
        }

        if self.records.len() >= self.capacity {
            self.sweep(now);
            if self.records.len() >= self.capacity {
                return HelloOutcome::Full;
            }
        }
        self.records.insert(
            addr,
            NeighborRecord {
                addr,
                iface,
                expiry,
                last_seq: seq,
            },
        );
        HelloOutcome::New
    }

    /// True iff a non-expired record exists for `addr`.
    pub fn is_neighbor(&self, addr: Address, now: Timestamp) -> bool {
        self.get(addr, now).is_some()
    }

    /// The live record for `addr`.
    pub fn get(&self, addr: Address, now: Timestamp) -> Option<&NeighborRecord> {
        self.records.get(&addr).filter(|r| r.is_live(now))
    }

    pub fn live(&self, now: Timestamp) -> impl Iterator<Item = &NeighborRecord> + '_ {
        self.records.values().filter(move |r| r.is_live(now))
    }

    pub fn live_count(&self, now: Timestamp) -> usize {
        self.live(now).count()
    }

    /// Physically remove expired records, returning their addresses.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<Address> {
        let expired: Vec<Address> = self
            .records
            .values()
            .filter(|r| !r.is_live(now))
            .map(|r| r.addr)
            .collect();
        for addr in &expired {
            self.records.remove(addr);
        }
        expired
    }

    /// Drop every neighbor learned on `iface`.
    pub fn remove_interface(&mut self, iface: InterfaceId) -> Vec<Address> {
        let gone: Vec<Address> = self
            .records
            .values()
            .filter(|r| r.iface == iface)
            .map(|r| r.addr)
            .collect();
        for addr in &gone {
            self.records.remove(addr);
        }
        gone
    }

    /// Records held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T, Tm, R, Clk, O> Node<T, Tm, R, Clk, O>
where
    T: Transport,
    Tm: Timer,
    R: Random,
    Clk: Clock,
    O: Observer,
{
    /// Hello timer fired: announce ourselves on every interface and rearm.
    pub(crate) fn on_hello_timer(&mut self, now: Timestamp) {
        let seq = self.next_seq();
        let interfaces: Vec<(InterfaceId, Address)> =
            self.interfaces.iter().map(|(i, a)| (*i, *a)).collect();
        for (iface, addr) in interfaces {
            self.send_broadcast(iface, DlarpMessage::hello(seq, addr), now);
        }
        self.schedule_hello(now);
    }

    /// Arm the Hello timer at `now + HelloInterval + jitter`.
    pub(crate) fn schedule_hello(&mut self, now: Timestamp) {
        if let Some(id) = self.hello_timer.take() {
            self.timer.cancel(id);
        }
        let interval = self.config.hello_interval;
        let max_jitter = interval
            .mul_fraction(self.config.hello_jitter_fraction)
            .as_millis();
        let jitter = self.random.gen_range(0, max_jitter + 1);
        let at = now + interval + crate::time::Duration::from_millis(jitter);
        self.hello_timer = Some(self.timer.schedule(at, TimerKind::Hello));
    }

    /// Arm the cleanup sweep.
    pub(crate) fn schedule_sweep(&mut self, now: Timestamp) {
        if let Some(id) = self.sweep_timer.take() {
            self.timer.cancel(id);
        }
        let at = now + self.config.neighbor_sweep_interval;
        self.sweep_timer = Some(self.timer.schedule(at, TimerKind::NeighborSweep));
    }

    pub(crate) fn handle_hello(&mut self, iface: InterfaceId, msg: &DlarpMessage, now: Timestamp) {
        let neighbor = msg.src;
        let outcome =
            self.neighbors
                .refresh(neighbor, iface, msg.seq_no, now, self.config.neighbor_timeout);
        match outcome {
            HelloOutcome::Stale | HelloOutcome::Full => return,
            HelloOutcome::New => self.emit(
                now,
                ProtocolEvent::NeighborUp {
                    addr: neighbor,
                    iface,
                },
            ),
            HelloOutcome::Refreshed => {}
        }

        let direct = RoutingTableEntry {
            destination: neighbor,
            next_hop: neighbor,
            interface: iface,
            seq_no: msg.seq_no,
            metric: self.link_cost(iface, neighbor),
            hop_count: 1,
            lifetime: now + self.config.neighbor_timeout,
        };
        self.routes.upsert(direct);

        self.cancel_discovery_for(neighbor, now);
    }

    /// Sweep fired: drop expired neighbors and everything that depended on them.
    pub(crate) fn on_sweep_timer(&mut self, now: Timestamp) {
        for addr in self.neighbors.sweep(now) {
            self.routes.remove_via(addr);
            self.emit(now, ProtocolEvent::NeighborExpired { addr });
        }
        self.routes.prune(now);
        self.prune_discovery_state(now);
        self.schedule_sweep(now);
    }
}
