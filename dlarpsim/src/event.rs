//! Event types and priority queue ordering for discrete event simulation.

use std::cmp::Ordering;

use dlarp::{Address, DataHeader, Duration, TimerId, TimerKind, Timestamp};

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Cut every link between groups.
    Partition { groups: Vec<Vec<usize>> },
    /// Re-enable every link.
    HealPartition,
    DisableLink { a: usize, b: usize },
    EnableLink { a: usize, b: usize },
    SetLossRate { a: usize, b: usize, rate: f64 },
    /// Record a routing snapshot.
    TakeSnapshot,
    /// Log every node's routing table.
    DumpTables,
}

/// Whether a data packet is a request or the echo server's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Request,
    Echo,
}

/// A data packet in flight.
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub header: DataHeader,
    pub kind: PacketKind,
    /// Sequence within the flow.
    pub seq: u64,
    pub sent_at: Timestamp,
    pub payload: Vec<u8>,
    /// Hops taken so far.
    pub hops: u8,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// Deliver a control datagram to a node.
    ControlDelivery {
        to: usize,
        from: Address,
        data: Vec<u8>,
    },
    /// Hand a data packet to the next hop.
    DataDelivery { to: usize, packet: DataPacket },
    /// Fire a protocol timer on a node.
    TimerFire {
        node: usize,
        id: TimerId,
        kind: TimerKind,
    },
    /// Periodic echo request from `from` to the echo server.
    AppSend { from: usize, interval: Duration },
    /// Advance random-waypoint mobility by one step.
    MobilityStep,
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: Timestamp,
    /// Breaks ties between same-time events in scheduling order.
    pub seq: SequenceNumber,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// BinaryHeap is a max-heap, so the ordering is reversed.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn at(secs: u64, seq: u64) -> ScheduledEvent {
        ScheduledEvent::new(
            Timestamp::from_secs(secs),
            SequenceNumber::new(seq),
            Event::MobilityStep,
        )
    }

    #[test]
    fn test_earlier_time_pops_first() {
        assert!(at(5, 2) > at(10, 1));
    }

    #[test]
    fn test_same_time_pops_in_sequence_order() {
        assert!(at(10, 1) > at(10, 2));

        let mut heap = BinaryHeap::new();
        heap.push(at(3, 7));
        heap.push(at(1, 9));
        heap.push(at(3, 4));
        let order: Vec<(u64, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.time.as_secs(), e.seq.value()))
            .collect();
        assert_eq!(order, vec![(1, 9), (3, 4), (3, 7)]);
    }
}
