//! Capabilities injected into a [`Node`](crate::Node).
//!
//! The protocol never touches sockets, clocks or timer wheels directly. The
//! hosting environment (a simulator, an embedded runtime, a userspace
//! daemon) implements these traits once and hands them to the node:
//!
//! - [`Transport`] - per-interface datagram endpoints
//! - [`Timer`] - schedule and cancel virtual-time callbacks
//! - [`Clock`] - read the current instant
//! - [`Random`] - jitter source

use alloc::vec::Vec;
use core::fmt;

use crate::time::Timestamp;
use crate::types::{Address, InterfaceId, RequestId};

/// Datagram endpoints, one per active interface.
///
/// The node calls [`bind`](Transport::bind) when an interface comes up and
/// [`close`](Transport::close) when it goes away. All sends are best effort.
pub trait Transport {
    /// Error reported when an endpoint cannot be created.
    type Error: fmt::Debug;

    /// Create the endpoint for `iface`, bound to `local:port` and broadcast capable.
    fn bind(&mut self, iface: InterfaceId, local: Address, port: u16) -> Result<(), Self::Error>;

    /// Tear down the endpoint for `iface`.
    fn close(&mut self, iface: InterfaceId);

    /// Send to the interface broadcast address.
    fn broadcast(&mut self, iface: InterfaceId, data: Vec<u8>);

    /// Send to one neighbor.
    fn send_to(&mut self, iface: InterfaceId, dest: Address, data: Vec<u8>);

    /// Link quality metric toward `neighbor`, if the link layer measures one.
    ///
    /// `None` makes every hop cost [`DEFAULT_LINK_COST`](crate::types::DEFAULT_LINK_COST).
    fn link_cost(&self, _iface: InterfaceId, _neighbor: Address) -> Option<f64> {
        None
    }
}

/// Handle of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// Purpose of a scheduled timer, handed back when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Hello,
    NeighborSweep,
    DiscoveryTimeout { request_id: RequestId },
    AgreementWindow { request_id: RequestId },
}

/// Virtual-time callback scheduler.
///
/// When a timer fires the environment delivers
/// [`NodeEvent::TimerFired`](crate::node::NodeEvent::TimerFired) with the
/// same id and kind. A cancelled timer must not be delivered.
pub trait Timer {
    fn schedule(&mut self, at: Timestamp, kind: TimerKind) -> TimerId;
    fn cancel(&mut self, id: TimerId);
}

/// Time source.
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Random number generator.
pub trait Random {
    /// Generate a random u64 in the range [min, max).
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    /// Restart the generator on a new stream.
    fn reseed(&mut self, seed: u64);
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use alloc::collections::{BTreeMap, BTreeSet};
    use core::cell::Cell;

    use super::*;
    use crate::observer::{Observer, ProtocolEvent};

    /// A datagram captured by [`MockTransport`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentDatagram {
        pub iface: InterfaceId,
        /// `None` for broadcast.
        pub to: Option<Address>,
        pub data: Vec<u8>,
    }

    /// Transport that records every send.
    #[derive(Debug, Default)]
    pub struct MockTransport {
        bound: BTreeMap<InterfaceId, Address>,
        refuse: BTreeSet<InterfaceId>,
        costs: BTreeMap<(InterfaceId, Address), f64>,
        sent: Vec<SentDatagram>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next bind on `iface` fail.
        pub fn refuse_bind(&mut self, iface: InterfaceId) {
            self.refuse.insert(iface);
        }

        pub fn set_link_cost(&mut self, iface: InterfaceId, neighbor: Address, cost: f64) {
            self.costs.insert((iface, neighbor), cost);
        }

        pub fn is_bound(&self, iface: InterfaceId) -> bool {
            self.bound.contains_key(&iface)
        }

        /// Take all datagrams sent so far.
        pub fn take_sent(&mut self) -> Vec<SentDatagram> {
            core::mem::take(&mut self.sent)
        }

        pub fn sent(&self) -> &[SentDatagram] {
            &self.sent
        }
    }

    impl Transport for MockTransport {
        type Error = &'static str;

        fn bind(
            &mut self,
            iface: InterfaceId,
            local: Address,
            _port: u16,
        ) -> Result<(), Self::Error> {
            if self.refuse.remove(&iface) {
                return Err("address in use");
            }
            self.bound.insert(iface, local);
            Ok(())
        }

        fn close(&mut self, iface: InterfaceId) {
            self.bound.remove(&iface);
        }

        fn broadcast(&mut self, iface: InterfaceId, data: Vec<u8>) {
            self.sent.push(SentDatagram {
                iface,
                to: None,
                data,
            });
        }

        fn send_to(&mut self, iface: InterfaceId, dest: Address, data: Vec<u8>) {
            self.sent.push(SentDatagram {
                iface,
                to: Some(dest),
                data,
            });
        }

        fn link_cost(&self, iface: InterfaceId, neighbor: Address) -> Option<f64> {
            self.costs.get(&(iface, neighbor)).copied()
        }
    }

    /// Timer that only records what is scheduled. Tests fire timers by hand.
    #[derive(Debug, Default)]
    pub struct MockTimer {
        next_id: u64,
        active: BTreeMap<TimerId, (Timestamp, TimerKind)>,
    }

    impl MockTimer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Active timers ordered by deadline.
        pub fn active(&self) -> Vec<(TimerId, Timestamp, TimerKind)> {
            let mut v: Vec<_> = self
                .active
                .iter()
                .map(|(id, (at, kind))| (*id, *at, *kind))
                .collect();
            v.sort_by_key(|(id, at, _)| (*at, *id));
            v
        }

        /// The active timer of the given kind, if exactly matching.
        pub fn find(&self, kind: TimerKind) -> Option<(TimerId, Timestamp)> {
            self.active
                .iter()
                .find(|(_, (_, k))| *k == kind)
                .map(|(id, (at, _))| (*id, *at))
        }

        pub fn count(&self, kind: TimerKind) -> usize {
            self.active.values().filter(|(_, k)| *k == kind).count()
        }

        pub fn is_active(&self, id: TimerId) -> bool {
            self.active.contains_key(&id)
        }

        /// Remove a timer as if the environment delivered it.
        pub fn fire(&mut self, id: TimerId) -> Option<(Timestamp, TimerKind)> {
            self.active.remove(&id)
        }
    }

    impl Timer for MockTimer {
        fn schedule(&mut self, at: Timestamp, kind: TimerKind) -> TimerId {
            let id = TimerId(self.next_id);
            self.next_id += 1;
            self.active.insert(id, (at, kind));
            id
        }

        fn cancel(&mut self, id: TimerId) {
            self.active.remove(&id);
        }
    }

    /// Mock clock for testing (time advances manually).
    #[derive(Debug, Default)]
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time: Timestamp) -> Self {
            Self {
                current: Cell::new(time),
            }
        }

        pub fn set(&self, time: Timestamp) {
            self.current.set(time);
        }

        pub fn advance(&self, duration: crate::time::Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Timestamp {
            self.current.get()
        }
    }

    /// Mock random (deterministic LCG).
    #[derive(Debug)]
    pub struct MockRandom {
        pub state: u64,
    }

    impl Default for MockRandom {
        fn default() -> Self {
            Self { state: 12345 }
        }
    }

    impl MockRandom {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self { state: seed }
        }
    }

    impl Random for MockRandom {
        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let range = max.saturating_sub(min);
            if range == 0 {
                return min;
            }
            min + (self.state % range)
        }

        fn reseed(&mut self, seed: u64) {
            self.state = seed;
        }
    }

    /// Observer that keeps every event in memory.
    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        pub events: Vec<(Timestamp, ProtocolEvent)>,
    }

    impl RecordingObserver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn count(&self, pred: impl Fn(&ProtocolEvent) -> bool) -> usize {
            self.events.iter().filter(|(_, e)| pred(e)).count()
        }

        pub fn clear(&mut self) {
            self.events.clear();
        }
    }

    impl Observer for RecordingObserver {
        fn emit(&mut self, now: Timestamp, event: ProtocolEvent) {
            self.events.push((now, event));
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use core::net::Ipv4Addr;

    use super::test_impls::*;
    use super::*;

    #[test]
    fn test_mock_transport_bind_refusal() {
        let mut t = MockTransport::new();
        t.refuse_bind(1);
        assert!(t.bind(1, Ipv4Addr::new(10, 0, 0, 1), 654).is_err());
        assert!(!t.is_bound(1));
        assert!(t.bind(1, Ipv4Addr::new(10, 0, 0, 1), 654).is_ok());
        assert!(t.is_bound(1));
        t.close(1);
        assert!(!t.is_bound(1));
    }

    #[test]
    fn test_mock_transport_records_sends() {
        let mut t = MockTransport::new();
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        t.broadcast(1, vec![1]);
        t.send_to(1, peer, vec![2]);
        let sent = t.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].to, None);
        assert_eq!(sent[1].to, Some(peer));
        assert!(t.sent().is_empty());
    }

    #[test]
    fn test_mock_timer_cancel() {
        let mut timer = MockTimer::new();
        let a = timer.schedule(Timestamp::from_secs(2), TimerKind::Hello);
        let b = timer.schedule(Timestamp::from_secs(1), TimerKind::NeighborSweep);
        assert_ne!(a, b);
        assert_eq!(timer.active()[0].0, b);
        timer.cancel(a);
        assert!(!timer.is_active(a));
        assert_eq!(timer.count(TimerKind::Hello), 0);
    }

    #[test]
    fn test_mock_random_range_and_reseed() {
        let mut r = MockRandom::with_seed(7);
        for _ in 0..100 {
            let v = r.gen_range(10, 20);
            assert!((10..20).contains(&v));
        }
        assert_eq!(r.gen_range(5, 5), 5);

        let mut a = MockRandom::new();
        let mut b = MockRandom::new();
        b.reseed(99);
        a.reseed(99);
        assert_eq!(a.gen_range(0, 1000), b.gen_range(0, 1000));
    }
}
