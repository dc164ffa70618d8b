//! On-demand route discovery (RREQ flood / RREP unicast return).
//!
//! ```text
//! Idle --send_route_request--> Requested --RREP--> AwaitingAgreement --quorum--> (committed, Idle)
//!                                  |  ^                    |
//!                          timeout |  | retry              | rejected
//!                                  v  |                    v
//!                             retry_or_abandon <--timeout-- back-off
//!                                  |
//!                        exhausted v
//!                                Idle (NoRouteToHost until the next attempt)
//! ```
//!
//! Every relay remembers which neighbor handed it a request so the reply can
//! retrace the path. Nothing about the originator enters the routing table:
//! routes are only learned from replies. A relay installs the forward route a
//! reply advertises, since the next hop votes on the candidate from exactly
//! that entry. The originator puts it to a vote before committing.
//!
//! Sequence numbers order restatements. A request older than the newest one
//! heard from its originator is dropped. So is a reply whose number for its
//! target is lower than one already seen.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::node::Node;
use crate::observer::{Observer, ProtocolEvent};
use crate::time::{Duration, Timestamp};
use crate::traits::{Clock, Random, Timer, TimerId, TimerKind, Transport};
use crate::types::{
    Address, DiscoveryState, Error, InterfaceId, RequestId, RoutingTableEntry,
};
use crate::wire::DlarpMessage;

/// An outstanding discovery started by this node.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub originator: Address,
    pub target: Address,
    pub issued_at: Timestamp,
    /// Rebroadcasts performed so far.
    pub retries: u32,
    pub state: DiscoveryState,
    pub(crate) timer: Option<TimerId>,
}

/// Where a flooded request came from, used to route the reply back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReversePath {
    pub iface: InterfaceId,
    pub prev_hop: Address,
    pub recorded_at: Timestamp,
}

type FloodKey = (RequestId, Address);

/// Highest sequence number heard for an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Freshest {
    seq: u32,
    heard_at: Timestamp,
}

/// Record `seq` for `addr` unless it is older than what was heard before.
/// `allow_equal` lets an equal number through as a restatement.
fn note_seq(
    map: &mut HashMap<Address, Freshest>,
    addr: Address,
    seq: u32,
    now: Timestamp,
    allow_equal: bool,
    capacity: usize,
) -> bool {
    if let Some(known) = map.get_mut(&addr) {
        if seq < known.seq || (seq == known.seq && !allow_equal) {
            return false;
        }
        *known = Freshest { seq, heard_at: now };
        return true;
    }
    if map.len() >= capacity {
        let oldest = map.iter().min_by_key(|(_, f)| f.heard_at).map(|(a, _)| *a);
        if let Some(oldest) = oldest {
            map.remove(&oldest);
        }
    }
    map.insert(addr, Freshest { seq, heard_at: now });
    true
}

/// Per-node discovery bookkeeping.
#[derive(Debug, Default)]
pub struct DiscoveryTables {
    pub(crate) pending: BTreeMap<RequestId, PendingRequest>,
    seen: HashMap<FloodKey, Timestamp>,
    reverse: HashMap<FloodKey, ReversePath>,
    /// Newest RREQ sequence number per originator.
    request_seq: HashMap<Address, Freshest>,
    /// Newest RREP sequence number per target.
    reply_seq: HashMap<Address, Freshest>,
    max_seen: usize,
}

impl DiscoveryTables {
    pub fn new(max_seen: usize) -> Self {
        Self {
            max_seen,
            ..Self::default()
        }
    }

    /// Pending request targeting `target`, if any.
    pub fn pending_for(&self, target: Address) -> Option<&PendingRequest> {
        self.pending.values().find(|p| p.target == target)
    }

    pub fn pending(&self, request_id: RequestId) -> Option<&PendingRequest> {
        self.pending.get(&request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record `key` as seen. Returns false if it was already seen within `window`.
    pub fn first_sighting(&mut self, key: FloodKey, now: Timestamp, window: Duration) -> bool {
        if let Some(at) = self.seen.get(&key) {
            if now.saturating_since(*at) < window {
                return false;
            }
        }
        if self.seen.len() >= self.max_seen && !self.seen.contains_key(&key) {
            self.seen.retain(|_, at| now.saturating_since(*at) < window);
            if self.seen.len() >= self.max_seen {
                let oldest = self.seen.iter().min_by_key(|(_, at)| **at).map(|(k, _)| *k);
                if let Some(oldest) = oldest {
                    self.seen.remove(&oldest);
                }
            }
        }
        self.seen.insert(key, now);
        true
    }

    pub fn reverse_path(&self, request_id: RequestId, originator: Address) -> Option<ReversePath> {
        self.reverse.get(&(request_id, originator)).copied()
    }

    /// Whether an RREQ numbered `seq` is newer than every earlier one from
    /// `originator`. Records it if so.
    pub fn fresh_request(&mut self, originator: Address, seq: u32, now: Timestamp) -> bool {
        note_seq(&mut self.request_seq, originator, seq, now, false, self.max_seen)
    }

    /// Whether an RREP for `target` numbered `seq` is not older than what was
    /// already relayed. Intermediate replies repeat a cached number, so an
    /// equal one passes.
    pub fn fresh_reply(&mut self, target: Address, seq: u32, now: Timestamp) -> bool {
        note_seq(&mut self.reply_seq, target, seq, now, true, self.max_seen)
    }

    fn prune(&mut self, now: Timestamp, flood_window: Duration, reverse_lifetime: Duration) {
        self.seen
            .retain(|_, at| now.saturating_since(*at) < flood_window);
        self.reverse
            .retain(|_, path| now.saturating_since(path.recorded_at) < reverse_lifetime);
        for map in [&mut self.request_seq, &mut self.reply_seq] {
            map.retain(|_, f| now.saturating_since(f.heard_at) < reverse_lifetime);
        }
    }

    fn remove_interface(&mut self, iface: InterfaceId) {
        self.reverse.retain(|_, path| path.iface != iface);
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
    /// Start discovering a route to `target`.
    ///
    /// Returns the request id of the new discovery, or of the one already in
    /// flight for the same target. Fails with `NoRouteToHost` when no
    /// interface is up or too many discoveries are outstanding.
    pub fn send_route_request(&mut self, target: Address) -> Result<RequestId, Error> {
        if let Some(p) = self.discovery.pending_for(target) {
            return Ok(p.request_id);
        }
        let originator = self
            .primary_address()
            .ok_or(Error::NoRouteToHost(target))?;
        if self.discovery.pending_count() >= self.config.max_pending_requests {
            return Err(Error::NoRouteToHost(target));
        }

        let now = self.now();
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let request_id = self.next_request_id;
        self.discovery.pending.insert(
            request_id,
            PendingRequest {
                request_id,
                originator,
                target,
                issued_at: now,
                retries: 0,
                state: DiscoveryState::Requested,
                timer: None,
            },
        );
        self.emit(now, ProtocolEvent::DiscoveryStarted { request_id, target });
        self.flood_request(request_id, now);
        Ok(request_id)
    }

    /// Broadcast the RREQ for a pending request and arm its timeout.
    fn flood_request(&mut self, request_id: RequestId, now: Timestamp) {
        let Some(p) = self.discovery.pending.get(&request_id) else {
            return;
        };
        let (originator, target, retries) = (p.originator, p.target, p.retries);

        let seq = self.next_seq();
        self.discovery.first_sighting(
            (request_id, originator),
            now,
            self.config.flood_window,
        );
        self.broadcast_all(DlarpMessage::route_request(seq, request_id, originator, target), now);

        let at = now + self.config.discovery_timeout.doubled(retries);
        let id = self
            .timer
            .schedule(at, TimerKind::DiscoveryTimeout { request_id });
        if let Some(p) = self.discovery.pending.get_mut(&request_id) {
            if let Some(old) = p.timer.replace(id) {
                self.timer.cancel(old);
            }
        }
    }

    pub(crate) fn handle_route_request(
        &mut self,
        iface: InterfaceId,
        from: Address,
        msg: &DlarpMessage,
        now: Timestamp,
    ) {
        if self.is_local(msg.src) {
            return;
        }
        let key = (msg.request_id, msg.src);
        if !self
            .discovery
            .first_sighting(key, now, self.config.flood_window)
        {
            self.emit(
                now,
                ProtocolEvent::DuplicateRequest {
                    request_id: msg.request_id,
                    originator: msg.src,
                    from,
                },
            );
            return;
        }
        if !self.discovery.fresh_request(msg.src, msg.seq_no, now) {
            self.emit(now, ProtocolEvent::StaleMessage { from, message: *msg });
            return;
        }

        let arrived = msg.relayed(self.link_cost(iface, from));
        self.discovery.reverse.insert(
            key,
            ReversePath {
                iface,
                prev_hop: from,
                recorded_at: now,
            },
        );

        if self.is_local(msg.dst) {
            let seq = self.next_seq();
            let reply = DlarpMessage::route_reply(seq, msg.request_id, msg.dst, msg.src, 0, 0.0);
            self.send_unicast(iface, from, reply, now);
            return;
        }

        // A neighboring target answers for itself.
        if let Some(target) = self.neighbors.get(msg.dst, now).copied() {
            if target.addr != from {
                self.send_unicast(target.iface, target.addr, arrived, now);
            }
            return;
        }

        // The reply restates what we know of the target, under its number.
        if let Some(route) = self.best_route_where(msg.dst, now, |e| e.next_hop != from) {
            let reply = DlarpMessage::route_reply(
                route.seq_no,
                msg.request_id,
                msg.dst,
                msg.src,
                route.hop_count,
                route.metric,
            );
            self.send_unicast(iface, from, reply, now);
            return;
        }

        if arrived.hop_count == u8::MAX {
            return;
        }
        self.broadcast_all(arrived, now);
    }

    pub(crate) fn handle_route_reply(
        &mut self,
        iface: InterfaceId,
        from: Address,
        msg: &DlarpMessage,
        now: Timestamp,
    ) {
        let arrived = msg.relayed(self.link_cost(iface, from));
        let learned = RoutingTableEntry {
            destination: msg.src,
            next_hop: from,
            interface: iface,
            seq_no: msg.seq_no,
            metric: arrived.metric,
            hop_count: arrived.hop_count,
            lifetime: now + self.config.route_timeout,
        };

        if self.is_local(msg.dst) {
            let waiting = self
                .discovery
                .pending
                .get(&msg.request_id)
                .is_some_and(|p| p.target == msg.src && p.state == DiscoveryState::Requested);
            if !waiting {
                return;
            }
            if !self.discovery.fresh_reply(msg.src, msg.seq_no, now) {
                self.emit(now, ProtocolEvent::StaleMessage { from, message: *msg });
                return;
            }
            let Some(pending) = self.discovery.pending.get_mut(&msg.request_id) else {
                return;
            };
            pending.state = DiscoveryState::AwaitingAgreement;
            if let Some(t) = pending.timer.take() {
                self.timer.cancel(t);
            }
            self.propose_agreement(msg.request_id, learned, now);
            return;
        }

        let Some(back) = self.discovery.reverse_path(msg.request_id, msg.dst) else {
            return;
        };
        if !self.discovery.fresh_reply(msg.src, msg.seq_no, now) {
            self.emit(now, ProtocolEvent::StaleMessage { from, message: *msg });
            return;
        }
        self.routes.upsert(learned);
        self.send_unicast(back.iface, back.prev_hop, arrived, now);
    }

    pub(crate) fn on_discovery_timeout(&mut self, request_id: RequestId, now: Timestamp) {
        let waiting = self
            .discovery
            .pending
            .get(&request_id)
            .is_some_and(|p| p.state == DiscoveryState::Requested);
        if waiting {
            self.retry_or_abandon(request_id, now);
        }
    }

    /// Rebroadcast with a doubled timeout, or give up once retries are spent.
    pub(crate) fn retry_or_abandon(&mut self, request_id: RequestId, now: Timestamp) {
        let max = self.config.max_discovery_retries;
        let Some(p) = self.discovery.pending.get_mut(&request_id) else {
            return;
        };
        if let Some(t) = p.timer.take() {
            self.timer.cancel(t);
        }

        if p.retries < max {
            p.retries += 1;
            p.state = DiscoveryState::Requested;
            let (target, attempt) = (p.target, p.retries);
            self.emit(
                now,
                ProtocolEvent::DiscoveryRetry {
                    request_id,
                    target,
                    attempt,
                },
            );
            self.flood_request(request_id, now);
            return;
        }

        self.abandon_request(request_id, now);
    }

    /// The candidate for `request_id` lost its vote: back off before the next
    /// attempt, or give up if none remain.
    pub(crate) fn candidate_rejected(&mut self, request_id: RequestId, now: Timestamp) {
        let max = self.config.max_discovery_retries;
        let Some(p) = self.discovery.pending.get_mut(&request_id) else {
            return;
        };
        if p.retries >= max {
            self.abandon_request(request_id, now);
            return;
        }
        p.state = DiscoveryState::Requested;
        let at = now + self.config.discovery_timeout.doubled(p.retries);
        let id = self
            .timer
            .schedule(at, TimerKind::DiscoveryTimeout { request_id });
        if let Some(old) = p.timer.replace(id) {
            self.timer.cancel(old);
        }
    }

    fn abandon_request(&mut self, request_id: RequestId, now: Timestamp) {
        let Some(p) = self.discovery.pending.remove(&request_id) else {
            return;
        };
        if let Some(t) = p.timer {
            self.timer.cancel(t);
        }
        self.cancel_agreement(request_id);
        self.emit(
            now,
            ProtocolEvent::DiscoveryFailed {
                request_id,
                target: p.target,
            },
        );
    }

    /// Drop an in-flight discovery because `target` became a neighbor.
    pub(crate) fn cancel_discovery_for(&mut self, target: Address, now: Timestamp) {
        let Some(request_id) = self.discovery.pending_for(target).map(|p| p.request_id) else {
            return;
        };
        if let Some(p) = self.discovery.pending.remove(&request_id) {
            if let Some(t) = p.timer {
                self.timer.cancel(t);
            }
        }
        self.cancel_agreement(request_id);
        self.emit(now, ProtocolEvent::DiscoveryCancelled { request_id, target });
    }

    pub(crate) fn prune_discovery_state(&mut self, now: Timestamp) {
        self.discovery
            .prune(now, self.config.flood_window, self.config.route_timeout);
    }

    pub(crate) fn forget_interface_paths(&mut self, iface: InterfaceId) {
        self.discovery.remove_interface(iface);
    }

    /// Pending discoveries, oldest request id first.
    pub fn pending_requests(&self) -> Vec<&PendingRequest> {
        self.discovery.pending.values().collect()
    }
}
