//! Local agreement: neighbors vote on a discovered route before it is committed.
//!
//! The originator broadcasts the candidate (destination, next hop, metric) and
//! opens a collection window. Each neighbor that can estimate the cost of
//! reaching the destination through the same next hop answers with its
//! estimate; neighbors without an opinion stay silent. A vote agrees when the
//! estimate lies within `metric_tolerance` of the proposed metric.
//!
//! The candidate is committed as soon as agreeing votes reach
//! `floor(live_neighbors * quorum_fraction) + 1`. If the window closes first,
//! the candidate is dropped and discovery decides whether to retry.
//! Existing routes keep forwarding traffic throughout.

use alloc::collections::BTreeSet;

use crate::node::Node;
use crate::observer::{Observer, ProtocolEvent};
use crate::time::Timestamp;
use crate::traits::{Clock, Random, Timer, TimerId, TimerKind, Transport};
use crate::types::{Address, InterfaceId, RequestId, RoutingTableEntry};
use crate::wire::{AgreementPhase, DlarpMessage};

/// Votes collected for one candidate route.
#[derive(Clone, Debug, PartialEq)]
pub struct AgreementRound {
    pub request_id: RequestId,
    pub candidate: RoutingTableEntry,
    pub opened_at: Timestamp,
    /// Neighbors whose vote agreed.
    pub agreeing: BTreeSet<Address>,
    /// Every neighbor that voted, agreeing or not.
    pub voted: BTreeSet<Address>,
    pub(crate) timer: Option<TimerId>,
}

impl<T, Tm, R, Clk, O> Node<T, Tm, R, Clk, O>
where
    T: Transport,
    Tm: Timer,
    R: Random,
    Clk: Clock,
    O: Observer,
{
    /// Put `candidate` to a neighbor vote.
    pub(crate) fn propose_agreement(
        &mut self,
        request_id: RequestId,
        candidate: RoutingTableEntry,
        now: Timestamp,
    ) {
        self.cancel_agreement(request_id);

        let seq = self.next_seq();
        let proposal = DlarpMessage::agreement_proposal(
            seq,
            request_id,
            candidate.next_hop,
            candidate.destination,
            candidate.metric,
        );
        self.broadcast_all(proposal, now);

        let timer = self.timer.schedule(
            now + self.config.agreement_window,
            TimerKind::AgreementWindow { request_id },
        );
        self.rounds.insert(
            request_id,
            AgreementRound {
                request_id,
                candidate,
                opened_at: now,
                agreeing: BTreeSet::new(),
                voted: BTreeSet::new(),
                timer: Some(timer),
            },
        );
        self.emit(
            now,
            ProtocolEvent::AgreementProposed {
                request_id,
                destination: candidate.destination,
                via: candidate.next_hop,
                metric: candidate.metric,
            },
        );
    }

    pub(crate) fn handle_agreement(
        &mut self,
        iface: InterfaceId,
        from: Address,
        msg: &DlarpMessage,
        now: Timestamp,
    ) {
        match msg.agreement_phase() {
            Some(AgreementPhase::Proposal) => self.answer_proposal(iface, from, msg, now),
            Some(AgreementPhase::Vote) => self.record_vote(from, msg, now),
            None => {}
        }
    }

    /// Our own cost estimate for reaching `destination` the way the proposer would.
    pub(crate) fn estimate_via(
        &self,
        iface: InterfaceId,
        proposer: Address,
        via: Address,
        destination: Address,
        now: Timestamp,
    ) -> Option<f64> {
        if self.is_local(via) {
            let first_hop = self.link_cost(iface, proposer);
            if self.is_local(destination) {
                return Some(first_hop);
            }
            return self
                .best_route_where(destination, now, |e| e.next_hop != proposer)
                .map(|r| first_hop + r.metric);
        }
        self.best_route_where(destination, now, |e| e.next_hop == via)
            .map(|r| r.metric)
    }

    fn answer_proposal(
        &mut self,
        iface: InterfaceId,
        from: Address,
        msg: &DlarpMessage,
        now: Timestamp,
    ) {
        let Some(estimate) = self.estimate_via(iface, from, msg.src, msg.dst, now) else {
            return;
        };
        let seq = self.next_seq();
        let vote = DlarpMessage::agreement_vote(seq, msg.request_id, msg.src, msg.dst, estimate);
        self.send_unicast(iface, from, vote, now);
    }

    fn record_vote(&mut self, from: Address, msg: &DlarpMessage, now: Timestamp) {
        if !self.neighbors.is_neighbor(from, now) {
            return;
        }
        let tolerance = self.config.metric_tolerance;
        let Some(round) = self.rounds.get_mut(&msg.request_id) else {
            return;
        };
        if round.candidate.destination != msg.dst || round.candidate.next_hop != msg.src {
            return;
        }
        if !round.voted.insert(from) {
            return;
        }
        let distance = msg.metric - round.candidate.metric;
        let agrees = distance <= tolerance && -distance <= tolerance;
        if agrees {
            round.agreeing.insert(from);
        }
        let agreeing = round.agreeing.len();

        self.emit(
            now,
            ProtocolEvent::VoteRecorded {
                request_id: msg.request_id,
                voter: from,
                estimate: msg.metric,
                agrees,
            },
        );

        let threshold = self.quorum_threshold(now);
        if agreeing >= threshold {
            if let Some(round) = self.rounds.remove(&msg.request_id) {
                self.commit_round(round, threshold, now);
            }
        }
    }

    /// Agreement window closed: commit on quorum, otherwise reject.
    pub(crate) fn close_agreement_window(&mut self, request_id: RequestId, now: Timestamp) {
        let Some(mut round) = self.rounds.remove(&request_id) else {
            return;
        };
        round.timer = None;
        // Voters that expired since voting no longer count.
        round
            .agreeing
            .retain(|voter| self.neighbors.is_neighbor(*voter, now));

        let threshold = self.quorum_threshold(now);
        if round.agreeing.len() >= threshold {
            self.commit_round(round, threshold, now);
            return;
        }

        self.emit(
            now,
            ProtocolEvent::AgreementRejected {
                request_id,
                destination: round.candidate.destination,
                agrees: round.agreeing.len(),
                threshold,
            },
        );
        self.candidate_rejected(request_id, now);
    }

    fn commit_round(&mut self, round: AgreementRound, threshold: usize, now: Timestamp) {
        if let Some(t) = round.timer {
            self.timer.cancel(t);
        }
        // Discovery may have been abandoned while votes were in flight.
        let Some(pending) = self.discovery.pending.remove(&round.request_id) else {
            return;
        };
        if let Some(t) = pending.timer {
            self.timer.cancel(t);
        }
        self.routes.upsert(round.candidate);
        self.emit(
            now,
            ProtocolEvent::RouteCommitted {
                entry: round.candidate,
                agrees: round.agreeing.len(),
                threshold,
            },
        );
    }

    /// Discard a round without a decision.
    pub(crate) fn cancel_agreement(&mut self, request_id: RequestId) {
        if let Some(round) = self.rounds.remove(&request_id) {
            if let Some(t) = round.timer {
                self.timer.cancel(t);
            }
        }
    }

    fn quorum_threshold(&self, now: Timestamp) -> usize {
        self.config
            .quorum_threshold(self.neighbors.live_count(now))
    }

    /// The open agreement round for `request_id`, if any.
    pub fn agreement_round(&self, request_id: RequestId) -> Option<&AgreementRound> {
        self.rounds.get(&request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DlarpConfig;
    use crate::harness::{Net, IFACE};
    use crate::time::Duration;
    use crate::types::DiscoveryState;
    use crate::wire::Encode;
    use alloc::vec::Vec;
    use core::net::Ipv4Addr;

    fn entry(dst: usize, via: usize, metric: f64, lifetime: Timestamp) -> RoutingTableEntry {
        RoutingTableEntry {
            destination: Net::addr(dst),
            next_hop: Net::addr(via),
            interface: IFACE,
            seq_no: 1,
            metric,
            hop_count: 2,
            lifetime,
        }
    }

    /// A - B - C with D hanging off A, so A has two live neighbors.
    fn two_neighbor_net() -> Net {
        let mut net = Net::new(4, DlarpConfig::default());
        net.link(0, 1);
        net.link(1, 2);
        net.link(0, 3);
        net.converge_neighbors();
        net
    }

    fn rejections(net: &Net, i: usize) -> Vec<(Timestamp, usize, usize)> {
        net.events(i)
            .iter()
            .filter_map(|(at, e)| match e {
                ProtocolEvent::AgreementRejected {
                    agrees, threshold, ..
                } => Some((*at, *agrees, *threshold)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_quorum_rejection_keeps_prior_route() {
        let mut net = two_neighbor_net();
        let t0 = net.now();
        let prior = entry(2, 3, 5.0, t0 + Duration::from_secs(60));
        net.nodes[0].routes.upsert(prior);

        let id = net.nodes[0].send_route_request(Net::addr(2)).unwrap();
        net.pump();

        // B agreed, D had no opinion: 1 of the 2 needed.
        let round = net.nodes[0].agreement_round(id).unwrap();
        assert_eq!(round.candidate.next_hop, Net::addr(1));
        assert_eq!(round.agreeing.len(), 1);
        // The prior route keeps forwarding while the vote is open.
        assert_eq!(net.nodes[0].best_route(Net::addr(2)), Some(prior));

        net.run_until(t0 + Duration::from_millis(600));

        assert_eq!(
            rejections(&net, 0),
            alloc::vec![(t0 + Duration::from_millis(500), 1, 2)]
        );
        assert!(net.nodes[0].agreement_round(id).is_none());
        assert_eq!(net.nodes[0].best_route(Net::addr(2)), Some(prior));
        // Back to waiting, with the back-off timer armed.
        let pending = net.nodes[0].discovery.pending(id).unwrap();
        assert_eq!(pending.state, DiscoveryState::Requested);
        assert_eq!(
            net.nodes[0]
                .timer()
                .find(TimerKind::DiscoveryTimeout { request_id: id })
                .map(|(_, at)| at),
            Some(t0 + Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_repeated_rejection_abandons_discovery() {
        let mut net = two_neighbor_net();
        let t0 = net.now();
        let id = net.nodes[0].send_route_request(Net::addr(2)).unwrap();
        net.run_until(t0 + Duration::from_secs(20));

        let at: Vec<Timestamp> = rejections(&net, 0).iter().map(|r| r.0).collect();
        assert_eq!(
            at,
            alloc::vec![
                t0 + Duration::from_millis(500),
                t0 + Duration::from_millis(3000),
                t0 + Duration::from_millis(7500),
            ]
        );
        let failed: Vec<Timestamp> = net
            .events(0)
            .iter()
            .filter_map(|(at, e)| match e {
                ProtocolEvent::DiscoveryFailed { request_id, .. } if *request_id == id => Some(*at),
                _ => None,
            })
            .collect();
        assert_eq!(failed, alloc::vec![t0 + Duration::from_millis(7500)]);
        assert!(net.nodes[0].pending_requests().is_empty());
        assert_eq!(net.nodes[0].best_route(Net::addr(2)), None);
    }

    #[test]
    fn test_quorum_reached_commits_before_window() {
        // Triangle A, B, C plus D behind B.
        let mut net = Net::new(4, DlarpConfig::default());
        net.link(0, 1);
        net.link(0, 2);
        net.link(1, 2);
        net.link(1, 3);
        net.converge_neighbors();
        let t0 = net.now();

        let id = net.nodes[0].send_route_request(Net::addr(3)).unwrap();
        net.step();
        // C learns B's path to D only after the flood passed it.
        net.nodes[2]
            .routes
            .upsert(entry(3, 1, 2.0, t0 + Duration::from_secs(60)));
        net.pump();

        let route = net.nodes[0].best_route(Net::addr(3)).unwrap();
        assert_eq!(route.next_hop, Net::addr(1));
        assert_eq!(route.metric, 2.0);
        assert!(net.nodes[0].agreement_round(id).is_none());
        assert_eq!(
            net.nodes[0]
                .timer()
                .count(TimerKind::AgreementWindow { request_id: id }),
            0
        );
        let committed: Vec<(Timestamp, usize, usize)> = net
            .events(0)
            .iter()
            .filter_map(|(at, e)| match e {
                ProtocolEvent::RouteCommitted {
                    agrees, threshold, ..
                } => Some((*at, *agrees, *threshold)),
                _ => None,
            })
            .collect();
        assert_eq!(committed, alloc::vec![(t0, 2, 2)]);
    }

    #[test]
    fn test_estimate_outside_tolerance_disagrees() {
        let mut net = Net::new(4, DlarpConfig::default());
        net.link(0, 1);
        net.link(0, 2);
        net.link(1, 2);
        net.link(1, 3);
        net.converge_neighbors();
        let t0 = net.now();

        net.nodes[0].send_route_request(Net::addr(3)).unwrap();
        net.step();
        net.nodes[2]
            .routes
            .upsert(entry(3, 1, 3.5, t0 + Duration::from_secs(60)));
        net.pump();

        let votes: Vec<(Address, bool)> = net
            .events(0)
            .iter()
            .filter_map(|(_, e)| match e {
                ProtocolEvent::VoteRecorded { voter, agrees, .. } => Some((*voter, *agrees)),
                _ => None,
            })
            .collect();
        assert_eq!(
            votes,
            alloc::vec![(Net::addr(1), true), (Net::addr(2), false)]
        );
        assert_eq!(net.nodes[0].best_route(Net::addr(3)), None);
    }

    #[test]
    fn test_votes_from_strangers_and_repeats_ignored() {
        let mut net = two_neighbor_net();
        let id = net.nodes[0].send_route_request(Net::addr(2)).unwrap();
        net.pump();

        let forged = DlarpMessage::agreement_vote(900, id, Net::addr(1), Net::addr(2), 2.0);
        let stranger = Ipv4Addr::new(10, 0, 0, 77);
        net.nodes[0].handle_packet(IFACE, stranger, &forged.encode_to_vec());
        net.nodes[0].handle_packet(IFACE, Net::addr(1), &forged.encode_to_vec());
        // Right voter, wrong next hop.
        let mismatched = DlarpMessage::agreement_vote(901, id, Net::addr(3), Net::addr(2), 2.0);
        net.nodes[0].handle_packet(IFACE, Net::addr(3), &mismatched.encode_to_vec());

        let round = net.nodes[0].agreement_round(id).unwrap();
        assert_eq!(round.voted.len(), 1);
        assert_eq!(round.agreeing.len(), 1);
        assert_eq!(net.nodes[0].best_route(Net::addr(2)), None);
    }

    #[test]
    fn test_neighbor_arrival_discards_open_round() {
        let mut net = two_neighbor_net();
        let id = net.nodes[0].send_route_request(Net::addr(2)).unwrap();
        net.pump();
        assert!(net.nodes[0].agreement_round(id).is_some());

        let hello = DlarpMessage::hello(10_000, Net::addr(2));
        net.nodes[0].handle_packet(IFACE, Net::addr(2), &hello.encode_to_vec());

        assert!(net.nodes[0].agreement_round(id).is_none());
        assert_eq!(
            net.nodes[0]
                .timer()
                .count(TimerKind::AgreementWindow { request_id: id }),
            0
        );
        assert!(net.nodes[0].pending_requests().is_empty());
        assert_eq!(
            net.nodes[0].best_route(Net::addr(2)).map(|r| r.hop_count),
            Some(1)
        );
    }

    #[test]
    fn test_estimate_via_self_excludes_proposer() {
        let mut net = Net::chain(3, DlarpConfig::default());
        net.converge_neighbors();
        let now = net.now();
        let b = &net.nodes[1];
        // B is the proposed next hop toward C: one hop to A plus B's own route.
        assert_eq!(
            b.estimate_via(IFACE, Net::addr(0), Net::addr(1), Net::addr(2), now),
            Some(2.0)
        );
        // B is the destination itself.
        assert_eq!(
            b.estimate_via(IFACE, Net::addr(0), Net::addr(1), Net::addr(1), now),
            Some(1.0)
        );
        // Someone else is the next hop: B reports its own route through it.
        assert_eq!(
            b.estimate_via(IFACE, Net::addr(0), Net::addr(2), Net::addr(2), now),
            Some(1.0)
        );
        assert_eq!(
            b.estimate_via(IFACE, Net::addr(0), Net::addr(2), Net::addr(0), now),
            None
        );
    }
}
