//! Structured protocol events.
//!
//! A node reports everything worth logging through the [`Observer`] it was
//! constructed with. [`TracingObserver`] forwards events to `tracing`,
//! [`NoopObserver`] drops them, and test harnesses record them.

use alloc::boxed::Box;

use crate::time::Timestamp;
use crate::types::{Address, InterfaceId, RequestId, RoutingTableEntry};
use crate::wire::{DecodeError, DlarpMessage};

/// Sink for protocol events.
pub trait Observer {
    /// Called synchronously from inside the node's handlers.
    fn emit(&mut self, now: Timestamp, event: ProtocolEvent);
}

/// Events emitted by the node at its observation points.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// A control message was handed to the transport. `to` is `None` for broadcasts.
    MessageSent {
        iface: InterfaceId,
        to: Option<Address>,
        message: DlarpMessage,
    },
    MessageReceived {
        iface: InterfaceId,
        from: Address,
        message: DlarpMessage,
    },
    /// A datagram failed to decode and was dropped.
    MalformedPacket {
        iface: InterfaceId,
        from: Address,
        len: usize,
        error: DecodeError,
    },
    NeighborUp {
        addr: Address,
        iface: InterfaceId,
    },
    NeighborExpired {
        addr: Address,
    },
    DiscoveryStarted {
        request_id: RequestId,
        target: Address,
    },
    DiscoveryRetry {
        request_id: RequestId,
        target: Address,
        attempt: u32,
    },
    /// Retries exhausted, the target stays unreachable.
    DiscoveryFailed {
        request_id: RequestId,
        target: Address,
    },
    /// No discovery could be started: no interface is up or too many are
    /// outstanding.
    DiscoveryRefused {
        target: Address,
        outstanding: usize,
    },
    /// The target became a direct neighbor before discovery finished.
    DiscoveryCancelled {
        request_id: RequestId,
        target: Address,
    },
    /// A repeated RREQ was suppressed.
    DuplicateRequest {
        request_id: RequestId,
        originator: Address,
        from: Address,
    },
    /// An RREQ or RREP older than one already heard was dropped.
    StaleMessage {
        from: Address,
        message: DlarpMessage,
    },
    AgreementProposed {
        request_id: RequestId,
        destination: Address,
        via: Address,
        metric: f64,
    },
    VoteRecorded {
        request_id: RequestId,
        voter: Address,
        estimate: f64,
        agrees: bool,
    },
    RouteCommitted {
        entry: RoutingTableEntry,
        agrees: usize,
        threshold: usize,
    },
    AgreementRejected {
        request_id: RequestId,
        destination: Address,
        agrees: usize,
        threshold: usize,
    },
    InterfaceUp {
        iface: InterfaceId,
        addr: Address,
    },
    InterfaceDown {
        iface: InterfaceId,
    },
    EndpointBindFailed {
        iface: InterfaceId,
        addr: Address,
    },
}

/// Observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn emit(&mut self, _now: Timestamp, _event: ProtocolEvent) {}
}

impl<O: Observer + ?Sized> Observer for Box<O> {
    fn emit(&mut self, now: Timestamp, event: ProtocolEvent) {
        (**self).emit(now, event);
    }
}

/// Observer that logs through `tracing`, tagged with the owning node's address.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    node: Address,
}

impl TracingObserver {
    pub fn new(node: Address) -> Self {
        Self { node }
    }
}

impl Observer for TracingObserver {
    fn emit(&mut self, now: Timestamp, event: ProtocolEvent) {
        let node = self.node;
        match event {
            ProtocolEvent::MessageSent { iface, to, message } => {
                tracing::trace!(%node, %now, iface, ?to, kind = ?message.kind, seq = message.seq_no, "message sent");
            }
            ProtocolEvent::MessageReceived {
                iface,
                from,
                message,
            } => {
                tracing::trace!(%node, %now, iface, %from, kind = ?message.kind, seq = message.seq_no, "message received");
            }
            ProtocolEvent::MalformedPacket {
                iface,
                from,
                len,
                error,
            } => {
                tracing::warn!(%node, %now, iface, %from, len, %error, "dropping malformed packet");
            }
            ProtocolEvent::NeighborUp { addr, iface } => {
                tracing::debug!(%node, %now, neighbor = %addr, iface, "neighbor up");
            }
            ProtocolEvent::NeighborExpired { addr } => {
                tracing::debug!(%node, %now, neighbor = %addr, "neighbor expired");
            }
            ProtocolEvent::DiscoveryStarted { request_id, target } => {
                tracing::debug!(%node, %now, request_id, %target, "route discovery started");
            }
            ProtocolEvent::DiscoveryRetry {
                request_id,
                target,
                attempt,
            } => {
                tracing::debug!(%node, %now, request_id, %target, attempt, "route discovery retry");
            }
            ProtocolEvent::DiscoveryFailed { request_id, target } => {
                tracing::info!(%node, %now, request_id, %target, "route discovery abandoned");
            }
            ProtocolEvent::DiscoveryRefused { target, outstanding } => {
                tracing::warn!(%node, %now, %target, outstanding, "route discovery not started");
            }
            ProtocolEvent::DiscoveryCancelled { request_id, target } => {
                tracing::debug!(%node, %now, request_id, %target, "route discovery cancelled, target is a neighbor");
            }
            ProtocolEvent::DuplicateRequest {
                request_id,
                originator,
                from,
            } => {
                tracing::trace!(%node, %now, request_id, %originator, %from, "duplicate route request");
            }
            ProtocolEvent::StaleMessage { from, message } => {
                tracing::debug!(
                    %node,
                    %now,
                    %from,
                    kind = ?message.kind,
                    src = %message.src,
                    seq = message.seq_no,
                    "dropping stale message"
                );
            }
            ProtocolEvent::AgreementProposed {
                request_id,
                destination,
                via,
                metric,
            } => {
                tracing::debug!(%node, %now, request_id, %destination, %via, metric, "agreement proposed");
            }
            ProtocolEvent::VoteRecorded {
                request_id,
                voter,
                estimate,
                agrees,
            } => {
                tracing::trace!(%node, %now, request_id, %voter, estimate, agrees, "agreement vote");
            }
            ProtocolEvent::RouteCommitted {
                entry,
                agrees,
                threshold,
            } => {
                tracing::info!(
                    %node,
                    %now,
                    destination = %entry.destination,
                    next_hop = %entry.next_hop,
                    metric = entry.metric,
                    agrees,
                    threshold,
                    "route committed"
                );
            }
            ProtocolEvent::AgreementRejected {
                request_id,
                destination,
                agrees,
                threshold,
            } => {
                tracing::warn!(%node, %now, request_id, %destination, agrees, threshold, "agreement rejected");
            }
            ProtocolEvent::InterfaceUp { iface, addr } => {
                tracing::debug!(%node, %now, iface, %addr, "interface up");
            }
            ProtocolEvent::InterfaceDown { iface } => {
                tracing::debug!(%node, %now, iface, "interface down");
            }
            ProtocolEvent::EndpointBindFailed { iface, addr } => {
                tracing::warn!(%node, %now, iface, %addr, "endpoint bind failed");
            }
        }
    }
}
