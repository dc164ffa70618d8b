//! Per-packet forwarding decisions for the IP layer.

use crate::node::Node;
use crate::observer::{Observer, ProtocolEvent};
use crate::traits::{Clock, Random, Timer, Transport};
use crate::types::{DataHeader, Error, InterfaceId, Route};

/// Outcome handlers for [`Node::route_input`]. Exactly one is invoked per call.
pub trait InputCallbacks {
    /// The packet is addressed to one of our interfaces.
    fn local_deliver(&mut self, packet: &[u8], header: &DataHeader, iface: InterfaceId);

    /// The packet must be sent on to `route.gateway`.
    fn unicast_forward(&mut self, route: &Route, packet: &[u8], header: &DataHeader);

    fn error(&mut self, packet: &[u8], header: &DataHeader, error: Error);
}

impl<T, Tm, R, Clk, O> Node<T, Tm, R, Clk, O>
where
    T: Transport,
    Tm: Timer,
    R: Random,
    Clk: Clock,
    O: Observer,
{
    /// Route a locally originated packet.
    ///
    /// On a miss this starts a discovery (unless one is already in flight for
    /// the destination) and fails immediately. The packet is not queued.
    pub fn route_output(&mut self, header: &DataHeader) -> Result<Route, Error> {
        let destination = header.destination;
        if let Some(iface) = self.interface_of(destination) {
            return Ok(Route {
                destination,
                gateway: destination,
                source: destination,
                interface: iface,
            });
        }

        if let Some(route) = self.lookup_route(header) {
            return Ok(route);
        }

        // An in-flight discovery is reused. One that cannot start is only
        // reported, the caller sees the same miss either way.
        if self.send_route_request(destination).is_err() {
            let now = self.now();
            let outstanding = self.discovery.pending_count();
            self.emit(
                now,
                ProtocolEvent::DiscoveryRefused {
                    target: destination,
                    outstanding,
                },
            );
        }
        Err(Error::NoRouteToHost(destination))
    }

    /// Route a packet received on `iface`.
    ///
    /// Returns true when the packet was delivered locally or forwarded.
    pub fn route_input<C: InputCallbacks>(
        &mut self,
        packet: &[u8],
        header: &DataHeader,
        iface: InterfaceId,
        callbacks: &mut C,
    ) -> bool {
        if self.is_local(header.destination) {
            callbacks.local_deliver(packet, header, iface);
            return true;
        }
        match self.lookup_route(header) {
            Some(route) => {
                callbacks.unicast_forward(&route, packet, header);
                true
            }
            None => {
                callbacks.error(packet, header, Error::NoRouteToHost(header.destination));
                false
            }
        }
    }

    fn lookup_route(&self, header: &DataHeader) -> Option<Route> {
        let entry = self.best_route(header.destination)?;
        let source = *self.interfaces.get(&entry.interface)?;
        Some(Route {
            destination: header.destination,
            gateway: entry.next_hop,
            source,
            interface: entry.interface,
        })
    }
}
