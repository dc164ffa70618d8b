//! dlarpsim - Discrete event network simulator for the dlarp routing protocol.
//!
//! Runs whole dlarp networks in one process, deterministically and without
//! real-time delays.
//!
//! # Features
//!
//! - **Discrete event simulation**: events ordered by (time, sequence number)
//! - **Topologies**: chain, star, grid, fully connected, random geometric
//! - **Link properties**: loss, delay and routing cost per link
//! - **Scenario actions**: partitions, healing, link toggles
//! - **Mobility**: random waypoint with periodic relinking
//! - **Traffic**: every node sends echo requests to node 0, which answers
//! - **Metrics**: per-flow delivery, control message counts, route snapshots
//!
//! # Example
//!
//! ```
//! use dlarpsim::{Duration, ScenarioBuilder, Timestamp};
//!
//! // Three nodes in a row; the middle one relays for the far end.
//! let result = ScenarioBuilder::new(3)
//!     .chain_topology()
//!     .with_echo_traffic(Timestamp::from_secs(3), Duration::from_secs(1))
//!     .run_for(Duration::from_secs(20))
//!     .unwrap();
//!
//! assert!(result.metrics.flows[&(1, 0)].rx_packets > 0);
//! ```
//!
//! # Architecture
//!
//! The main loop pops the next event, advances the clock, calls the node
//! handler directly, then drains the node's sent datagrams and scheduled
//! timers back into the queue. Broadcasts reach every active neighbor in the
//! topology; unicasts only reach the addressed node over an active link.

pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod mobility;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

pub use dlarp::{Address, DlarpConfig, Duration, Timestamp};
pub use error::SimError;
pub use event::{DataPacket, Event, PacketKind, ScenarioAction, ScheduledEvent};
pub use metrics::{ControlCounters, FlowStats, RouteSnapshot, SimMetrics, SimulationResult};
pub use mobility::RandomWaypoint;
pub use node::{node_address, node_index, SimNode};
pub use scenario::{simple_scenario, ScenarioBuilder};
pub use sim::{Simulator, ECHO_SERVER};
pub use topology::{Link, Topology};

#[cfg(test)]
mod tests {
    use super::*;

    fn settle(sim: &mut Simulator) {
        sim.run_for(Duration::from_secs(3));
    }

    fn route(sim: &Simulator, from: usize, to: usize) -> Option<(usize, f64)> {
        let best = sim.node(from)?.inner().best_route(node_address(to))?;
        Some((node_index(best.next_hop)?, best.metric))
    }

    #[test]
    fn test_chain_discovery_through_relay() {
        logging::init_for_tests();
        let mut sim = ScenarioBuilder::new(3).chain_topology().build().unwrap();
        settle(&mut sim);

        // First packet misses and starts discovery, the second one flows.
        sim.send_data(0, 2);
        sim.run_for(Duration::from_secs(1));
        assert_eq!(route(&sim, 0, 2), Some((1, 2.0)));

        sim.send_data(0, 2);
        let result = sim.run_for(Duration::from_secs(1));
        let flow = &result.metrics.flows[&(0, 2)];
        assert_eq!((flow.tx_packets, flow.rx_packets), (2, 1));
        assert_eq!(flow.mean_hops(), Some(2.0));
        assert_eq!(result.metrics.control.discoveries, 1);
    }

    #[test]
    fn test_unreachable_target_gives_up() {
        // Two islands that never meet.
        let mut topo = Topology::new();
        topo.connect(0, 1);
        topo.connect(2, 3);
        let mut sim = ScenarioBuilder::new(4).topology(topo).build().unwrap();
        settle(&mut sim);

        sim.send_data(0, 3);
        let result = sim.run_for(Duration::from_secs(20));
        assert_eq!(route(&sim, 0, 3), None);
        assert_eq!(sim.node(0).unwrap().counters().discovery_failures, 1);
        // One initial flood plus two retries.
        assert_eq!(sim.node(0).unwrap().counters().rreq_sent, 3);
        assert_eq!(result.metrics.data_no_route, 1);
    }

    #[test]
    fn test_duplicate_flood_relayed_once() {
        // Diamond 0 - {1, 2} - 3 with 4 behind 3: node 3 hears the request twice.
        let mut topo = Topology::new();
        for (a, b) in [(0, 1), (0, 2), (1, 3), (2, 3), (3, 4)] {
            topo.connect(a, b);
        }
        let config = DlarpConfig {
            quorum_fraction: 0.0,
            ..DlarpConfig::default()
        };
        let mut sim = ScenarioBuilder::new(5)
            .with_config(config)
            .topology(topo)
            .build()
            .unwrap();
        settle(&mut sim);

        sim.send_data(0, 4);
        sim.run_for(Duration::from_secs(1));
        let relay = sim.node(3).unwrap().counters();
        assert_eq!(relay.duplicates_suppressed, 1);
        assert!(route(&sim, 0, 4).is_some());
    }

    #[test]
    fn test_metrics_grow_along_chain() {
        let config = DlarpConfig {
            quorum_fraction: 0.0,
            ..DlarpConfig::default()
        };
        let mut topo = Topology::chain(5);
        for (a, b, cost) in [(0, 1, 1.5), (1, 2, 2.0), (2, 3, 0.5), (3, 4, 1.0)] {
            topo.add_link(a, b, Link::new().with_cost(cost));
        }
        let mut sim = ScenarioBuilder::new(5)
            .with_config(config)
            .topology(topo)
            .build()
            .unwrap();
        settle(&mut sim);

        sim.send_data(0, 4);
        sim.run_for(Duration::from_secs(1));

        // The forward route at each hop costs more the further back it sits.
        let metrics: Vec<f64> = (0..4)
            .map(|i| route(&sim, i, 4).map(|r| r.1).unwrap_or(f64::NAN))
            .collect();
        assert_eq!(metrics, vec![5.0, 3.5, 1.5, 1.0]);
    }

    #[test]
    fn test_quorum_rejection_in_star() {
        // Hub 0 asks for 3 behind leaf 1. Leaves 2 and 4 have no route to
        // judge by and abstain, so default quorum is never met.
        let mut topo = Topology::star(5);
        topo.remove_link(0, 3);
        topo.connect(1, 3);
        let mut sim = ScenarioBuilder::new(5).topology(topo).build().unwrap();
        settle(&mut sim);

        sim.send_data(0, 3);
        sim.run_for(Duration::from_secs(20));
        let hub = sim.node(0).unwrap().counters();
        assert!(hub.agreements_rejected >= 1);
        assert_eq!(hub.discovery_failures, 1);
        assert_eq!(route(&sim, 0, 3), None);
    }

    #[test]
    fn test_partition_heals_and_traffic_resumes() {
        let mut sim = ScenarioBuilder::new(2)
            .chain_topology()
            .with_echo_traffic(Timestamp::from_secs(3), Duration::from_secs(1))
            .partition_at(Timestamp::from_secs(10), vec![vec![0], vec![1]])
            .heal_at(Timestamp::from_secs(30))
            .build()
            .unwrap();

        let cut = sim.run_until(Timestamp::from_secs(25));
        assert_eq!(sim.node(1).unwrap().neighbor_count(), 0);
        let delivered_before = cut.metrics.flows[&(1, 0)].rx_packets;
        assert!(delivered_before > 0);

        let healed = sim.run_until(Timestamp::from_secs(40));
        assert_eq!(sim.node(1).unwrap().neighbor_count(), 1);
        assert!(healed.metrics.flows[&(1, 0)].rx_packets > delivered_before);
    }

    #[test]
    fn test_grid_echo_traffic_delivers() {
        let config = DlarpConfig {
            quorum_fraction: 0.0,
            ..DlarpConfig::default()
        };
        let result = ScenarioBuilder::new(9)
            .grid_topology()
            .with_config(config)
            .with_echo_traffic(Timestamp::from_secs(3), Duration::from_secs(1))
            .run_for(Duration::from_secs(30))
            .unwrap();

        assert!(result.delivery_ratio() > 0.5, "{}", result.metrics);
        assert_eq!(result.metrics.data_ttl_expired, 0);
        assert_eq!(result.final_sink_coverage(), 1.0);
    }

    #[test]
    fn test_mobility_keeps_running() {
        let result = ScenarioBuilder::new(10)
            .random_geometric(0.4)
            .with_mobility(0.05, Duration::from_secs(1))
            .with_echo_traffic(Timestamp::from_secs(3), Duration::from_secs(1))
            .run_for(Duration::from_secs(30))
            .unwrap();
        assert!(result.metrics.data_tx() > 0);
        assert!(result.metrics.control.hello_sent > 0);
        assert!(!result.queue_exhausted);
    }
}
