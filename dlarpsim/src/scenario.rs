//! Scenario builder for setting up and running simulations.

use dlarp::{DlarpConfig, Duration, Timestamp};

use crate::error::SimError;
use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::mobility::RandomWaypoint;
use crate::sim::Simulator;
use crate::topology::{compute_adaptive_radius, Topology};

#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    Chain,
    Star,
    Grid,
    RandomGeometric { radius: f64 },
    RandomGeometricAdaptive,
    Custom(Topology),
}

/// Builder for simulation scenarios.
pub struct ScenarioBuilder {
    num_nodes: usize,
    seed: u64,
    /// Must be chosen explicitly.
    topology_type: Option<TopologyType>,
    loss_rate: f64,
    delay: Duration,
    config: DlarpConfig,
    actions: Vec<(Timestamp, ScenarioAction)>,
    snapshot_interval: Option<Duration>,
    /// First send time and interval of the echo traffic.
    echo: Option<(Timestamp, Duration)>,
    /// Speed and pause of random-waypoint mobility.
    mobility: Option<(f64, Duration)>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// A scenario of `num_nodes` nodes. A topology must be chosen before
    /// [`build`](Self::build).
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: None,
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            config: DlarpConfig::default(),
            actions: Vec::new(),
            snapshot_interval: None,
            echo: None,
            mobility: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_config(mut self, config: DlarpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = Some(TopologyType::Custom(topo));
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = Some(TopologyType::FullyConnected);
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = Some(TopologyType::Chain);
        self
    }

    /// Node 0 is the hub.
    pub fn star_topology(mut self) -> Self {
        self.topology_type = Some(TopologyType::Star);
        self
    }

    pub fn grid_topology(mut self) -> Self {
        self.topology_type = Some(TopologyType::Grid);
        self
    }

    /// Seeded positions in the unit square, linked within `radius`, repaired
    /// to be connected.
    pub fn random_geometric(mut self, radius: f64) -> Self {
        self.topology_type = Some(TopologyType::RandomGeometric { radius });
        self
    }

    /// About five neighbors per node.
    pub fn random_geometric_adaptive(mut self) -> Self {
        self.topology_type = Some(TopologyType::RandomGeometricAdaptive);
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Every node sends to node 0 each `interval` from `start`; node 0 echoes.
    pub fn with_echo_traffic(mut self, start: Timestamp, interval: Duration) -> Self {
        self.echo = Some((start, interval));
        self
    }

    /// Random-waypoint mobility. Only spatial topologies (grid and random
    /// geometric) move.
    pub fn with_mobility(mut self, speed: f64, pause: Duration) -> Self {
        self.mobility = Some((speed, pause));
        self
    }

    /// Cut links between `groups` (node indices) at `time`.
    pub fn partition_at(mut self, time: Timestamp, groups: Vec<Vec<usize>>) -> Self {
        self.actions
            .push((time, ScenarioAction::Partition { groups }));
        self
    }

    pub fn heal_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::HealPartition));
        self
    }

    pub fn disable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        self.actions
            .push((time, ScenarioAction::DisableLink { a, b }));
        self
    }

    pub fn enable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        self.actions.push((time, ScenarioAction::EnableLink { a, b }));
        self
    }

    pub fn snapshot_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::TakeSnapshot));
        self
    }

    pub fn dump_tables_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::DumpTables));
        self
    }

    /// Build the simulator with every node attached.
    pub fn build(self) -> Result<Simulator, SimError> {
        let n = self.num_nodes;
        let mobility_radius = match &self.topology_type {
            Some(TopologyType::RandomGeometric { radius }) => *radius,
            _ => compute_adaptive_radius(n),
        };

        let mut topo = match self.topology_type {
            Some(TopologyType::FullyConnected) => Topology::fully_connected(n),
            Some(TopologyType::Chain) => Topology::chain(n),
            Some(TopologyType::Star) => Topology::star(n),
            Some(TopologyType::Grid) => Topology::grid(n),
            Some(TopologyType::RandomGeometric { radius }) => {
                Topology::random_geometric(n, self.seed, radius)
            }
            Some(TopologyType::RandomGeometricAdaptive) => {
                Topology::random_geometric_adaptive(n, self.seed)
            }
            Some(TopologyType::Custom(t)) => t,
            None => return Err(SimError::MissingTopology),
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        topo.set_global_delay(self.delay);

        let mut sim = Simulator::new(self.seed, self.config).with_topology(topo);
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }
        if let Some((speed, pause)) = self.mobility {
            let model = RandomWaypoint::new(speed, pause, mobility_radius, self.seed ^ 0x5eed);
            sim = sim.with_mobility(model);
        }

        for _ in 0..n {
            sim.add_node()?;
        }
        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }
        if let Some((start, interval)) = self.echo {
            if interval == Duration::ZERO {
                return Err(SimError::InvalidArgument(
                    "echo interval must be positive".into(),
                ));
            }
            sim.start_echo_traffic(start, interval);
        }
        tracing::info!(nodes = n, seed = self.seed, links = sim.topology().link_count(), "scenario built");
        Ok(sim)
    }

    pub fn run_for(self, duration: Duration) -> Result<SimulationResult, SimError> {
        let mut sim = self.build()?;
        Ok(sim.run_for(duration))
    }

    pub fn run_until(self, time: Timestamp) -> Result<SimulationResult, SimError> {
        let mut sim = self.build()?;
        Ok(sim.run_until(time))
    }
}

/// `num_nodes` nodes, fully connected.
pub fn simple_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).fully_connected()
}
