//! Random-waypoint mobility over a spatial topology.
//!
//! Each node walks in a straight line toward a random target in the unit
//! square, pauses on arrival and then picks a new target. After every step
//! the topology is relinked: nodes within `radius` are connected.

use dlarp::{Duration, Timestamp};

use crate::topology::{distance, Topology};

/// Random-waypoint model parameters and per-node state.
#[derive(Debug, Clone)]
pub struct RandomWaypoint {
    /// Distance per second, in unit-square widths.
    pub speed: f64,
    pub pause: Duration,
    /// How often positions and links are updated.
    pub step: Duration,
    /// Radio range used to relink.
    pub radius: f64,
    targets: Vec<Option<(f64, f64)>>,
    paused_until: Vec<Timestamp>,
    rng_state: u64,
}

impl RandomWaypoint {
    pub fn new(speed: f64, pause: Duration, radius: f64, seed: u64) -> Self {
        Self {
            speed: speed.max(0.0),
            pause,
            step: Duration::from_secs(1),
            radius,
            targets: Vec::new(),
            paused_until: Vec::new(),
            rng_state: seed,
        }
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    /// Move every node by one step and relink. No-op without positions.
    pub fn advance(&mut self, topology: &mut Topology, now: Timestamp) {
        let Some(positions) = topology.positions().map(<[(f64, f64)]>::to_vec) else {
            return;
        };
        let count = positions.len();
        self.targets.resize(count, None);
        self.paused_until.resize(count, Timestamp::ZERO);

        let reach = self.speed * self.step.as_millis() as f64 / 1000.0;
        for (node, &position) in positions.iter().enumerate() {
            if self.paused_until[node] > now {
                continue;
            }
            let target = match self.targets[node] {
                Some(t) => t,
                None => {
                    let t = (self.random_f64(), self.random_f64());
                    self.targets[node] = Some(t);
                    t
                }
            };
            let remaining = distance(position, target);
            let next = if remaining <= reach {
                self.targets[node] = None;
                self.paused_until[node] = now + self.pause;
                target
            } else {
                let f = reach / remaining;
                (
                    position.0 + (target.0 - position.0) * f,
                    position.1 + (target.1 - position.1) * f,
                )
            };
            topology.set_position(node, next);
        }
        topology.relink_within(self.radius);
    }

    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}
