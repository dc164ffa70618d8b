//! Network topology and link properties.
//!
//! Nodes are identified by their simulator index. Links are bidirectional
//! and stored once per unordered pair.

use dlarp::{Duration, DEFAULT_LINK_COST};
use hashbrown::HashMap;

/// Properties of a radio link between two nodes.
#[derive(Debug, Clone)]
pub struct Link {
    /// Packet loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// Propagation delay.
    pub delay: Duration,
    /// Cost reported to the routing protocol.
    pub cost: f64,
    /// Whether the link is currently active.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            delay: Duration::from_millis(1),
            cost: DEFAULT_LINK_COST,
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Non-positive or non-finite costs fall back to the default.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = if cost.is_finite() && cost > 0.0 {
            cost
        } else {
            DEFAULT_LINK_COST
        };
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Connectivity between simulated nodes.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(usize, usize), Link>,
    /// Template for links created by generators and mobility.
    default_link: Link,
    /// Node positions in the unit square, when the topology is spatial.
    positions: Option<Vec<(f64, f64)>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Template applied to links added from now on.
    pub fn with_default_link(mut self, link: Link) -> Self {
        self.default_link = link;
        self
    }

    pub fn fully_connected(count: usize) -> Self {
        let mut topo = Self::new();
        for a in 0..count {
            for b in (a + 1)..count {
                topo.connect(a, b);
            }
        }
        topo
    }

    /// 0 - 1 - ... - (count - 1).
    pub fn chain(count: usize) -> Self {
        let mut topo = Self::new();
        for b in 1..count {
            topo.connect(b - 1, b);
        }
        topo
    }

    /// Node 0 is the hub.
    pub fn star(count: usize) -> Self {
        let mut topo = Self::new();
        for spoke in 1..count {
            topo.connect(0, spoke);
        }
        topo
    }

    /// Row-major grid, `ceil(sqrt(count))` columns wide, 4-neighbor links.
    pub fn grid(count: usize) -> Self {
        let mut topo = Self::new();
        if count == 0 {
            return topo;
        }
        let cols = (count as f64).sqrt().ceil() as usize;
        let rows = count.div_ceil(cols);
        let mut positions = Vec::with_capacity(count);
        for i in 0..count {
            let (r, c) = (i / cols, i % cols);
            positions.push((
                (c as f64 + 0.5) / cols as f64,
                (r as f64 + 0.5) / rows as f64,
            ));
            if c + 1 < cols && i + 1 < count {
                topo.connect(i, i + 1);
            }
            if i + cols < count {
                topo.connect(i, i + cols);
            }
        }
        topo.positions = Some(positions);
        topo
    }

    /// Random geometric graph in the unit square.
    ///
    /// Positions are derived from `seed`. Two nodes are linked when their
    /// distance is at most `radius`; a disconnected result is repaired with
    /// the shortest missing edges.
    pub fn random_geometric(count: usize, seed: u64, radius: f64) -> Self {
        let positions = generate_positions(count, seed);
        let mut topo = Self::from_positions(positions, radius);
        topo.ensure_connectivity();
        topo
    }

    /// [`random_geometric`](Self::random_geometric) with a radius giving
    /// about five neighbors per node.
    pub fn random_geometric_adaptive(count: usize, seed: u64) -> Self {
        Self::random_geometric(count, seed, compute_adaptive_radius(count))
    }

    /// Link every pair within `radius`. No connectivity repair.
    pub fn from_positions(positions: Vec<(f64, f64)>, radius: f64) -> Self {
        let mut topo = Self::new();
        topo.positions = Some(positions);
        topo.relink_within(radius);
        topo
    }

    /// Replace all links with those implied by the current positions.
    ///
    /// Links that survive keep their properties, including `active`.
    pub fn relink_within(&mut self, radius: f64) {
        let Some(positions) = self.positions.as_ref() else {
            return;
        };
        let mut links = HashMap::new();
        for a in 0..positions.len() {
            for b in (a + 1)..positions.len() {
                if distance(positions[a], positions[b]) <= radius {
                    let link = self
                        .links
                        .remove(&(a, b))
                        .unwrap_or_else(|| self.default_link.clone());
                    links.insert((a, b), link);
                }
            }
        }
        self.links = links;
    }

    pub fn positions(&self) -> Option<&[(f64, f64)]> {
        self.positions.as_deref()
    }

    pub fn set_position(&mut self, node: usize, position: (f64, f64)) {
        if let Some(p) = self.positions.as_mut().and_then(|p| p.get_mut(node)) {
            *p = position;
        }
    }

    /// Add a link with the default properties.
    pub fn connect(&mut self, a: usize, b: usize) {
        let link = self.default_link.clone();
        self.add_link(a, b, link);
    }

    pub fn add_link(&mut self, a: usize, b: usize, link: Link) {
        if a != b {
            self.links.insert(canonical_pair(a, b), link);
        }
    }

    pub fn remove_link(&mut self, a: usize, b: usize) -> Option<Link> {
        self.links.remove(&canonical_pair(a, b))
    }

    pub fn get_link(&self, a: usize, b: usize) -> Option<&Link> {
        self.links.get(&canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: usize, b: usize) -> Option<&mut Link> {
        self.links.get_mut(&canonical_pair(a, b))
    }

    /// Link exists and is active.
    pub fn is_connected(&self, a: usize, b: usize) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Active neighbors of `node`, in ascending order.
    pub fn neighbors(&self, node: usize) -> Vec<usize> {
        let mut result: Vec<usize> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| {
                if a == node {
                    Some(b)
                } else if b == node {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        result.sort_unstable();
        result
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Disable every link crossing between groups.
    ///
    /// Nodes not listed in any group form one implicit group of their own.
    pub fn partition(&mut self, groups: &[Vec<usize>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Re-enable every link.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        self.default_link.loss_rate = rate;
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_delay(&mut self, delay: Duration) {
        self.default_link.delay = delay;
        for link in self.links.values_mut() {
            link.delay = delay;
        }
    }

    /// True when every node in `0..count` reaches node 0 over active links.
    pub fn is_fully_connected(&self, count: usize) -> bool {
        if count <= 1 {
            return true;
        }
        let mut visited = vec![false; count];
        let mut stack = vec![0];
        visited[0] = true;
        while let Some(current) = stack.pop() {
            for next in self.neighbors(current) {
                if next < count && !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }
        visited.into_iter().all(|v| v)
    }

    /// Add the shortest missing edges until the spatial graph is connected.
    fn ensure_connectivity(&mut self) {
        let Some(positions) = self.positions.clone() else {
            return;
        };
        let count = positions.len();
        if count <= 1 {
            return;
        }

        let mut edges = Vec::with_capacity(count * (count - 1) / 2);
        for a in 0..count {
            for b in (a + 1)..count {
                edges.push((a, b, distance(positions[a], positions[b])));
            }
        }
        edges.sort_by(|x, y| x.2.total_cmp(&y.2));

        let mut sets = DisjointSets::new(count);
        for &(a, b, _) in &edges {
            if self.is_connected(a, b) {
                sets.union(a, b);
            }
        }
        for &(a, b, _) in &edges {
            if sets.components() == 1 {
                break;
            }
            if sets.union(a, b) {
                self.connect(a, b);
            }
        }
    }
}

fn canonical_pair(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

pub(crate) fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (a.0 - b.0, a.1 - b.1);
    (dx * dx + dy * dy).sqrt()
}

/// Deterministic positions in the unit square (glibc LCG).
pub(crate) fn generate_positions(count: usize, seed: u64) -> Vec<(f64, f64)> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        ((state >> 16) & 0x7FFF) as f64 / 32767.0
    };
    (0..count).map(|_| (next(), next())).collect()
}

/// r = sqrt(k / ((n - 1) * pi)) for k = 5 expected neighbors, clamped to [0.15, 0.70].
pub(crate) fn compute_adaptive_radius(count: usize) -> f64 {
    if count <= 1 {
        return 0.5;
    }
    let r = (5.0 / ((count as f64 - 1.0) * core::f64::consts::PI)).sqrt();
    r.clamp(0.15, 0.70)
}

/// Union-find with path compression and union by rank.
struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
    components: usize,
}

impl DisjointSets {
    fn new(count: usize) -> Self {
        Self {
            parent: (0..count).collect(),
            rank: vec![0; count],
            components: count,
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    /// Returns false if already in the same set.
    fn union(&mut self, x: usize, y: usize) -> bool {
        let (px, py) = (self.find(x), self.find(y));
        if px == py {
            return false;
        }
        match self.rank[px].cmp(&self.rank[py]) {
            core::cmp::Ordering::Less => self.parent[px] = py,
            core::cmp::Ordering::Greater => self.parent[py] = px,
            core::cmp::Ordering::Equal => {
                self.parent[py] = px;
                self.rank[px] += 1;
            }
        }
        self.components -= 1;
        true
    }

    fn components(&self) -> usize {
        self.components
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn random_geometric_always_connected(count in 1usize..40, seed: u64, radius in 0.0f64..0.8) {
            let topo = Topology::random_geometric(count, seed, radius);
            prop_assert!(topo.is_fully_connected(count));
        }

        #[test]
        fn neighbors_are_symmetric(count in 2usize..30, seed: u64) {
            let topo = Topology::random_geometric_adaptive(count, seed);
            for a in 0..count {
                for b in topo.neighbors(a) {
                    prop_assert!(topo.neighbors(b).contains(&a));
                }
            }
        }
    }
}
