//! Runtime protocol configuration.
//!
//! A [`DlarpConfig`] is built once, validated once by [`Node::new`](crate::Node::new),
//! and never changes afterwards.
//!
//! # Capacity presets
//!
//! | Preset | Neighbors | Routes / dest | Pending requests | Seen requests |
//! |--------|----------:|--------------:|-----------------:|--------------:|
//! | `DlarpConfig::default()` | 128 | 8 | 32 | 512 |
//! | `DlarpConfig::small()` | 16 | 2 | 4 | 64 |
//!
//! # Example
//!
//! ```
//! use dlarp::{DlarpConfig, Duration};
//!
//! let config = DlarpConfig {
//!     hello_interval: Duration::from_millis(500),
//!     ..DlarpConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::time::Duration;
use crate::types::Error;

/// Tunable protocol parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct DlarpConfig {
    /// Period between Hello broadcasts.
    pub hello_interval: Duration,
    /// Upper bound of the uniform Hello jitter, as a fraction of `hello_interval`.
    pub hello_jitter_fraction: f64,
    /// Lifetime given to routes learned through discovery.
    pub route_timeout: Duration,
    /// Silence after which a neighbor is considered gone.
    pub neighbor_timeout: Duration,
    /// Period of the physical cleanup sweep.
    pub neighbor_sweep_interval: Duration,
    /// First discovery timeout. Attempt `n` waits `discovery_timeout * 2^n`.
    pub discovery_timeout: Duration,
    /// Rebroadcasts allowed after the first RREQ.
    pub max_discovery_retries: u32,
    /// How long a (request id, originator) pair suppresses duplicates.
    pub flood_window: Duration,
    /// How long the proposer collects agreement votes.
    pub agreement_window: Duration,
    /// Fraction of live neighbors that must be exceeded for a commit.
    pub quorum_fraction: f64,
    /// Maximum distance between a vote's estimate and the proposed metric.
    pub metric_tolerance: f64,

    pub max_neighbors: usize,
    pub max_routes_per_destination: usize,
    pub max_pending_requests: usize,
    pub max_seen_requests: usize,
}

impl Default for DlarpConfig {
    fn default() -> Self {
        Self {
            hello_interval: Duration::from_secs(1),
            hello_jitter_fraction: 0.1,
            route_timeout: Duration::from_secs(30),
            neighbor_timeout: Duration::from_secs(10),
            neighbor_sweep_interval: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(2),
            max_discovery_retries: 2,
            flood_window: Duration::from_secs(1),
            agreement_window: Duration::from_millis(500),
            quorum_fraction: 0.5,
            metric_tolerance: 1.0,
            max_neighbors: 128,
            max_routes_per_destination: 8,
            max_pending_requests: 32,
            max_seen_requests: 512,
        }
    }
}

impl DlarpConfig {
    /// Preset for constrained devices.
    pub fn small() -> Self {
        Self {
            max_neighbors: 16,
            max_routes_per_destination: 2,
            max_pending_requests: 4,
            max_seen_requests: 64,
            ..Self::default()
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), Error> {
        let intervals = [
            (self.hello_interval, "hello_interval must be positive"),
            (self.route_timeout, "route_timeout must be positive"),
            (self.neighbor_timeout, "neighbor_timeout must be positive"),
            (
                self.neighbor_sweep_interval,
                "neighbor_sweep_interval must be positive",
            ),
            (self.discovery_timeout, "discovery_timeout must be positive"),
            (self.flood_window, "flood_window must be positive"),
            (self.agreement_window, "agreement_window must be positive"),
        ];
        for (value, msg) in intervals {
            if value.is_zero() {
                return Err(Error::InvalidConfig(msg));
            }
        }

        // A retry reuses its request id, so relays must have forgotten it by then.
        if self.flood_window >= self.discovery_timeout {
            return Err(Error::InvalidConfig(
                "flood_window must be shorter than discovery_timeout",
            ));
        }
        if !(0.0..=1.0).contains(&self.hello_jitter_fraction) {
            return Err(Error::InvalidConfig(
                "hello_jitter_fraction must be within [0, 1]",
            ));
        }
        if !(0.0..1.0).contains(&self.quorum_fraction) {
            return Err(Error::InvalidConfig("quorum_fraction must be within [0, 1)"));
        }
        if self.metric_tolerance.is_nan() || self.metric_tolerance < 0.0 {
            return Err(Error::InvalidConfig("metric_tolerance must be non-negative"));
        }
        if self.max_neighbors == 0
            || self.max_routes_per_destination == 0
            || self.max_pending_requests == 0
            || self.max_seen_requests == 0
        {
            return Err(Error::InvalidConfig("capacity bounds must be non-zero"));
        }
        Ok(())
    }

    /// Agreeing votes needed to commit when `live_neighbors` are known.
    ///
    /// Strictly more than `quorum_fraction` of the live neighbors.
    pub fn quorum_threshold(&self, live_neighbors: usize) -> usize {
        (live_neighbors as f64 * self.quorum_fraction) as usize + 1
    }
}
