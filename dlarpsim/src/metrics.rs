//! Metrics collection for simulation analysis.

use std::collections::BTreeMap;
use std::fmt;

use dlarp::{Duration, Timestamp};

/// Protocol activity counters, kept per node and summed per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlCounters {
    pub hello_sent: u64,
    pub rreq_sent: u64,
    pub rrep_sent: u64,
    pub agreement_sent: u64,
    pub malformed: u64,
    pub duplicates_suppressed: u64,
    pub discoveries: u64,
    pub discovery_failures: u64,
    /// Discoveries that could not start because too many were outstanding.
    pub discoveries_refused: u64,
    /// RREQs and RREPs dropped for carrying an old sequence number.
    pub stale_dropped: u64,
    pub routes_committed: u64,
    pub agreements_rejected: u64,
    pub neighbors_expired: u64,
}

impl ControlCounters {
    pub fn add(&mut self, other: &ControlCounters) {
        self.hello_sent += other.hello_sent;
        self.rreq_sent += other.rreq_sent;
        self.rrep_sent += other.rrep_sent;
        self.agreement_sent += other.agreement_sent;
        self.malformed += other.malformed;
        self.duplicates_suppressed += other.duplicates_suppressed;
        self.discoveries += other.discoveries;
        self.discovery_failures += other.discovery_failures;
        self.discoveries_refused += other.discoveries_refused;
        self.stale_dropped += other.stale_dropped;
        self.routes_committed += other.routes_committed;
        self.agreements_rejected += other.agreements_rejected;
        self.neighbors_expired += other.neighbors_expired;
    }

    /// Control messages of every type handed to a transport.
    pub fn messages_sent(&self) -> u64 {
        self.hello_sent + self.rreq_sent + self.rrep_sent + self.agreement_sent
    }
}

/// Per-flow statistics, keyed by (source index, destination index).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowStats {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// Sum of end-to-end delays of received packets.
    pub delay_sum: Duration,
    /// Sum of hop counts of received packets.
    pub hop_sum: u64,
    pub first_tx: Option<Timestamp>,
    pub last_rx: Option<Timestamp>,
}

impl FlowStats {
    pub fn record_tx(&mut self, bytes: usize, now: Timestamp) {
        self.tx_packets += 1;
        self.tx_bytes += bytes as u64;
        self.first_tx.get_or_insert(now);
    }

    pub fn record_rx(&mut self, bytes: usize, sent_at: Timestamp, hops: u8, now: Timestamp) {
        self.rx_packets += 1;
        self.rx_bytes += bytes as u64;
        self.delay_sum = self.delay_sum + now.saturating_since(sent_at);
        self.hop_sum += u64::from(hops);
        self.last_rx = Some(now);
    }

    /// Received over sent, 0 for an idle flow.
    pub fn delivery_ratio(&self) -> f64 {
        if self.tx_packets == 0 {
            return 0.0;
        }
        self.rx_packets as f64 / self.tx_packets as f64
    }

    pub fn mean_delay(&self) -> Option<Duration> {
        (self.rx_packets > 0)
            .then(|| Duration::from_millis(self.delay_sum.as_millis() / self.rx_packets))
    }

    pub fn mean_hops(&self) -> Option<f64> {
        (self.rx_packets > 0).then(|| self.hop_sum as f64 / self.rx_packets as f64)
    }
}

/// Routing state of every node at one instant.
#[derive(Debug, Clone)]
pub struct RouteSnapshot {
    pub time: Timestamp,
    pub neighbor_counts: Vec<usize>,
    /// Usable routes held by each node.
    pub route_counts: Vec<usize>,
    /// Whether each node has a usable route to the echo server (node 0).
    pub reaches_sink: Vec<bool>,
}

impl RouteSnapshot {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            neighbor_counts: Vec::new(),
            route_counts: Vec::new(),
            reaches_sink: Vec::new(),
        }
    }

    pub fn record_node(&mut self, neighbors: usize, routes: usize, reaches_sink: bool) {
        self.neighbor_counts.push(neighbors);
        self.route_counts.push(routes);
        self.reaches_sink.push(reaches_sink);
    }

    /// Share of nodes other than the sink holding a route to it.
    pub fn sink_coverage(&self) -> f64 {
        let others = self.reaches_sink.len().saturating_sub(1);
        if others == 0 {
            return 1.0;
        }
        let reached = self.reaches_sink.iter().skip(1).filter(|r| **r).count();
        reached as f64 / others as f64
    }
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Control datagrams put on the air (one per broadcast or unicast).
    pub messages_sent: u64,
    /// Receptions lost to link loss.
    pub messages_dropped: u64,
    pub messages_delivered: u64,
    /// Data packets dropped because a node had no route.
    pub data_no_route: u64,
    /// Data packets lost on the link or sent to a non-neighbor.
    pub data_link_lost: u64,
    /// Data packets dropped at the hop limit.
    pub data_ttl_expired: u64,
    pub flows: BTreeMap<(usize, usize), FlowStats>,
    /// Sum of every node's counters, filled in at the end of a run.
    pub control: ControlCounters,
    pub snapshots: Vec<RouteSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow_mut(&mut self, src: usize, dst: usize) -> &mut FlowStats {
        self.flows.entry((src, dst)).or_default()
    }

    pub fn add_snapshot(&mut self, snapshot: RouteSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&RouteSnapshot> {
        self.snapshots.last()
    }

    pub fn data_tx(&self) -> u64 {
        self.flows.values().map(|f| f.tx_packets).sum()
    }

    pub fn data_rx(&self) -> u64 {
        self.flows.values().map(|f| f.rx_packets).sum()
    }

    /// Delivery ratio over all flows.
    pub fn delivery_ratio(&self) -> f64 {
        let tx = self.data_tx();
        if tx == 0 {
            return 0.0;
        }
        self.data_rx() as f64 / tx as f64
    }
}

impl fmt::Display for SimMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Flow      Tx      Rx   Ratio  MeanDelay  MeanHops")?;
        for ((src, dst), flow) in &self.flows {
            let delay = flow
                .mean_delay()
                .map_or_else(|| "-".to_string(), |d| d.to_string());
            let hops = flow
                .mean_hops()
                .map_or_else(|| "-".to_string(), |h| format!("{h:.2}"));
            writeln!(
                f,
                "{:>3}->{:<3} {:>6} {:>7} {:>7.3} {:>10} {:>9}",
                src,
                dst,
                flow.tx_packets,
                flow.rx_packets,
                flow.delivery_ratio(),
                delay,
                hops
            )?;
        }
        writeln!(
            f,
            "data: tx={} rx={} ratio={:.3} no_route={} link_lost={} ttl_expired={}",
            self.data_tx(),
            self.data_rx(),
            self.delivery_ratio(),
            self.data_no_route,
            self.data_link_lost,
            self.data_ttl_expired
        )?;
        let c = &self.control;
        write!(
            f,
            "control: hello={} rreq={} rrep={} agreement={} committed={} rejected={} failed={} refused={} stale={}",
            c.hello_sent,
            c.rreq_sent,
            c.rrep_sent,
            c.agreement_sent,
            c.routes_committed,
            c.agreements_rejected,
            c.discovery_failures,
            c.discoveries_refused,
            c.stale_dropped
        )
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub end_time: Timestamp,
    pub metrics: SimMetrics,
    /// Whether the run ended because no events were left (vs the time limit).
    pub queue_exhausted: bool,
}

impl SimulationResult {
    pub fn delivery_ratio(&self) -> f64 {
        self.metrics.delivery_ratio()
    }

    /// Sink coverage of the last snapshot.
    pub fn final_sink_coverage(&self) -> f64 {
        self.metrics
            .latest_snapshot()
            .map_or(0.0, |s| s.sink_coverage())
    }
}
