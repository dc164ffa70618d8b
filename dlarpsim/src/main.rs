use clap::{Parser, ValueEnum};

use dlarpsim::logging::LogFormat;
use dlarpsim::{DlarpConfig, Duration, ScenarioBuilder, SimError, Timestamp};

/// Echo traffic starts once neighbor tables have had time to fill.
const TRAFFIC_START: Timestamp = Timestamp::from_secs(5);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TopologyArg {
    Chain,
    Star,
    Grid,
    Random,
}

#[derive(Parser)]
#[command(name = "dlarpsim", about = "Discrete event simulation of a dlarp ad hoc network")]
struct Cli {
    /// Number of nodes; node 0 is the echo server
    #[arg(long, default_value_t = 20)]
    nodes: usize,

    /// Simulated time in seconds
    #[arg(long, default_value_t = 200)]
    duration: u64,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = TopologyArg::Random)]
    topology: TopologyArg,

    /// Interval between echo requests from each node
    #[arg(long, default_value_t = 1000)]
    packet_interval_ms: u64,

    /// Loss rate applied to every link (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0)]
    loss_rate: f64,

    /// Share of live neighbors that must agree before a route is committed
    #[arg(long, default_value_t = 0.5)]
    quorum_fraction: f64,

    /// Move nodes with random-waypoint mobility (grid and random topologies)
    #[arg(long)]
    mobility: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print every routing table at the end of the run
    #[arg(long)]
    print_tables: bool,
}

fn main() -> Result<(), SimError> {
    let cli = Cli::parse();

    dlarpsim::logging::init(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    });

    if cli.nodes == 0 {
        return Err(SimError::InvalidArgument("--nodes must be at least 1".into()));
    }
    if !(0.0..=1.0).contains(&cli.loss_rate) {
        return Err(SimError::InvalidArgument(format!(
            "--loss-rate {} is outside 0.0..=1.0",
            cli.loss_rate
        )));
    }
    if cli.packet_interval_ms == 0 {
        return Err(SimError::InvalidArgument(
            "--packet-interval-ms must be positive".into(),
        ));
    }

    let config = DlarpConfig {
        quorum_fraction: cli.quorum_fraction,
        ..DlarpConfig::default()
    };
    config.validate()?;

    let mut scenario = ScenarioBuilder::new(cli.nodes)
        .with_seed(cli.seed)
        .with_config(config)
        .with_loss_rate(cli.loss_rate)
        .with_snapshot_interval(Duration::from_secs(10))
        .with_echo_traffic(TRAFFIC_START, Duration::from_millis(cli.packet_interval_ms));
    scenario = match cli.topology {
        TopologyArg::Chain => scenario.chain_topology(),
        TopologyArg::Star => scenario.star_topology(),
        TopologyArg::Grid => scenario.grid_topology(),
        TopologyArg::Random => scenario.random_geometric_adaptive(),
    };
    if cli.mobility {
        scenario = scenario.with_mobility(0.01, Duration::from_secs(2));
    }

    let mut sim = scenario.build()?;
    let result = sim.run_for(Duration::from_secs(cli.duration));

    tracing::info!(
        end = %result.end_time,
        delivery_ratio = result.delivery_ratio(),
        sink_coverage = result.final_sink_coverage(),
        control_messages = result.metrics.control.messages_sent(),
        "simulation finished"
    );
    println!("{}", result.metrics);
    if cli.print_tables {
        println!();
        println!("{}", sim.routing_tables());
    }
    Ok(())
}
