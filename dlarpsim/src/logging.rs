//! Log output for simulation runs.
//!
//! Every protocol event is stamped with the simulated time by the node's
//! observer (`now = ...`), so the wall-clock timestamp of the formatter is
//! dropped. `RUST_LOG` narrows or widens the output, e.g.
//! `RUST_LOG=dlarp=trace` to see every control message on the air.
//!
//! What shows up at each level:
//! - WARN: malformed packets, rejected agreements, discoveries refused
//! - INFO: committed routes, abandoned discoveries, the run summary
//! - DEBUG: neighbors coming and going, discovery retries, stale messages,
//!   scenario actions
//! - TRACE: individual control messages, dropped data packets

use tracing_subscriber::EnvFilter;

/// How a run prints its log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line, for post-processing a run.
    Json,
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber for a command-line run. Defaults to `info`.
pub fn init(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_or("info"))
        .without_time();
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Capture logs from scenario tests at `debug`. Later calls are no-ops.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("debug"))
        .without_time()
        .with_test_writer()
        .try_init();
}
