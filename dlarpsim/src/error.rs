//! Simulator error type.

/// Errors raised while setting up or running a simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("protocol error: {0}")]
    Protocol(#[from] dlarp::Error),

    #[error("no topology chosen for the scenario")]
    MissingTopology,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
