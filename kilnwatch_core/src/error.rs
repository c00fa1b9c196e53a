use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a stage or sample went wrong. Reported as outcomes and events,
/// never thrown.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    #[error("sensor readings invalid for too long")]
    SensorInvalid,
    #[error("monotonic time went backward")]
    TimeWentBackward,
    #[error("ramp exceeded its time budget")]
    TimeoutRamp,
    #[error("stage exceeded its time budget")]
    TimeoutStage,
}

/// Errors refusing a worker build. `InvalidConfig` is the only fatal
/// condition in the core.
#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing sample source")]
    MissingSource,
    #[error("missing state sink")]
    MissingSink,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Errors surfaced by a state sink. Treated as transient: the worker
/// retries once, then degrades.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink write timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
