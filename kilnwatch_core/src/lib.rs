#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core heating-cycle monitoring logic (transport-agnostic).
//!
//! This crate turns a noisy per-zone stream of `(temperature, setpoint)`
//! samples into a well-defined sequence of stages with timestamps,
//! durations, and statistics, and emits one structured record per run.
//! Controller I/O lives behind `kilnwatch_traits::SampleSource`;
//! persistence behind [`sink::StateSink`].
//!
//! ## Architecture
//!
//! - **Detection**: per-zone stage FSM (`detector` module)
//! - **Statistics**: Welford running moments per stage (`stats` module)
//! - **Coordination**: cycle progression, recovery, quiet timeout, run
//!   records (`coordinator` module)
//! - **Worker**: monotonic-deadline tick loop, staleness, degraded-sink
//!   buffering (`worker` module)
//! - **Recovery**: checkpoint blob with exact moments (`checkpoint` module)

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod event;
pub mod history;
pub mod mocks;
pub mod sink;
pub mod stats;
pub mod util;
pub mod worker;

pub use config::{EnabledZones, FsmCfg};
pub use coordinator::{
    RunCoordinator, RunRecord, RunStatus, Termination, TickOutput, ZoneRunSummary,
};
pub use detector::{StageKind, StageOutcome, StageRecord, ZoneDetector, ZoneEvent};
pub use error::{BuildError, FaultKind, SinkError};
pub use event::{EventKind, FsmEvent};
pub use sink::StateSink;
pub use stats::{RunningStats, StatsSnapshot};
pub use worker::{FsmWorker, FsmWorkerBuilder, WorkerHandle, WorkerStatus};
