//! Runtime-state checkpoint encoding.
//!
//! The blob is everything needed to resume a line mid-run: the governing
//! config, the active run, every zone's detector state (Welford moments
//! included), and the quiet-slope rings. JSON keeps it inspectable. The
//! slope windows dominate the payload, so a three-zone line checkpoints
//! at tens of kilobytes once the rings fill.

use eyre::WrapErr;

use crate::coordinator::{CoordinatorState, RunCoordinator};
use crate::error::Result;

/// Current blob layout version.
const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Envelope {
    checkpoint_version: u32,
    state: CoordinatorState,
}

/// Serialize a coordinator's runtime state.
pub fn encode(coordinator: &RunCoordinator) -> Result<Vec<u8>> {
    let env = Envelope {
        checkpoint_version: CHECKPOINT_VERSION,
        state: coordinator.snapshot_state(),
    };
    serde_json::to_vec(&env).wrap_err("encode runtime checkpoint")
}

/// Deserialize a runtime-state blob.
pub fn decode(blob: &[u8]) -> Result<CoordinatorState> {
    let env: Envelope = serde_json::from_slice(blob).wrap_err("decode runtime checkpoint")?;
    if env.checkpoint_version != CHECKPOINT_VERSION {
        return Err(eyre::eyre!(
            "unsupported checkpoint version {}",
            env.checkpoint_version
        ));
    }
    Ok(env.state)
}
