//! The narrow persistence boundary required by the core.

use crate::coordinator::RunRecord;
use crate::detector::StageRecord;
use crate::error::SinkError;
use crate::event::FsmEvent;

/// Whatever persists state for a line implements this. The core treats
/// every method as potentially failing transiently; see the worker's
/// retry-then-degrade policy.
pub trait StateSink: Send {
    /// Idempotent overwrite of the line's runtime checkpoint.
    fn save_runtime_state(&mut self, line_id: &str, blob: &[u8]) -> Result<(), SinkError>;

    /// Checkpoint written by a previous incarnation, if any.
    fn load_runtime_state(&mut self, line_id: &str) -> Result<Option<Vec<u8>>, SinkError>;

    /// Best-effort observability append; loss must not corrupt state.
    fn append_event(&mut self, event: &FsmEvent) -> Result<(), SinkError>;

    fn on_stage_closed(&mut self, record: &StageRecord) -> Result<(), SinkError>;

    /// Called exactly once per run.
    fn on_run_closed(&mut self, record: &RunRecord) -> Result<(), SinkError>;
}
