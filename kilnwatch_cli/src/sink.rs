//! Filesystem state sink: JSON state file plus JSON-lines appenders.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use kilnwatch_core::{FsmEvent, RunRecord, SinkError, StageRecord, StateSink};

/// Persists runtime state and records under one directory:
/// `<line>.state.json`, `events.jsonl`, `stages.jsonl`, `runs.jsonl`.
pub struct JsonlSink {
    dir: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self, line_id: &str) -> PathBuf {
        self.dir.join(format!("{line_id}.state.json"))
    }

    fn append_line(&self, file: &str, json: String) -> Result<(), SinkError> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        writeln!(f, "{json}")?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StateSink for JsonlSink {
    fn save_runtime_state(&mut self, line_id: &str, blob: &[u8]) -> Result<(), SinkError> {
        // write-then-rename keeps the checkpoint whole under power loss
        let tmp = self.state_path(line_id).with_extension("json.tmp");
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, self.state_path(line_id))?;
        Ok(())
    }

    fn load_runtime_state(&mut self, line_id: &str) -> Result<Option<Vec<u8>>, SinkError> {
        match fs::read(self.state_path(line_id)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn append_event(&mut self, event: &FsmEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event)
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        self.append_line("events.jsonl", json)
    }

    fn on_stage_closed(&mut self, record: &StageRecord) -> Result<(), SinkError> {
        let json = serde_json::to_string(record)
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        self.append_line("stages.jsonl", json)
    }

    fn on_run_closed(&mut self, record: &RunRecord) -> Result<(), SinkError> {
        let json = serde_json::to_string(record)
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        self.append_line("runs.jsonl", json)
    }
}
