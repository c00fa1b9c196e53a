//! Test and helper mocks for kilnwatch_core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kilnwatch_traits::{SampleSource, Zone, ZoneSample};

use crate::coordinator::RunRecord;
use crate::detector::StageRecord;
use crate::error::SinkError;
use crate::event::FsmEvent;
use crate::sink::StateSink;

/// Sample source that replays a prepared per-zone script, then repeats the
/// last sample. `get_latest` is what a real poller's cache would return.
#[derive(Default)]
pub struct ScriptedSource {
    inner: Mutex<HashMap<Zone, (Vec<ZoneSample>, usize)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sample: ZoneSample) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entry(sample.zone).or_default().0.push(sample);
        }
    }

    pub fn extend(&self, samples: impl IntoIterator<Item = ZoneSample>) {
        for s in samples {
            self.push(s);
        }
    }
}

impl SampleSource for ScriptedSource {
    fn get_latest(
        &self,
        zone: Zone,
    ) -> Result<Option<ZoneSample>, Box<dyn std::error::Error + Send + Sync>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("scripted source poisoned"))?;
        let Some((script, idx)) = inner.get_mut(&zone) else {
            return Ok(None);
        };
        if script.is_empty() {
            return Ok(None);
        }
        let i = (*idx).min(script.len() - 1);
        *idx += 1;
        Ok(Some(script[i].clone()))
    }
}

/// In-memory sink recording everything it is handed, with optional
/// injected write failures for degraded-mode tests.
#[derive(Default)]
pub struct MemorySink {
    pub states: HashMap<String, Vec<u8>>,
    pub events: Vec<FsmEvent>,
    pub stages: Vec<StageRecord>,
    pub runs: Vec<RunRecord>,
    /// Writes to fail before recovering.
    pub fail_next_writes: u32,
    pub state_saves: u64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(line_id: &str, blob: Vec<u8>) -> Self {
        let mut sink = Self::default();
        sink.states.insert(line_id.to_string(), blob);
        sink
    }

    fn maybe_fail(&mut self) -> Result<(), SinkError> {
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(SinkError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

/// Handle to a [`MemorySink`] that stays inspectable after the worker has
/// taken ownership of the sink side.
#[derive(Clone, Default)]
pub struct SharedSink(pub Arc<Mutex<MemorySink>>);

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure against the inner sink (poisoned lock panics: test-only).
    pub fn with<T>(&self, f: impl FnOnce(&mut MemorySink) -> T) -> T {
        let mut guard = match self.0.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        f(&mut guard)
    }
}

impl StateSink for SharedSink {
    fn save_runtime_state(&mut self, line_id: &str, blob: &[u8]) -> Result<(), SinkError> {
        self.with(|s| s.save_runtime_state(line_id, blob))
    }

    fn load_runtime_state(&mut self, line_id: &str) -> Result<Option<Vec<u8>>, SinkError> {
        self.with(|s| s.load_runtime_state(line_id))
    }

    fn append_event(&mut self, event: &FsmEvent) -> Result<(), SinkError> {
        self.with(|s| s.append_event(event))
    }

    fn on_stage_closed(&mut self, record: &StageRecord) -> Result<(), SinkError> {
        self.with(|s| s.on_stage_closed(record))
    }

    fn on_run_closed(&mut self, record: &RunRecord) -> Result<(), SinkError> {
        self.with(|s| s.on_run_closed(record))
    }
}

impl StateSink for MemorySink {
    fn save_runtime_state(&mut self, line_id: &str, blob: &[u8]) -> Result<(), SinkError> {
        self.maybe_fail()?;
        self.states.insert(line_id.to_string(), blob.to_vec());
        self.state_saves += 1;
        Ok(())
    }

    fn load_runtime_state(&mut self, line_id: &str) -> Result<Option<Vec<u8>>, SinkError> {
        Ok(self.states.get(line_id).cloned())
    }

    fn append_event(&mut self, event: &FsmEvent) -> Result<(), SinkError> {
        self.maybe_fail()?;
        self.events.push(event.clone());
        Ok(())
    }

    fn on_stage_closed(&mut self, record: &StageRecord) -> Result<(), SinkError> {
        self.maybe_fail()?;
        self.stages.push(record.clone());
        Ok(())
    }

    fn on_run_closed(&mut self, record: &RunRecord) -> Result<(), SinkError> {
        self.maybe_fail()?;
        self.runs.push(record.clone());
        Ok(())
    }
}
