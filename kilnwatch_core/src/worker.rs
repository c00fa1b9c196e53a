//! The periodic FSM worker: one owned task per line.
//!
//! Each tick pulls the freshest sample per enabled zone, steps the run
//! coordinator, and persists state and events through the sink. The loop
//! keeps a monotonic deadline cadence: a slow tick fires the next one
//! immediately once, then resynchronizes, so the schedule never drifts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel as xch;
use serde::{Deserialize, Serialize};

use kilnwatch_traits::{Clock, MonotonicClock, SampleSource, ZoneSample};

use crate::checkpoint;
use crate::config::FsmCfg;
use crate::coordinator::{RunCoordinator, RunRecord, RunStatus, TickOutput};
use crate::detector::StageRecord;
use crate::error::{BuildError, Result};
use crate::event::EventQueue;
use crate::sink::StateSink;

/// Degraded-mode event buffer capacity.
const EVENT_QUEUE_CAP: usize = 1024;
/// Stage records retried before the oldest is abandoned.
const STAGE_QUEUE_CAP: usize = 64;
/// Control-surface command backlog.
const CMD_CHANNEL_CAP: usize = 16;

/// Control-surface snapshot published every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub line_id: String,
    pub running: bool,
    pub degraded: bool,
    pub ticks: u64,
    pub samples_processed: u64,
    pub events_generated: u64,
    pub events_buffered: usize,
    pub events_dropped: u64,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub run: RunStatus,
}

#[derive(Debug)]
pub enum WorkerCommand {
    Abort(String),
    Reload(FsmCfg),
}

pub struct FsmWorkerBuilder {
    line_id: String,
    cfg: FsmCfg,
    source: Option<Arc<dyn SampleSource>>,
    sink: Option<Box<dyn StateSink>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
}

impl FsmWorkerBuilder {
    pub fn new(line_id: impl Into<String>, cfg: FsmCfg) -> Self {
        Self {
            line_id: line_id.into(),
            cfg,
            source: None,
            sink: None,
            clock: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SampleSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn StateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Custom clock; defaults to the real monotonic clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the config, recover any checkpoint, and produce a worker.
    /// An invalid config is the only fatal refusal.
    pub fn try_build(self) -> Result<FsmWorker> {
        self.cfg.validate()?;
        let source = self
            .source
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSource))?;
        let mut sink = self
            .sink
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSink))?;
        let clock: Arc<dyn Clock + Send + Sync> = match self.clock {
            Some(c) => c,
            None => Arc::new(MonotonicClock::new()),
        };

        let mut coordinator = RunCoordinator::new(self.line_id.clone(), self.cfg.clone());
        match sink.load_runtime_state(&self.line_id) {
            Ok(Some(blob)) => match checkpoint::decode(&blob) {
                Ok(state) => {
                    let resumed_run = state.run.as_ref().map(|r| r.run_id.clone());
                    coordinator.restore_state(state);
                    if coordinator.run_active() {
                        tracing::info!(
                            line_id = %self.line_id,
                            run_id = ?resumed_run,
                            "resumed in-flight run from checkpoint"
                        );
                        // the checkpointed config governs the open run; the
                        // boot config takes over when it closes
                        if coordinator.cfg() != &self.cfg {
                            coordinator.reload_config(self.cfg.clone());
                        }
                    } else if coordinator.cfg() != &self.cfg {
                        coordinator.reload_config(self.cfg.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(line_id = %self.line_id, error = %e, "checkpoint unreadable; starting fresh");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(line_id = %self.line_id, error = %e, "checkpoint load failed; starting fresh");
            }
        }

        let epoch = clock.now();
        let status = Arc::new(Mutex::new(WorkerStatus {
            line_id: self.line_id.clone(),
            running: false,
            degraded: false,
            ticks: 0,
            samples_processed: 0,
            events_generated: 0,
            events_buffered: 0,
            events_dropped: 0,
            last_sample_at: None,
            run: coordinator.status(),
        }));

        Ok(FsmWorker {
            line_id: self.line_id,
            source,
            sink,
            clock,
            epoch,
            coordinator,
            pending_events: EventQueue::new(EVENT_QUEUE_CAP),
            pending_stages: VecDeque::new(),
            pending_runs: VecDeque::new(),
            consecutive_sink_failures: 0,
            degraded: false,
            ticks: 0,
            samples_processed: 0,
            events_generated: 0,
            last_sample_wall: None,
            status,
        })
    }
}

pub struct FsmWorker {
    line_id: String,
    source: Arc<dyn SampleSource>,
    sink: Box<dyn StateSink>,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    coordinator: RunCoordinator,
    pending_events: EventQueue,
    pending_stages: VecDeque<StageRecord>,
    pending_runs: VecDeque<RunRecord>,
    consecutive_sink_failures: u32,
    degraded: bool,
    ticks: u64,
    samples_processed: u64,
    events_generated: u64,
    last_sample_wall: Option<DateTime<Utc>>,
    status: Arc<Mutex<WorkerStatus>>,
}

impl std::fmt::Debug for FsmWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmWorker")
            .field("line_id", &self.line_id)
            .field("epoch", &self.epoch)
            .field("pending_stages", &self.pending_stages)
            .field("pending_runs", &self.pending_runs)
            .field("consecutive_sink_failures", &self.consecutive_sink_failures)
            .field("degraded", &self.degraded)
            .field("ticks", &self.ticks)
            .field("samples_processed", &self.samples_processed)
            .field("events_generated", &self.events_generated)
            .field("last_sample_wall", &self.last_sample_wall)
            .field("status", &self.status)
            .finish()
    }
}

impl FsmWorker {
    pub fn builder(line_id: impl Into<String>, cfg: FsmCfg) -> FsmWorkerBuilder {
        FsmWorkerBuilder::new(line_id, cfg)
    }

    pub fn line_id(&self) -> &str {
        &self.line_id
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    pub fn status(&self) -> WorkerStatus {
        self.snapshot_status(true)
    }

    /// Shared handle to the published status (used by [`WorkerHandle`]).
    pub fn status_cell(&self) -> Arc<Mutex<WorkerStatus>> {
        Arc::clone(&self.status)
    }

    /// One scheduling quantum: fetch, observe, persist, heartbeat.
    pub fn tick(&mut self) {
        let now_ms = self.clock.ms_since(self.epoch);
        let now_wall = self.clock.wall_now();
        let max_age = self.coordinator.cfg().max_sample_age_ms();

        let zones = self.coordinator.cfg().zones.cycle_order();
        let mut samples = Vec::with_capacity(zones.len());
        for zone in zones {
            let sample = match self.source.get_latest(zone) {
                Ok(Some(s)) => {
                    if now_ms.saturating_sub(s.t_mono_ms) > max_age {
                        tracing::debug!(zone = %zone, age_ms = now_ms.saturating_sub(s.t_mono_ms), "stale sample invalidated");
                        ZoneSample {
                            valid: false,
                            ..s
                        }
                    } else {
                        s
                    }
                }
                Ok(None) => ZoneSample::invalid(zone, now_ms, now_wall),
                Err(e) => {
                    tracing::warn!(zone = %zone, error = %e, "sample fetch failed");
                    ZoneSample::invalid(zone, now_ms, now_wall)
                }
            };
            if sample.valid {
                self.samples_processed += 1;
                self.last_sample_wall = Some(sample.t_wall);
            }
            samples.push(sample);
        }

        let out = self.coordinator.observe(&samples);
        self.events_generated += out.events.len() as u64;
        self.persist(out);

        self.ticks += 1;
        tracing::debug!(line_id = %self.line_id, tick = self.ticks, "heartbeat");
        self.publish_status(true);
    }

    /// Close any in-flight run as externally aborted.
    pub fn abort_run(&mut self, reason: &str) {
        let now_ms = self.clock.ms_since(self.epoch);
        let now_wall = self.clock.wall_now();
        let out = self.coordinator.abort(reason, now_ms, now_wall);
        self.events_generated += out.events.len() as u64;
        self.persist(out);
        self.publish_status(true);
    }

    /// Queue a new config; it governs the next run. An invalid config is
    /// refused and the current one kept.
    pub fn reload_config(&mut self, cfg: FsmCfg) {
        if let Err(e) = cfg.validate() {
            tracing::error!(line_id = %self.line_id, error = %e, "config reload refused");
            return;
        }
        self.coordinator.reload_config(cfg);
    }

    fn persist(&mut self, out: TickOutput) {
        for ev in out.events {
            self.pending_events.push(ev);
        }
        for st in out.closed_stages {
            if self.pending_stages.len() == STAGE_QUEUE_CAP {
                self.pending_stages.pop_front();
            }
            self.pending_stages.push_back(st);
        }
        if let Some(run) = out.closed_run {
            // never dropped: retried until the sink takes it
            self.pending_runs.push_back(run);
        }

        let mut failed = false;

        match checkpoint::encode(&self.coordinator) {
            Ok(blob) => {
                if let Err(e) = self.sink.save_runtime_state(&self.line_id, &blob) {
                    tracing::warn!(line_id = %self.line_id, error = %e, "checkpoint write failed");
                    failed = true;
                }
            }
            Err(e) => {
                tracing::error!(line_id = %self.line_id, error = %e, "checkpoint encode failed");
            }
        }

        while !failed {
            let Some(ev) = self.pending_events.pop() else {
                break;
            };
            if let Err(e) = self.sink.append_event(&ev) {
                tracing::warn!(line_id = %self.line_id, error = %e, "event append failed");
                self.pending_events.requeue_front(ev);
                failed = true;
            }
        }
        while !failed {
            let Some(st) = self.pending_stages.pop_front() else {
                break;
            };
            if let Err(e) = self.sink.on_stage_closed(&st) {
                tracing::warn!(line_id = %self.line_id, error = %e, "stage record write failed");
                self.pending_stages.push_front(st);
                failed = true;
            }
        }
        while !failed {
            let Some(run) = self.pending_runs.pop_front() else {
                break;
            };
            if let Err(e) = self.sink.on_run_closed(&run) {
                tracing::warn!(line_id = %self.line_id, run_id = %run.run_id, error = %e, "run record write failed");
                self.pending_runs.push_front(run);
                failed = true;
            }
        }

        if failed {
            self.consecutive_sink_failures = self.consecutive_sink_failures.saturating_add(1);
            if self.consecutive_sink_failures >= 2 && !self.degraded {
                self.degraded = true;
                tracing::error!(line_id = %self.line_id, "state sink degraded; buffering events in memory");
            }
        } else {
            if self.degraded {
                tracing::info!(line_id = %self.line_id, "state sink recovered");
            }
            self.consecutive_sink_failures = 0;
            self.degraded = false;
        }
    }

    /// Final checkpoint on shutdown; an open run stays open for the next
    /// incarnation to resume.
    fn persist_on_shutdown(&mut self) {
        match checkpoint::encode(&self.coordinator) {
            Ok(blob) => {
                if let Err(e) = self.sink.save_runtime_state(&self.line_id, &blob) {
                    tracing::error!(line_id = %self.line_id, error = %e, "final checkpoint write failed");
                }
            }
            Err(e) => {
                tracing::error!(line_id = %self.line_id, error = %e, "final checkpoint encode failed");
            }
        }
    }

    fn snapshot_status(&self, running: bool) -> WorkerStatus {
        WorkerStatus {
            line_id: self.line_id.clone(),
            running,
            degraded: self.degraded,
            ticks: self.ticks,
            samples_processed: self.samples_processed,
            events_generated: self.events_generated,
            events_buffered: self.pending_events.len(),
            events_dropped: self.pending_events.dropped(),
            last_sample_at: self.last_sample_wall,
            run: self.coordinator.status(),
        }
    }

    fn publish_status(&self, running: bool) {
        if let Ok(mut cell) = self.status.lock() {
            *cell = self.snapshot_status(running);
        }
    }

    /// Run the worker on its own thread at the configured cadence.
    pub fn spawn(mut self) -> WorkerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let (cmd_tx, cmd_rx) = xch::bounded::<WorkerCommand>(CMD_CHANNEL_CAP);
        let status = self.status_cell();
        let clock = Arc::clone(&self.clock);

        let join = thread::spawn(move || {
            let mut deadline =
                clock.now() + std::time::Duration::from_millis(self.coordinator.cfg().period_ms());
            tracing::info!(line_id = %self.line_id, "worker started");
            while !stop_thread.load(Ordering::Relaxed) {
                while let Ok(cmd) = cmd_rx.try_recv() {
                    match cmd {
                        WorkerCommand::Abort(reason) => self.abort_run(&reason),
                        WorkerCommand::Reload(cfg) => self.reload_config(cfg),
                    }
                }
                self.tick();

                let period =
                    std::time::Duration::from_millis(self.coordinator.cfg().period_ms());
                let now = clock.now();
                if now < deadline {
                    clock.sleep(deadline - now);
                    deadline += period;
                } else {
                    // overran the period: fire immediately once, resync
                    deadline = now + period;
                }
            }
            self.persist_on_shutdown();
            self.publish_status(false);
            tracing::info!(line_id = %self.line_id, "worker stopped");
        });

        WorkerHandle {
            stop,
            cmd_tx,
            status,
            join,
        }
    }
}

/// Control surface for a spawned worker.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    cmd_tx: xch::Sender<WorkerCommand>,
    status: Arc<Mutex<WorkerStatus>>,
    join: thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn status(&self) -> Option<WorkerStatus> {
        self.status.lock().ok().map(|s| s.clone())
    }

    pub fn abort_run(&self, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(WorkerCommand::Abort(reason.into()));
    }

    pub fn reload_config(&self, cfg: FsmCfg) {
        let _ = self.cmd_tx.send(WorkerCommand::Reload(cfg));
    }

    /// Request shutdown and wait for the final checkpoint.
    pub fn stop(self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.join
            .join()
            .map_err(|_| eyre::eyre!("worker thread panicked"))
    }
}
