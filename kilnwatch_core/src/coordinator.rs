//! Run lifecycle coordination for one production line.
//!
//! The coordinator owns one detector per enabled zone, strings their
//! stages into a linear cycle, and closes the run exactly once — on
//! completion, quiet timeout, unrecovered fault, or external abort.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kilnwatch_traits::{Zone, ZoneSample};

use crate::config::FsmCfg;
use crate::detector::{StageKind, StageOutcome, StageRecord, ZoneDetector, ZoneEvent, ZoneState};
use crate::event::{EventKind, FsmEvent};
use crate::history::SampleRing;

/// Cap on events retained inside a single run record.
const RUN_EVENTS_CAP: usize = 1024;
/// Minimum points for a trusted quiet-slope estimate.
const QUIET_MIN_POINTS: usize = 3;

/// Why a run closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Completed,
    PartialQuiet,
    Faulted,
    Aborted,
}

/// Per-zone roll-up inside a [`RunRecord`]. Temperature fields are NaN
/// (serialized as null) when no samples were captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRunSummary {
    pub zone: Zone,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: StageOutcome,
    pub samples_n: u64,
    pub mean_f: f64,
    pub stddev_f: f64,
    pub min_f: f64,
    pub max_f: f64,
    pub setpoint_f: f64,
}

impl ZoneRunSummary {
    fn from_record(r: &StageRecord) -> Self {
        let snap = r.stats.snapshot();
        Self {
            zone: r.zone,
            started_at: r.started_at,
            ended_at: r.ended_at,
            outcome: r.outcome,
            samples_n: snap.n,
            mean_f: snap.mean,
            stddev_f: snap.stddev,
            min_f: snap.min,
            max_f: snap.max,
            setpoint_f: r.setpoint_f.unwrap_or(f64::NAN),
        }
    }
}

/// The one artifact a run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub line_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub termination: Termination,
    pub partial: bool,
    pub zones: Vec<ZoneRunSummary>,
    pub events: Vec<FsmEvent>,
}

/// Live view for the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub line_id: String,
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub current_zone: Option<Zone>,
    pub zones: Vec<(Zone, StageKind)>,
}

/// What one `observe` tick produced, for the worker to persist.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub events: Vec<FsmEvent>,
    pub closed_stages: Vec<StageRecord>,
    pub closed_run: Option<RunRecord>,
}

/// Serializable coordinator state for the runtime checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub cfg: FsmCfg,
    pub run_seq: u64,
    pub run: Option<ActiveRun>,
    pub zones: Vec<(Zone, ZoneState)>,
    pub quiet: Vec<(Zone, SampleRing)>,
    pub last_tick_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub run_id: String,
    pub config_version: u32,
    pub started_ms: u64,
    pub started_at: DateTime<Utc>,
    pub cycle_order: Vec<Zone>,
    pub current_idx: usize,
    pub records: Vec<StageRecord>,
    pub events: VecDeque<FsmEvent>,
    pub ramp_hints: Vec<(Zone, u64)>,
    pub fault_deadline_ms: Option<u64>,
    pub last_activity_ms: u64,
}

impl ActiveRun {
    fn push_event(&mut self, ev: FsmEvent) {
        if self.events.len() == RUN_EVENTS_CAP {
            self.events.pop_front();
        }
        self.events.push_back(ev);
    }

    fn cycle_pos(&self, zone: Zone) -> Option<usize> {
        self.cycle_order.iter().position(|z| *z == zone)
    }

    fn has_record(&self, zone: Zone) -> bool {
        self.records.iter().any(|r| r.zone == zone)
    }

    fn has_completed(&self, zone: Zone) -> bool {
        self.records
            .iter()
            .any(|r| r.zone == zone && r.outcome.is_completed())
    }
}

pub struct RunCoordinator {
    line_id: String,
    cfg: FsmCfg,
    pending_cfg: Option<FsmCfg>,
    detectors: Vec<ZoneDetector>,
    quiet_rings: Vec<(Zone, SampleRing)>,
    run: Option<ActiveRun>,
    run_seq: u64,
    last_tick_ms: u64,
}

impl RunCoordinator {
    pub fn new(line_id: impl Into<String>, cfg: FsmCfg) -> Self {
        let mut c = Self {
            line_id: line_id.into(),
            cfg: cfg.clone(),
            pending_cfg: None,
            detectors: Vec::new(),
            quiet_rings: Vec::new(),
            run: None,
            run_seq: 0,
            last_tick_ms: 0,
        };
        c.apply_config(cfg);
        c
    }

    pub fn line_id(&self) -> &str {
        &self.line_id
    }

    pub fn cfg(&self) -> &FsmCfg {
        &self.cfg
    }

    pub fn run_active(&self) -> bool {
        self.run.is_some()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            line_id: self.line_id.clone(),
            run_id: self.run.as_ref().map(|r| r.run_id.clone()),
            started_at: self.run.as_ref().map(|r| r.started_at),
            current_zone: self
                .run
                .as_ref()
                .and_then(|r| r.cycle_order.get(r.current_idx).copied()),
            zones: self
                .detectors
                .iter()
                .map(|d| (d.zone(), d.stage()))
                .collect(),
        }
    }

    /// Stage a config for the next run; applies immediately when idle.
    pub fn reload_config(&mut self, cfg: FsmCfg) {
        if self.run.is_some() {
            tracing::info!(
                line_id = %self.line_id,
                version = cfg.version,
                "config reload queued until run closes"
            );
            self.pending_cfg = Some(cfg);
        } else {
            self.apply_config(cfg);
        }
    }

    fn apply_config(&mut self, cfg: FsmCfg) {
        tracing::info!(line_id = %self.line_id, version = cfg.version, "config applied");
        self.detectors = cfg
            .zones
            .cycle_order()
            .into_iter()
            .map(|z| ZoneDetector::new(z, &cfg))
            .collect();
        self.quiet_rings = cfg
            .zones
            .cycle_order()
            .into_iter()
            .map(|z| (z, SampleRing::new(cfg.quiet_ring_capacity())))
            .collect();
        self.cfg = cfg;
    }

    /// Consume one tick's snapshot (one sample per enabled zone, canonical
    /// order) and return everything the worker must persist.
    pub fn observe(&mut self, samples: &[ZoneSample]) -> TickOutput {
        let mut out = TickOutput::default();

        let mut now_ms = self.last_tick_ms;
        let mut now_wall = None;
        for s in samples {
            if s.t_mono_ms >= now_ms {
                now_ms = s.t_mono_ms;
                now_wall = Some(s.t_wall);
            }
        }
        let now_wall = now_wall
            .or_else(|| samples.first().map(|s| s.t_wall))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.last_tick_ms = now_ms;

        for s in samples {
            if s.valid {
                if let Some((_, ring)) = self.quiet_rings.iter_mut().find(|(z, _)| *z == s.zone) {
                    ring.push(s.t_mono_ms, s.temperature_f);
                }
            }
            let Some(di) = self.detectors.iter().position(|d| d.zone() == s.zone) else {
                continue;
            };
            let events = self.detectors[di].step(s);
            for (i, ev) in events.iter().enumerate() {
                // a StageEnded immediately followed by a RampStarted for the
                // same zone is a close-and-retarget, not cycle progress
                let reramp_follows = matches!(ev, ZoneEvent::StageEnded { .. })
                    && events[i + 1..]
                        .iter()
                        .any(|e| matches!(e, ZoneEvent::RampStarted { .. }));
                self.handle_zone_event(ev.clone(), reramp_follows, &mut out);
            }
        }

        // Fault-recovery window expired without a successor ramp.
        let deadline_hit = self
            .run
            .as_ref()
            .and_then(|r| r.fault_deadline_ms)
            .is_some_and(|deadline| now_ms >= deadline);
        if deadline_hit {
            self.finish_run(
                Termination::Faulted,
                now_ms,
                now_wall,
                "fault recovery window expired",
                &mut out,
            );
            return out;
        }

        // Quiet timeout: nothing heating and every zone flat.
        if self.quiet_now(now_ms) {
            self.finish_run(
                Termination::PartialQuiet,
                now_ms,
                now_wall,
                "quiet window elapsed",
                &mut out,
            );
        }

        out
    }

    /// Close an in-flight run on external request.
    pub fn abort(&mut self, reason: &str, now_ms: u64, now_wall: DateTime<Utc>) -> TickOutput {
        let mut out = TickOutput::default();
        if self.run.is_none() {
            return out;
        }
        tracing::warn!(line_id = %self.line_id, reason, "run aborted");
        self.finish_run(Termination::Aborted, now_ms, now_wall, reason, &mut out);
        out
    }

    fn quiet_now(&self, now_ms: u64) -> bool {
        let Some(run) = &self.run else {
            return false;
        };
        // an armed fault-recovery window owns the close decision
        if run.fault_deadline_ms.is_some() {
            return false;
        }
        if self
            .detectors
            .iter()
            .any(|d| matches!(d.stage(), StageKind::Ramp | StageKind::Stable))
        {
            return false;
        }
        if now_ms.saturating_sub(run.last_activity_ms) < self.cfg.quiet_window_ms() {
            return false;
        }
        self.quiet_rings.iter().all(|(_, ring)| {
            ring.slope_per_min(now_ms, self.cfg.quiet_window_ms(), QUIET_MIN_POINTS)
                .abs()
                < self.cfg.dt_quiet_f_per_min
        })
    }

    fn handle_zone_event(&mut self, ev: ZoneEvent, reramp_follows: bool, out: &mut TickOutput) {
        match ev {
            ZoneEvent::RampStarted {
                zone,
                baseline_f,
                setpoint_f,
                at_ms,
                at_wall,
            } => {
                let detail = format!("baseline {baseline_f:.1} F, setpoint {setpoint_f:.1} F");
                self.on_ramp_started(zone, detail, at_ms, at_wall, out);
            }
            ZoneEvent::Stable { zone, at_ms, at_wall } => {
                if let Some(run) = self.run.as_mut() {
                    run.last_activity_ms = at_ms;
                }
                self.record_event(
                    out,
                    FsmEvent::new(at_wall, at_ms, EventKind::StableReached, Some(zone), ""),
                );
            }
            ZoneEvent::StageEnded { record, at_ms, at_wall } => {
                self.on_stage_ended(record, reramp_follows, at_ms, at_wall, out);
            }
            ZoneEvent::Fault { zone, kind, at_ms, at_wall } => {
                self.record_event(
                    out,
                    FsmEvent::new(at_wall, at_ms, EventKind::Fault, Some(zone), kind.to_string()),
                );
            }
            ZoneEvent::Degraded {
                zone,
                consecutive,
                at_ms,
                at_wall,
            } => {
                self.record_event(
                    out,
                    FsmEvent::new(
                        at_wall,
                        at_ms,
                        EventKind::Degraded,
                        Some(zone),
                        format!("{consecutive} consecutive invalid samples"),
                    ),
                );
            }
        }
    }

    fn on_ramp_started(
        &mut self,
        zone: Zone,
        detail: String,
        at_ms: u64,
        at_wall: DateTime<Utc>,
        out: &mut TickOutput,
    ) {
        if self.run.is_none() {
            let order = self.cfg.zones.cycle_order();
            if !self.cfg.allow_main_without_preheat && order.first() != Some(&zone) {
                tracing::debug!(zone = %zone, "ramp outside cycle entry ignored");
                // roll the detector back so no phantom stage lingers
                if let Some(d) = self.detectors.iter_mut().find(|d| d.zone() == zone) {
                    d.reset();
                }
                return;
            }
            self.open_run(zone, at_ms, at_wall, out);
            self.record_event(
                out,
                FsmEvent::new(at_wall, at_ms, EventKind::RampStarted, Some(zone), detail),
            );
            return;
        }

        // active run: classify against the cycle cursor without holding the
        // borrow across the event write
        enum Disposition {
            Accept,
            Anomaly,
            NotInCycle,
        }
        let disposition = {
            let Some(run) = self.run.as_mut() else {
                return;
            };
            match run.cycle_pos(zone) {
                None => Disposition::NotInCycle,
                Some(pos) => {
                    run.last_activity_ms = at_ms;
                    match pos.cmp(&run.current_idx) {
                        std::cmp::Ordering::Equal => Disposition::Accept,
                        std::cmp::Ordering::Greater => {
                            run.ramp_hints.retain(|(z, _)| *z != zone);
                            run.ramp_hints.push((zone, at_ms));
                            let recovered = run
                                .fault_deadline_ms
                                .is_some_and(|deadline| at_ms <= deadline);
                            if recovered {
                                run.current_idx = pos;
                                run.fault_deadline_ms = None;
                                tracing::info!(zone = %zone, "cycle recovered by successor ramp");
                            }
                            Disposition::Accept
                        }
                        std::cmp::Ordering::Less => Disposition::Anomaly,
                    }
                }
            }
        };
        match disposition {
            Disposition::Accept => {
                self.record_event(
                    out,
                    FsmEvent::new(at_wall, at_ms, EventKind::RampStarted, Some(zone), detail),
                );
            }
            Disposition::Anomaly => {
                self.record_event(
                    out,
                    FsmEvent::new(
                        at_wall,
                        at_ms,
                        EventKind::Anomaly,
                        Some(zone),
                        "ramp from earlier cycle zone ignored",
                    ),
                );
            }
            Disposition::NotInCycle => {}
        }
    }

    fn on_stage_ended(
        &mut self,
        record: StageRecord,
        reramp_follows: bool,
        at_ms: u64,
        at_wall: DateTime<Utc>,
        out: &mut TickOutput,
    ) {
        let zone = record.zone;
        self.record_event(
            out,
            FsmEvent::new(
                at_wall,
                at_ms,
                EventKind::StageEnded,
                Some(zone),
                format!("{:?}", record.outcome),
            ),
        );

        enum Next {
            Nothing,
            Advance,
            ArmFaultRecovery,
            CloseFaulted,
            EarlierZoneAnomaly,
        }
        let next = {
            let Some(run) = self.run.as_mut() else {
                return;
            };
            let Some(pos) = run.cycle_pos(zone) else {
                return;
            };
            run.last_activity_ms = at_ms;

            if pos < run.current_idx {
                Next::EarlierZoneAnomaly
            } else {
                run.records.push(record.clone());
                out.closed_stages.push(record.clone());
                if pos > run.current_idx {
                    // a later zone finished while the cursor lags; keep the
                    // data, leave progression to the current zone
                    Next::Nothing
                } else {
                    match record.outcome {
                        StageOutcome::Completed | StageOutcome::TimedOut => {
                            if reramp_follows {
                                Next::Nothing
                            } else {
                                Next::Advance
                            }
                        }
                        StageOutcome::Faulted(_) => {
                            if self.cfg.continue_after_fault_if_next_stage_ramps {
                                // a successor may have ramped already
                                let cur = run.current_idx;
                                let hint_pos = run
                                    .ramp_hints
                                    .iter()
                                    .filter_map(|(z, _)| run.cycle_pos(*z))
                                    .find(|p| *p > cur && !run.has_record(run.cycle_order[*p]));
                                if let Some(p) = hint_pos {
                                    run.current_idx = p;
                                    run.fault_deadline_ms = None;
                                    tracing::info!(
                                        zone = %run.cycle_order[p],
                                        "cycle recovered by already-ramping successor"
                                    );
                                    Next::Nothing
                                } else {
                                    Next::ArmFaultRecovery
                                }
                            } else {
                                Next::CloseFaulted
                            }
                        }
                        StageOutcome::Skipped => Next::Nothing,
                    }
                }
            }
        };

        match next {
            Next::Nothing => {}
            Next::Advance => self.advance_or_close(at_ms, at_wall, out),
            Next::ArmFaultRecovery => {
                let window = self.cfg.max_ramp_ms().saturating_mul(2);
                if let Some(run) = self.run.as_mut() {
                    run.fault_deadline_ms = Some(at_ms.saturating_add(window));
                }
            }
            Next::CloseFaulted => {
                self.finish_run(Termination::Faulted, at_ms, at_wall, "stage faulted", out);
            }
            Next::EarlierZoneAnomaly => {
                self.record_event(
                    out,
                    FsmEvent::new(
                        at_wall,
                        at_ms,
                        EventKind::Anomaly,
                        Some(zone),
                        "stage end from earlier cycle zone",
                    ),
                );
            }
        }
    }

    fn advance_or_close(&mut self, at_ms: u64, at_wall: DateTime<Utc>, out: &mut TickOutput) {
        let next = {
            let Some(run) = self.run.as_ref() else {
                return;
            };
            (run.current_idx + 1..run.cycle_order.len())
                .find(|&i| !run.has_record(run.cycle_order[i]))
        };
        match next {
            Some(i) => {
                if let Some(run) = self.run.as_mut() {
                    run.current_idx = i;
                    run.fault_deadline_ms = None;
                }
            }
            None => {
                self.finish_run(Termination::Completed, at_ms, at_wall, "cycle complete", out);
            }
        }
    }

    fn open_run(&mut self, zone: Zone, at_ms: u64, at_wall: DateTime<Utc>, out: &mut TickOutput) {
        self.run_seq += 1;
        let run_id = format!("RUN_{}_{:04}", at_wall.format("%Y%m%d_%H%M%S"), self.run_seq);
        let cycle_order = self.cfg.zones.cycle_order();
        let current_idx = cycle_order.iter().position(|z| *z == zone).unwrap_or(0);
        tracing::info!(line_id = %self.line_id, run_id = %run_id, zone = %zone, "run opened");
        self.run = Some(ActiveRun {
            run_id,
            config_version: self.cfg.version,
            started_ms: at_ms,
            started_at: at_wall,
            cycle_order,
            current_idx,
            records: Vec::new(),
            events: VecDeque::new(),
            ramp_hints: Vec::new(),
            fault_deadline_ms: None,
            last_activity_ms: at_ms,
        });
        self.record_event(
            out,
            FsmEvent::new(
                at_wall,
                at_ms,
                EventKind::RunOpened,
                Some(zone),
                format!("config v{}", self.cfg.version),
            ),
        );
    }

    fn record_event(&mut self, out: &mut TickOutput, ev: FsmEvent) {
        if let Some(run) = self.run.as_mut() {
            run.push_event(ev.clone());
        }
        out.events.push(ev);
    }

    fn finish_run(
        &mut self,
        termination: Termination,
        now_ms: u64,
        now_wall: DateTime<Utc>,
        detail: &str,
        out: &mut TickOutput,
    ) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        let closed_ev = FsmEvent::new(now_wall, now_ms, EventKind::RunClosed, None, detail.to_string());
        run.push_event(closed_ev.clone());
        out.events.push(closed_ev);

        let mut zones = Vec::new();
        for zone in &run.cycle_order {
            let mut any = false;
            for r in run.records.iter().filter(|r| r.zone == *zone) {
                zones.push(ZoneRunSummary::from_record(r));
                any = true;
            }
            if !any {
                zones.push(ZoneRunSummary::from_record(&StageRecord::skipped(*zone)));
            }
        }
        let partial = run.cycle_order.iter().any(|z| !run.has_completed(*z));

        let record = RunRecord {
            run_id: run.run_id.clone(),
            line_id: self.line_id.clone(),
            started_at: run.started_at,
            ended_at: now_wall,
            termination,
            partial,
            zones,
            events: run.events.into_iter().collect(),
        };
        tracing::info!(
            line_id = %self.line_id,
            run_id = %record.run_id,
            termination = ?termination,
            partial,
            "run closed"
        );

        for d in &mut self.detectors {
            d.reset();
        }
        if let Some(cfg) = self.pending_cfg.take() {
            self.apply_config(cfg);
        }
        out.closed_run = Some(record);
    }

    /// Serializable state for the runtime checkpoint.
    pub fn snapshot_state(&self) -> CoordinatorState {
        CoordinatorState {
            cfg: self.cfg.clone(),
            run_seq: self.run_seq,
            run: self.run.clone(),
            zones: self
                .detectors
                .iter()
                .map(|d| (d.zone(), d.state().clone()))
                .collect(),
            quiet: self.quiet_rings.clone(),
            last_tick_ms: self.last_tick_ms,
        }
    }

    /// Reconstitute from a checkpoint. The checkpointed config governs the
    /// in-flight run; a differing boot config should be queued afterwards
    /// via `reload_config`.
    pub fn restore_state(&mut self, st: CoordinatorState) {
        self.apply_config(st.cfg);
        self.run_seq = st.run_seq;
        self.run = st.run;
        self.last_tick_ms = st.last_tick_ms;
        for (zone, zs) in st.zones {
            if let Some(d) = self.detectors.iter_mut().find(|d| d.zone() == zone) {
                d.restore(zs);
            }
        }
        for (zone, ring) in st.quiet {
            if let Some(slot) = self.quiet_rings.iter_mut().find(|(z, _)| *z == zone) {
                slot.1 = ring;
            }
        }
    }
}
