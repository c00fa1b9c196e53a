//! Per-zone stage detection.
//!
//! A [`ZoneDetector`] consumes one zone's sample stream and classifies it
//! into IDLE → RAMP → STABLE → END, emitting lifecycle events. It is
//! deterministic (same samples, same events) and never returns an error:
//! bad data becomes `Fault`/`Degraded` events or stage outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kilnwatch_traits::{Zone, ZoneSample};

use crate::config::FsmCfg;
use crate::error::FaultKind;
use crate::history::SampleRing;
use crate::stats::RunningStats;

/// Trailing window for the least-squares ramp slope.
pub const SLOPE_WINDOW_MS: u64 = 60_000;
/// Minimum valid samples before a slope estimate is trusted.
const MIN_SLOPE_POINTS: usize = 3;
/// Consecutive invalid ticks before a Degraded event ("more than two").
const DEGRADED_AFTER_TICKS: u32 = 3;
/// Setpoints closer than this count as the same commanded value.
const SP_EPS_F: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Idle,
    Ramp,
    Stable,
    End,
}

/// How a stage finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    TimedOut,
    Faulted(FaultKind),
    Skipped,
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed)
    }
}

/// Finalized stage of one zone within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub zone: Zone,
    pub started_ms: Option<u64>,
    pub ended_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub setpoint_f: Option<f64>,
    pub outcome: StageOutcome,
    pub stats: RunningStats,
}

impl StageRecord {
    /// Record for a cycle zone that never ran.
    pub fn skipped(zone: Zone) -> Self {
        Self {
            zone,
            started_ms: None,
            ended_ms: None,
            started_at: None,
            ended_at: None,
            setpoint_f: None,
            outcome: StageOutcome::Skipped,
            stats: RunningStats::new(),
        }
    }
}

/// Lifecycle events emitted by `step`.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEvent {
    RampStarted {
        zone: Zone,
        baseline_f: f64,
        setpoint_f: f64,
        at_ms: u64,
        at_wall: DateTime<Utc>,
    },
    Stable {
        zone: Zone,
        at_ms: u64,
        at_wall: DateTime<Utc>,
    },
    StageEnded {
        record: StageRecord,
        at_ms: u64,
        at_wall: DateTime<Utc>,
    },
    Fault {
        zone: Zone,
        kind: FaultKind,
        at_ms: u64,
        at_wall: DateTime<Utc>,
    },
    Degraded {
        zone: Zone,
        consecutive: u32,
        at_ms: u64,
        at_wall: DateTime<Utc>,
    },
}

impl ZoneEvent {
    pub fn zone(&self) -> Zone {
        match self {
            ZoneEvent::RampStarted { zone, .. }
            | ZoneEvent::Stable { zone, .. }
            | ZoneEvent::Fault { zone, .. }
            | ZoneEvent::Degraded { zone, .. } => *zone,
            ZoneEvent::StageEnded { record, .. } => record.zone,
        }
    }

    pub fn at_ms(&self) -> u64 {
        match self {
            ZoneEvent::RampStarted { at_ms, .. }
            | ZoneEvent::Stable { at_ms, .. }
            | ZoneEvent::StageEnded { at_ms, .. }
            | ZoneEvent::Fault { at_ms, .. }
            | ZoneEvent::Degraded { at_ms, .. } => *at_ms,
        }
    }
}

/// A commanded setpoint waiting out its acceptance dwell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSetpoint {
    pub value: f64,
    pub first_seen_ms: u64,
    pub first_seen_wall: DateTime<Utc>,
    pub temp_at_first_seen: f64,
}

/// Full detector state. Serialized verbatim into the runtime checkpoint so
/// a restart resumes mid-stage with identical behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneState {
    pub stage: StageKind,
    pub stage_started_ms: Option<u64>,
    pub stage_started_wall: Option<DateTime<Utc>>,
    /// Reference setpoint for the active stage (band and END checks).
    pub sp_ref: Option<f64>,
    /// Last accepted setpoint while idle.
    pub sp_accepted: Option<f64>,
    pub pending_setpoint: Option<PendingSetpoint>,
    pub baseline_f: Option<f64>,
    pub in_band_since_ms: Option<u64>,
    pub out_of_band_since_ms: Option<u64>,
    pub out_of_band_since_wall: Option<DateTime<Utc>>,
    /// Stats frozen at END-dwell start; becomes the stage stats on confirm.
    pub end_stash: Option<RunningStats>,
    pub stats: RunningStats,
    pub history: SampleRing,
    pub last_mono_ms: Option<u64>,
    pub last_valid_ms: Option<u64>,
    pub invalid_streak: u32,
    pub invalid_since_ms: Option<u64>,
}

impl ZoneState {
    fn new(history_cap: usize) -> Self {
        Self {
            stage: StageKind::Idle,
            stage_started_ms: None,
            stage_started_wall: None,
            sp_ref: None,
            sp_accepted: None,
            pending_setpoint: None,
            baseline_f: None,
            in_band_since_ms: None,
            out_of_band_since_ms: None,
            out_of_band_since_wall: None,
            end_stash: None,
            stats: RunningStats::new(),
            history: SampleRing::new(history_cap),
            last_mono_ms: None,
            last_valid_ms: None,
            invalid_streak: 0,
            invalid_since_ms: None,
        }
    }
}

/// Thresholds precomputed in the units the step loop compares in.
#[derive(Debug, Clone, Copy)]
struct Params {
    tol_f: f64,
    delta_ramp_f: f64,
    dt_min_f_per_min: f64,
    t_stable_ms: u64,
    delta_off_f: f64,
    t_off_sustain_ms: u64,
    s_min_f: f64,
    t_sp_sustain_ms: u64,
    max_ramp_ms: u64,
    max_stage_ms: u64,
    gap_reset_ms: u64,
    invalid_fault_ms: u64,
}

impl Params {
    fn from_cfg(cfg: &FsmCfg) -> Self {
        Self {
            tol_f: cfg.tol_f,
            delta_ramp_f: cfg.delta_ramp_f,
            dt_min_f_per_min: cfg.dt_min_f_per_min,
            t_stable_ms: cfg.t_stable_ms(),
            delta_off_f: cfg.delta_off_f,
            t_off_sustain_ms: cfg.t_off_sustain_ms(),
            s_min_f: cfg.s_min_f,
            t_sp_sustain_ms: cfg.t_sp_sustain_ms(),
            max_ramp_ms: cfg.max_ramp_ms(),
            max_stage_ms: cfg.max_stage_ms(),
            gap_reset_ms: cfg.gap_reset_ms(),
            invalid_fault_ms: cfg.invalid_fault_ms(),
        }
    }
}

struct AcceptedSetpoint {
    value: f64,
    delta_f: f64,
    first_seen_ms: u64,
    first_seen_wall: DateTime<Utc>,
    temp_at_first_seen: f64,
}

pub struct ZoneDetector {
    zone: Zone,
    params: Params,
    state: ZoneState,
}

impl ZoneDetector {
    pub fn new(zone: Zone, cfg: &FsmCfg) -> Self {
        Self {
            zone,
            params: Params::from_cfg(cfg),
            state: ZoneState::new(cfg.history_ring_capacity()),
        }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn stage(&self) -> StageKind {
        self.state.stage
    }

    pub fn state(&self) -> &ZoneState {
        &self.state
    }

    /// Adopt a checkpointed state (restart recovery).
    pub fn restore(&mut self, state: ZoneState) {
        self.state = state;
    }

    /// Back to IDLE for the next run. The accepted setpoint and monotonic
    /// watermark survive so the next cycle arms against current reality.
    pub fn reset(&mut self) {
        let sp = self
            .state
            .sp_ref
            .or(self.state.sp_accepted);
        let last_mono = self.state.last_mono_ms;
        let cap_state = ZoneState::new(self.history_cap());
        self.state = ZoneState {
            sp_accepted: sp,
            last_mono_ms: last_mono,
            ..cap_state
        };
    }

    fn history_cap(&self) -> usize {
        // SampleRing keeps its capacity; reuse it for the fresh state
        self.state.history.capacity()
    }

    /// Feed one sample; returns the lifecycle events it caused.
    pub fn step(&mut self, s: &ZoneSample) -> Vec<ZoneEvent> {
        let mut out = Vec::new();
        debug_assert_eq!(s.zone, self.zone);

        // Monotonic regression: drop the sample, mutate nothing.
        if let Some(last) = self.state.last_mono_ms {
            if s.t_mono_ms < last {
                tracing::warn!(
                    zone = %self.zone,
                    t_ms = s.t_mono_ms,
                    watermark_ms = last,
                    "monotonic time went backward; sample dropped"
                );
                out.push(ZoneEvent::Fault {
                    zone: self.zone,
                    kind: FaultKind::TimeWentBackward,
                    at_ms: last,
                    at_wall: s.t_wall,
                });
                return out;
            }
        }
        self.state.last_mono_ms = Some(s.t_mono_ms);

        // Stage time budgets run on the clock regardless of validity.
        if self.check_time_budgets(s, &mut out) {
            return out;
        }

        let valid = s.valid && s.temperature_f.is_finite() && s.setpoint_f.is_finite();
        if !valid {
            self.on_invalid(s, &mut out);
            return out;
        }

        // A long gap between valid samples resets dwell continuity and the
        // slope window, not accumulated stage totals.
        if let Some(last_valid) = self.state.last_valid_ms {
            if s.t_mono_ms.saturating_sub(last_valid) > self.params.gap_reset_ms {
                self.state.in_band_since_ms = None;
                self.state.out_of_band_since_ms = None;
                self.state.out_of_band_since_wall = None;
                self.state.end_stash = None;
                self.state.history.clear();
            }
        }
        self.state.invalid_streak = 0;
        self.state.invalid_since_ms = None;
        self.state.last_valid_ms = Some(s.t_mono_ms);
        self.state.history.push(s.t_mono_ms, s.temperature_f);

        let accepted = self.track_setpoint(s);

        match self.state.stage {
            StageKind::Idle => self.step_idle(s, accepted, &mut out),
            StageKind::Ramp => self.step_ramp(s, accepted, &mut out),
            StageKind::Stable => self.step_stable(s, accepted, &mut out),
            StageKind::End => {}
        }
        out
    }

    fn check_time_budgets(&mut self, s: &ZoneSample, out: &mut Vec<ZoneEvent>) -> bool {
        let Some(started) = self.state.stage_started_ms else {
            return false;
        };
        let dur = s.t_mono_ms.saturating_sub(started);
        match self.state.stage {
            StageKind::Ramp if dur >= self.params.max_ramp_ms => {
                out.push(ZoneEvent::Fault {
                    zone: self.zone,
                    kind: FaultKind::TimeoutRamp,
                    at_ms: s.t_mono_ms,
                    at_wall: s.t_wall,
                });
                self.close_stage(
                    StageOutcome::Faulted(FaultKind::TimeoutRamp),
                    s.t_mono_ms,
                    s.t_wall,
                    None,
                    out,
                );
                true
            }
            StageKind::Stable if dur >= self.params.max_stage_ms => {
                out.push(ZoneEvent::Fault {
                    zone: self.zone,
                    kind: FaultKind::TimeoutStage,
                    at_ms: s.t_mono_ms,
                    at_wall: s.t_wall,
                });
                self.close_stage(StageOutcome::TimedOut, s.t_mono_ms, s.t_wall, None, out);
                true
            }
            _ => false,
        }
    }

    fn on_invalid(&mut self, s: &ZoneSample, out: &mut Vec<ZoneEvent>) {
        self.state.invalid_streak = self.state.invalid_streak.saturating_add(1);
        if self.state.invalid_since_ms.is_none() {
            self.state.invalid_since_ms = Some(s.t_mono_ms);
        }
        if self.state.invalid_streak == DEGRADED_AFTER_TICKS {
            tracing::warn!(zone = %self.zone, streak = self.state.invalid_streak, "sensor degraded");
            out.push(ZoneEvent::Degraded {
                zone: self.zone,
                consecutive: self.state.invalid_streak,
                at_ms: s.t_mono_ms,
                at_wall: s.t_wall,
            });
        }
        // Sustained invalidity inside an active stage faults the stage.
        if matches!(self.state.stage, StageKind::Ramp | StageKind::Stable) {
            let since = self.state.invalid_since_ms.unwrap_or(s.t_mono_ms);
            if s.t_mono_ms.saturating_sub(since) >= self.params.invalid_fault_ms {
                out.push(ZoneEvent::Fault {
                    zone: self.zone,
                    kind: FaultKind::SensorInvalid,
                    at_ms: s.t_mono_ms,
                    at_wall: s.t_wall,
                });
                self.close_stage(
                    StageOutcome::Faulted(FaultKind::SensorInvalid),
                    s.t_mono_ms,
                    s.t_wall,
                    None,
                    out,
                );
            }
        }
    }

    /// Track the commanded setpoint through its acceptance dwell. Returns a
    /// jump of at least `S_min_F` against the stage reference once it has
    /// persisted `T_sp_sustain_s`.
    fn track_setpoint(&mut self, s: &ZoneSample) -> Option<AcceptedSetpoint> {
        let reference = match self.state.stage {
            StageKind::Idle => self.state.sp_accepted,
            StageKind::Ramp | StageKind::Stable => self.state.sp_ref,
            StageKind::End => return None,
        };
        let Some(reference) = reference else {
            // first observation seeds the idle reference silently
            if self.state.stage == StageKind::Idle {
                self.state.sp_accepted = Some(s.setpoint_f);
            }
            return None;
        };

        let delta = s.setpoint_f - reference;
        if delta.abs() < self.params.s_min_f {
            self.state.pending_setpoint = None;
            if self.state.stage == StageKind::Idle {
                // follow drift so a later jump is measured against reality
                self.state.sp_accepted = Some(s.setpoint_f);
            }
            return None;
        }

        match &self.state.pending_setpoint {
            Some(p) if (p.value - s.setpoint_f).abs() <= SP_EPS_F => {
                if s.t_mono_ms.saturating_sub(p.first_seen_ms) >= self.params.t_sp_sustain_ms {
                    let p = p.clone();
                    self.state.pending_setpoint = None;
                    return Some(AcceptedSetpoint {
                        value: p.value,
                        delta_f: delta,
                        first_seen_ms: p.first_seen_ms,
                        first_seen_wall: p.first_seen_wall,
                        temp_at_first_seen: p.temp_at_first_seen,
                    });
                }
            }
            _ => {
                self.state.pending_setpoint = Some(PendingSetpoint {
                    value: s.setpoint_f,
                    first_seen_ms: s.t_mono_ms,
                    first_seen_wall: s.t_wall,
                    temp_at_first_seen: s.temperature_f,
                });
            }
        }
        None
    }

    fn step_idle(
        &mut self,
        s: &ZoneSample,
        accepted: Option<AcceptedSetpoint>,
        out: &mut Vec<ZoneEvent>,
    ) {
        // Setpoint jump wins over the thermal trigger: its baseline is the
        // more informative one.
        if let Some(acc) = accepted {
            self.state.sp_accepted = Some(acc.value);
            if acc.delta_f > 0.0 {
                self.enter_ramp(
                    acc.value,
                    acc.temp_at_first_seen,
                    acc.first_seen_ms,
                    acc.first_seen_wall,
                    s,
                    out,
                );
            }
            return;
        }

        // Thermal ramp: enough rise above the trailing minimum, with a
        // confirming slope over the last minute.
        if let Some((min_ms, min_f)) = self.state.history.window_min(s.t_mono_ms, u64::MAX) {
            let rise = s.temperature_f - min_f;
            let slope = self
                .state
                .history
                .slope_per_min(s.t_mono_ms, SLOPE_WINDOW_MS, MIN_SLOPE_POINTS);
            if rise >= self.params.delta_ramp_f && slope >= self.params.dt_min_f_per_min {
                let min_wall = s.t_wall
                    - chrono::Duration::milliseconds(
                        s.t_mono_ms.saturating_sub(min_ms) as i64,
                    );
                self.enter_ramp(s.setpoint_f, min_f, min_ms, min_wall, s, out);
            }
        }
    }

    fn enter_ramp(
        &mut self,
        setpoint_f: f64,
        baseline_f: f64,
        started_ms: u64,
        started_wall: DateTime<Utc>,
        s: &ZoneSample,
        out: &mut Vec<ZoneEvent>,
    ) {
        self.state.stage = StageKind::Ramp;
        self.state.stage_started_ms = Some(started_ms);
        self.state.stage_started_wall = Some(started_wall);
        self.state.sp_ref = Some(setpoint_f);
        self.state.baseline_f = Some(baseline_f);
        self.state.in_band_since_ms = None;
        self.state.out_of_band_since_ms = None;
        self.state.out_of_band_since_wall = None;
        self.state.end_stash = None;
        self.state.stats = RunningStats::new();
        // Fold the samples between dwell start and acceptance back in; the
        // stage is dated from the dwell start.
        for (t, y) in self.state.history.points_since(started_ms) {
            self.state.stats.update(y, t);
        }
        tracing::info!(
            zone = %self.zone,
            baseline_f,
            setpoint_f,
            started_ms,
            "ramp started"
        );
        out.push(ZoneEvent::RampStarted {
            zone: self.zone,
            baseline_f,
            setpoint_f,
            at_ms: s.t_mono_ms,
            at_wall: s.t_wall,
        });
    }

    fn step_ramp(
        &mut self,
        s: &ZoneSample,
        accepted: Option<AcceptedSetpoint>,
        out: &mut Vec<ZoneEvent>,
    ) {
        self.state.stats.update(s.temperature_f, s.t_mono_ms);

        if let Some(acc) = accepted {
            if acc.delta_f > 0.0 {
                // retarget mid-ramp; the band moves, so dwell restarts
                self.state.sp_ref = Some(acc.value);
                self.state.in_band_since_ms = None;
            } else {
                tracing::debug!(zone = %self.zone, new_sp = acc.value, "setpoint dropped mid-ramp; keeping reference");
            }
        }

        let sp_ref = self.state.sp_ref.unwrap_or(s.setpoint_f);
        if (s.temperature_f - sp_ref).abs() <= self.params.tol_f {
            let since = *self.state.in_band_since_ms.get_or_insert(s.t_mono_ms);
            if s.t_mono_ms.saturating_sub(since) >= self.params.t_stable_ms {
                self.state.stage = StageKind::Stable;
                self.state.in_band_since_ms = None;
                tracing::info!(zone = %self.zone, setpoint_f = sp_ref, "stage stable");
                out.push(ZoneEvent::Stable {
                    zone: self.zone,
                    at_ms: s.t_mono_ms,
                    at_wall: s.t_wall,
                });
            }
        } else {
            self.state.in_band_since_ms = None;
        }
    }

    fn step_stable(
        &mut self,
        s: &ZoneSample,
        accepted: Option<AcceptedSetpoint>,
        out: &mut Vec<ZoneEvent>,
    ) {
        let sp_ref = self.state.sp_ref.unwrap_or(s.setpoint_f);

        // END path: sustained drop below the stage reference. The stats
        // stash freezes what the stage looked like when the drop began, so
        // cooldown samples stay out of the stage record.
        let off = sp_ref - s.temperature_f;
        if off >= self.params.delta_off_f {
            if self.state.out_of_band_since_ms.is_none() {
                self.state.out_of_band_since_ms = Some(s.t_mono_ms);
                self.state.out_of_band_since_wall = Some(s.t_wall);
                self.state.end_stash = Some(self.state.stats.clone());
            }
        } else {
            self.state.out_of_band_since_ms = None;
            self.state.out_of_band_since_wall = None;
            self.state.end_stash = None;
        }

        self.state.stats.update(s.temperature_f, s.t_mono_ms);

        if let Some(since) = self.state.out_of_band_since_ms {
            if s.t_mono_ms.saturating_sub(since) >= self.params.t_off_sustain_ms {
                let ended_wall = self.state.out_of_band_since_wall.unwrap_or(s.t_wall);
                let stash = self.state.end_stash.take();
                self.close_stage_at(
                    StageOutcome::Completed,
                    since,
                    ended_wall,
                    s.t_mono_ms,
                    s.t_wall,
                    stash,
                    out,
                );
                return;
            }
        }

        if let Some(acc) = accepted {
            if acc.delta_f > 0.0 {
                // new heat command: close this stage at the old setpoint and
                // ramp toward the new one
                self.close_stage(StageOutcome::Completed, s.t_mono_ms, s.t_wall, None, out);
                self.state.stage = StageKind::Idle;
                self.state.sp_accepted = Some(sp_ref);
                self.enter_ramp(
                    acc.value,
                    s.temperature_f,
                    s.t_mono_ms,
                    s.t_wall,
                    s,
                    out,
                );
            } else {
                // downward command: the END path above will see the decay
                tracing::debug!(zone = %self.zone, new_sp = acc.value, "setpoint dropped in stable; awaiting cooldown");
            }
        }
    }

    fn close_stage(
        &mut self,
        outcome: StageOutcome,
        ended_ms: u64,
        ended_wall: DateTime<Utc>,
        stats_override: Option<RunningStats>,
        out: &mut Vec<ZoneEvent>,
    ) {
        self.close_stage_at(outcome, ended_ms, ended_wall, ended_ms, ended_wall, stats_override, out);
    }

    /// `ended_*` are the (possibly backdated) stage boundaries; `at_*` is
    /// the emission time kept monotonic for event ordering.
    #[allow(clippy::too_many_arguments)]
    fn close_stage_at(
        &mut self,
        outcome: StageOutcome,
        ended_ms: u64,
        ended_wall: DateTime<Utc>,
        at_ms: u64,
        at_wall: DateTime<Utc>,
        stats_override: Option<RunningStats>,
        out: &mut Vec<ZoneEvent>,
    ) {
        let stats = stats_override.unwrap_or_else(|| self.state.stats.clone());
        let record = StageRecord {
            zone: self.zone,
            started_ms: self.state.stage_started_ms,
            ended_ms: Some(ended_ms),
            started_at: self.state.stage_started_wall,
            ended_at: Some(ended_wall),
            setpoint_f: self.state.sp_ref,
            outcome,
            stats,
        };
        tracing::info!(
            zone = %self.zone,
            outcome = ?outcome,
            started_ms = ?record.started_ms,
            ended_ms,
            n = record.stats.n(),
            "stage ended"
        );
        self.state.stage = StageKind::End;
        self.state.sp_accepted = self.state.sp_ref.or(self.state.sp_accepted);
        self.state.in_band_since_ms = None;
        self.state.out_of_band_since_ms = None;
        self.state.out_of_band_since_wall = None;
        self.state.end_stash = None;
        self.state.pending_setpoint = None;
        out.push(ZoneEvent::StageEnded {
            record,
            at_ms,
            at_wall,
        });
    }
}
