//! Detection thresholds and cycle policy for one line.

use serde::{Deserialize, Serialize};

use kilnwatch_traits::Zone;

use crate::error::{BuildError, Result};
use crate::util::{period_ms, s_to_ms};

/// Which zones participate in the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledZones {
    pub preheat: bool,
    pub main: bool,
    pub rib: bool,
}

impl Default for EnabledZones {
    fn default() -> Self {
        Self {
            preheat: true,
            main: true,
            rib: true,
        }
    }
}

impl EnabledZones {
    pub fn contains(&self, zone: Zone) -> bool {
        match zone {
            Zone::Preheat => self.preheat,
            Zone::Main => self.main,
            Zone::Rib => self.rib,
        }
    }

    /// Enabled zones in canonical cycle order.
    pub fn cycle_order(&self) -> Vec<Zone> {
        Zone::ALL
            .into_iter()
            .filter(|z| self.contains(*z))
            .collect()
    }
}

/// FSM configuration. Immutable within a run; a reload applies to the next
/// run (`version` distinguishes the two in records).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsmCfg {
    pub version: u32,
    pub zones: EnabledZones,
    /// Worker tick interval, seconds.
    pub sampling_period_s: f64,
    /// Half-width of the stable tolerance band around the setpoint, °F.
    pub tol_f: f64,
    /// Minimum rise from the ramp baseline to confirm RAMP, °F.
    pub delta_ramp_f: f64,
    /// Minimum slope to confirm RAMP, °F per minute.
    pub dt_min_f_per_min: f64,
    /// Continuous in-band dwell required to enter STABLE, seconds.
    pub t_stable_s: u64,
    /// Drop below setpoint signalling END, °F.
    pub delta_off_f: f64,
    /// Out-of-band dwell to confirm END, seconds.
    pub t_off_sustain_s: u64,
    /// Minimum setpoint jump to arm ramp detection, °F.
    pub s_min_f: f64,
    /// Dwell required for a new setpoint to be accepted, seconds.
    pub t_sp_sustain_s: u64,
    /// RAMP timeout, seconds.
    pub max_ramp_s: u64,
    /// Whole-stage timeout, seconds.
    pub max_stage_s: u64,
    /// Idle window after last activity before a partial close, seconds.
    pub quiet_window_s: u64,
    /// Slope below which the line counts as quiet, °F per minute.
    pub dt_quiet_f_per_min: f64,
    pub allow_main_without_preheat: bool,
    pub continue_after_fault_if_next_stage_ramps: bool,
}

impl Default for FsmCfg {
    fn default() -> Self {
        Self {
            version: 1,
            zones: EnabledZones::default(),
            sampling_period_s: 2.0,
            tol_f: 8.0,
            delta_ramp_f: 20.0,
            dt_min_f_per_min: 10.0,
            t_stable_s: 90,
            delta_off_f: 20.0,
            t_off_sustain_s: 45,
            s_min_f: 20.0,
            t_sp_sustain_s: 20,
            max_ramp_s: 900,
            max_stage_s: 7200,
            quiet_window_s: 720,
            dt_quiet_f_per_min: 2.0,
            allow_main_without_preheat: true,
            continue_after_fault_if_next_stage_ramps: true,
        }
    }
}

impl FsmCfg {
    /// Validate before use. The only fatal error in the core.
    pub fn validate(&self) -> Result<()> {
        if !(self.sampling_period_s.is_finite() && self.sampling_period_s > 0.0) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "sampling_period_s must be > 0",
            )));
        }
        for (v, name) in [
            (self.tol_f, "tol_f must be finite and >= 0"),
            (self.delta_ramp_f, "delta_ramp_f must be finite and >= 0"),
            (self.dt_min_f_per_min, "dt_min_f_per_min must be finite and >= 0"),
            (self.delta_off_f, "delta_off_f must be finite and >= 0"),
            (self.s_min_f, "s_min_f must be finite and >= 0"),
            (self.dt_quiet_f_per_min, "dt_quiet_f_per_min must be finite and >= 0"),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(eyre::Report::new(BuildError::InvalidConfig(name)));
            }
        }
        if self.max_ramp_s == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "max_ramp_s must be >= 1",
            )));
        }
        if self.max_stage_s < self.max_ramp_s {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "max_stage_s must be >= max_ramp_s",
            )));
        }
        if self.quiet_window_s == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "quiet_window_s must be >= 1",
            )));
        }
        if self.zones.cycle_order().is_empty() {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "at least one zone must be enabled",
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn period_ms(&self) -> u64 {
        period_ms(self.sampling_period_s)
    }

    /// Sample age past which a reading counts as stale (3 ticks).
    #[inline]
    pub fn max_sample_age_ms(&self) -> u64 {
        self.period_ms().saturating_mul(3)
    }

    /// Gap between valid samples past which dwell continuity resets (2 ticks).
    #[inline]
    pub fn gap_reset_ms(&self) -> u64 {
        self.period_ms().saturating_mul(2)
    }

    #[inline]
    pub fn t_stable_ms(&self) -> u64 {
        s_to_ms(self.t_stable_s)
    }

    #[inline]
    pub fn t_off_sustain_ms(&self) -> u64 {
        s_to_ms(self.t_off_sustain_s)
    }

    #[inline]
    pub fn t_sp_sustain_ms(&self) -> u64 {
        s_to_ms(self.t_sp_sustain_s)
    }

    #[inline]
    pub fn max_ramp_ms(&self) -> u64 {
        s_to_ms(self.max_ramp_s)
    }

    #[inline]
    pub fn max_stage_ms(&self) -> u64 {
        s_to_ms(self.max_stage_s)
    }

    #[inline]
    pub fn quiet_window_ms(&self) -> u64 {
        s_to_ms(self.quiet_window_s)
    }

    /// Sustained sensor invalidity past this faults an active stage.
    #[inline]
    pub fn invalid_fault_ms(&self) -> u64 {
        self.max_ramp_ms() / 2
    }

    /// Ring capacity for the quiet-slope window, sized per the window and
    /// tick period plus headroom.
    pub fn quiet_ring_capacity(&self) -> usize {
        (self.quiet_window_ms() / self.period_ms()) as usize + 8
    }

    /// Ring capacity for a detector's trailing history. Sized like the
    /// quiet ring so the ramp baseline can look further back than the 60 s
    /// slope window on slow ramps.
    pub fn history_ring_capacity(&self) -> usize {
        self.quiet_ring_capacity()
    }
}
