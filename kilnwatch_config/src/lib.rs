use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Deserialize)]
pub struct Line {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Zones {
    pub preheat: bool,
    pub main: bool,
    pub rib: bool,
}

impl Default for Zones {
    fn default() -> Self {
        Self {
            preheat: true,
            main: true,
            rib: true,
        }
    }
}

/// Detection thresholds. Field names follow the plant-floor parameter
/// sheet; defaults match the shipped tuning.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Fsm {
    pub version: u32,
    pub sampling_period_s: f64,
    pub tol_f: f64,
    pub delta_ramp_f: f64,
    pub dt_min_f_per_min: f64,
    pub t_stable_s: u64,
    pub delta_off_f: f64,
    pub t_off_sustain_s: u64,
    pub s_min_f: f64,
    pub t_sp_sustain_s: u64,
    pub max_ramp_s: u64,
    pub max_stage_s: u64,
    pub quiet_window_s: u64,
    pub dt_quiet_f_per_min: f64,
    pub allow_main_without_preheat: bool,
    pub continue_after_fault_if_next_stage_ramps: bool,
}

impl Default for Fsm {
    fn default() -> Self {
        Self {
            version: 1,
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

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub line: Line,
    #[serde(default)]
    pub zones: Zones,
    #[serde(default)]
    pub fsm: Fsm,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.line.id.trim().is_empty() {
            return Err(ConfigError::Invalid("line.id must not be empty"));
        }
        if !(self.fsm.sampling_period_s.is_finite() && self.fsm.sampling_period_s > 0.0) {
            return Err(ConfigError::Invalid("fsm.sampling_period_s must be > 0"));
        }
        for (v, msg) in [
            (self.fsm.tol_f, "fsm.tol_f must be finite and >= 0"),
            (self.fsm.delta_ramp_f, "fsm.delta_ramp_f must be finite and >= 0"),
            (
                self.fsm.dt_min_f_per_min,
                "fsm.dt_min_f_per_min must be finite and >= 0",
            ),
            (self.fsm.delta_off_f, "fsm.delta_off_f must be finite and >= 0"),
            (self.fsm.s_min_f, "fsm.s_min_f must be finite and >= 0"),
            (
                self.fsm.dt_quiet_f_per_min,
                "fsm.dt_quiet_f_per_min must be finite and >= 0",
            ),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(ConfigError::Invalid(msg));
            }
        }
        if self.fsm.max_ramp_s == 0 {
            return Err(ConfigError::Invalid("fsm.max_ramp_s must be >= 1"));
        }
        if self.fsm.max_stage_s < self.fsm.max_ramp_s {
            return Err(ConfigError::Invalid("fsm.max_stage_s must be >= fsm.max_ramp_s"));
        }
        if self.fsm.quiet_window_s == 0 {
            return Err(ConfigError::Invalid("fsm.quiet_window_s must be >= 1"));
        }
        if !(self.zones.preheat || self.zones.main || self.zones.rib) {
            return Err(ConfigError::Invalid("at least one zone must be enabled"));
        }
        if let Some(rot) = self.logging.rotation.as_deref() {
            if !matches!(rot.to_ascii_lowercase().as_str(), "never" | "daily" | "hourly") {
                return Err(ConfigError::Invalid(
                    "logging.rotation must be never, daily, or hourly",
                ));
            }
        }
        Ok(())
    }
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}
