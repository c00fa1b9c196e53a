pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A heating zone on a production line, in canonical cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Preheat,
    Main,
    Rib,
}

impl Zone {
    /// All zones in canonical cycle order (preheat, main, rib).
    pub const ALL: [Zone; 3] = [Zone::Preheat, Zone::Main, Zone::Rib];

    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Preheat => "preheat",
            Zone::Main => "main",
            Zone::Rib => "rib",
        }
    }
}

impl core::fmt::Display for Zone {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reading for one zone.
///
/// `t_mono_ms` is milliseconds on the line's shared monotonic timeline and
/// must never decrease for a given zone. `t_wall` is the wall-clock stamp
/// used in emitted records. `valid` is false for stale, missing, or
/// sentinel readings; the temperature and setpoint of an invalid sample
/// must not be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSample {
    pub zone: Zone,
    pub t_mono_ms: u64,
    pub t_wall: DateTime<Utc>,
    pub temperature_f: f64,
    pub setpoint_f: f64,
    pub valid: bool,
}

impl ZoneSample {
    /// An explicitly-invalid sample, used when the source has nothing fresh.
    pub fn invalid(zone: Zone, t_mono_ms: u64, t_wall: DateTime<Utc>) -> Self {
        Self {
            zone,
            t_mono_ms,
            t_wall,
            temperature_f: 0.0,
            setpoint_f: 0.0,
            valid: false,
        }
    }
}

/// Provider of the most recent reading per zone.
///
/// Implementations are shared between line workers, so reads take `&self`
/// and must be safe for concurrent callers.
pub trait SampleSource: Send + Sync {
    /// Latest reading for `zone`, or `None` if nothing has been read yet.
    fn get_latest(
        &self,
        zone: Zone,
    ) -> Result<Option<ZoneSample>, Box<dyn std::error::Error + Send + Sync>>;
}
