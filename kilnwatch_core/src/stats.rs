//! Online per-stage temperature statistics.

use serde::{Deserialize, Serialize};

/// Welford running moments over the valid samples of one stage.
///
/// Moments stay finite for serialization; presentation NaNs appear only in
/// [`StatsSnapshot`] when `n == 0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    n: u64,
    mean: f64,
    m2: f64,
    min: Option<f64>,
    max: Option<f64>,
    first_t_ms: Option<u64>,
    last_t_ms: Option<u64>,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one valid in-stage sample into the moments.
    pub fn update(&mut self, x: f64, t_ms: u64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
        self.min = Some(self.min.map_or(x, |m| m.min(x)));
        self.max = Some(self.max.map_or(x, |m| m.max(x)));
        if self.first_t_ms.is_none() {
            self.first_t_ms = Some(t_ms);
        }
        self.last_t_ms = Some(t_ms);
    }

    #[inline]
    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let variance = if self.n >= 2 {
            self.m2 / (self.n - 1) as f64
        } else if self.n == 1 {
            0.0
        } else {
            f64::NAN
        };
        StatsSnapshot {
            n: self.n,
            mean: if self.n > 0 { self.mean } else { f64::NAN },
            variance,
            stddev: variance.sqrt(),
            min: self.min.unwrap_or(f64::NAN),
            max: self.max.unwrap_or(f64::NAN),
            first_t_ms: self.first_t_ms,
            last_t_ms: self.last_t_ms,
        }
    }
}

/// Point-in-time view of [`RunningStats`]. All temperature fields are NaN
/// when no samples were folded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub n: u64,
    pub mean: f64,
    pub variance: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub first_t_ms: Option<u64>,
    pub last_t_ms: Option<u64>,
}
