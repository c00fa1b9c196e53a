//! Fixed-capacity sample history used for slope estimation.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::util::least_squares_slope_per_min;

/// Bounded ring of `(t_mono_ms, temperature_F)` points. Pushing past
/// capacity evicts the oldest point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRing {
    cap: usize,
    buf: VecDeque<(u64, f64)>,
}

impl SampleRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            buf: VecDeque::with_capacity(cap.max(1)),
        }
    }

    pub fn push(&mut self, t_ms: u64, temp_f: f64) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back((t_ms, temp_f));
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Points with `t >= since_ms`, oldest first.
    pub fn points_since(&self, since_ms: u64) -> Vec<(u64, f64)> {
        self.buf
            .iter()
            .copied()
            .filter(|(t, _)| *t >= since_ms)
            .collect()
    }

    /// Minimum temperature and its timestamp over the trailing `window_ms`
    /// ending at `now_ms`. The latest qualifying point wins ties, so a flat
    /// idle plateau dates the minimum at liftoff rather than window entry.
    pub fn window_min(&self, now_ms: u64, window_ms: u64) -> Option<(u64, f64)> {
        let since = now_ms.saturating_sub(window_ms);
        let mut best: Option<(u64, f64)> = None;
        for &(t, y) in &self.buf {
            if t < since {
                continue;
            }
            match best {
                Some((_, by)) if by < y => {}
                _ => best = Some((t, y)),
            }
        }
        best
    }

    /// Milliseconds spanned by the buffered points in the trailing
    /// `window_ms` ending at `now_ms`.
    pub fn window_span_ms(&self, now_ms: u64, window_ms: u64) -> u64 {
        let since = now_ms.saturating_sub(window_ms);
        let mut first = None;
        let mut last = None;
        for &(t, _) in &self.buf {
            if t < since {
                continue;
            }
            if first.is_none() {
                first = Some(t);
            }
            last = Some(t);
        }
        match (first, last) {
            (Some(a), Some(b)) => b.saturating_sub(a),
            _ => 0,
        }
    }

    /// Least-squares slope in °F/min over the trailing `window_ms` ending
    /// at `now_ms`; 0.0 with fewer than `min_points` points.
    pub fn slope_per_min(&self, now_ms: u64, window_ms: u64, min_points: usize) -> f64 {
        let since = now_ms.saturating_sub(window_ms);
        let pts = self.points_since(since);
        least_squares_slope_per_min(&pts, min_points)
    }
}
