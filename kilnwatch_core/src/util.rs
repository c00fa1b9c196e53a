//! Common time/unit helpers for kilnwatch_core.

/// Convert a sampling period in seconds to whole milliseconds.
/// - Non-finite or non-positive inputs clamp to 1 ms.
#[inline]
pub fn period_ms(period_s: f64) -> u64 {
    if !period_s.is_finite() || period_s <= 0.0 {
        return 1;
    }
    ((period_s * 1000.0).round() as u64).max(1)
}

/// Convert whole seconds to milliseconds, saturating.
#[inline]
pub fn s_to_ms(s: u64) -> u64 {
    s.saturating_mul(1000)
}

/// Slope of a least-squares line fit through `(t_ms, y)` points, in
/// y-units per minute. Returns 0.0 with fewer than `min_points` points or
/// a degenerate time spread.
pub fn least_squares_slope_per_min(points: &[(u64, f64)], min_points: usize) -> f64 {
    let n = points.len();
    if n < min_points.max(2) {
        return 0.0;
    }
    let t0 = points[0].0;
    let nf = n as f64;
    let mut sum_t = 0.0;
    let mut sum_y = 0.0;
    for &(t, y) in points {
        sum_t += (t - t0) as f64;
        sum_y += y;
    }
    let mean_t = sum_t / nf;
    let mean_y = sum_y / nf;
    let mut num = 0.0;
    let mut den = 0.0;
    for &(t, y) in points {
        let dt = (t - t0) as f64 - mean_t;
        num += dt * (y - mean_y);
        den += dt * dt;
    }
    if den == 0.0 {
        return 0.0;
    }
    // per-ms slope scaled to per-minute
    (num / den) * 60_000.0
}
