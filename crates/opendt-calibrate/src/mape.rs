//! MAPE scoring on an aligned minute grid
//!
//! Both series are rebased to their own start and bucketed into 1-minute
//! cells (mean within a cell). Only cells present on both sides score; the
//! denominator is floored at ε so a zero-power measurement cannot blow up
//! the error.

use std::collections::BTreeMap;

const MINUTE_MS: i64 = 60_000;
const EPSILON_W: f64 = 1e-6;

/// Bucket a `(t_ms, value)` series into minutes relative to its first point.
pub fn resample_to_minutes(series: &[(i64, f64)]) -> BTreeMap<i64, f64> {
    let mut buckets: BTreeMap<i64, (f64, u32)> = BTreeMap::new();
    let Some(&(first, _)) = series.iter().min_by_key(|(t, _)| *t) else {
        return BTreeMap::new();
    };
    for (t, v) in series {
        let minute = (t - first).div_euclid(MINUTE_MS);
        let slot = buckets.entry(minute).or_insert((0.0, 0));
        slot.0 += v;
        slot.1 += 1;
    }
    buckets
        .into_iter()
        .map(|(minute, (sum, n))| (minute, sum / f64::from(n)))
        .collect()
}

/// Mean absolute percentage error over aligned minutes; `None` when the two
/// series share no cell.
pub fn mape(observed: &[(i64, f64)], simulated: &[(i64, f64)]) -> Option<f64> {
    let observed = resample_to_minutes(observed);
    let simulated = resample_to_minutes(simulated);

    let mut total = 0.0;
    let mut aligned = 0u32;
    for (minute, obs) in &observed {
        let Some(sim) = simulated.get(minute) else { continue };
        total += (obs - sim).abs() / obs.abs().max(EPSILON_W);
        aligned += 1;
    }
    (aligned > 0).then(|| total / f64::from(aligned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(minutes: i64, watts: f64) -> Vec<(i64, f64)> {
        (0..minutes).map(|m| (m * MINUTE_MS, watts)).collect()
    }

    #[test]
    fn test_identical_series_score_zero() {
        let series = flat(60, 19_000.0);
        assert_eq!(mape(&series, &series), Some(0.0));
    }

    #[test]
    fn test_constant_offset_scores_relative_error() {
        let observed = flat(60, 19_000.0);
        let simulated = flat(60, 18_900.0);
        let score = mape(&observed, &simulated).unwrap();
        assert!((score - 100.0 / 19_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_unaligned_points_are_skipped() {
        let observed = flat(10, 100.0);
        // Simulated only covers the first 5 minutes
        let simulated = flat(5, 110.0);
        let score = mape(&observed, &simulated).unwrap();
        assert!((score - 0.1).abs() < 1e-9, "only the overlap scores: {score}");
    }

    #[test]
    fn test_disjoint_series_yield_none() {
        let observed = flat(5, 100.0);
        assert_eq!(mape(&observed, &[]), None);
    }

    #[test]
    fn test_series_are_rebased_to_their_own_start() {
        // Observed in epoch milliseconds, simulated from zero
        let observed: Vec<(i64, f64)> = (0..5).map(|m| (1_700_000_000_000 + m * MINUTE_MS, 200.0)).collect();
        let simulated = flat(5, 200.0);
        assert_eq!(mape(&observed, &simulated), Some(0.0));
    }

    #[test]
    fn test_sub_minute_samples_average_within_cell() {
        let observed = vec![(0, 100.0), (30_000, 300.0)];
        let simulated = vec![(0, 200.0)];
        assert_eq!(mape(&observed, &simulated), Some(0.0));
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let observed = flat(60, 19_000.0);
        let simulated = flat(60, 20_500.0);
        assert_eq!(mape(&observed, &simulated), mape(&observed, &simulated));
    }
}
