//! Pure statistics helpers for the per-user betting aggregates.
//!
//! Kept free of SQL so the resolution fold and the SQN formula are unit
//! testable in isolation.

/// Sample-size cap in the SQN formula: confidence stops growing past 100 bets.
const SQN_SAMPLE_CAP: i64 = 100;

/// Population standard deviation from accumulated sums:
/// `sqrt(sq_sum/n − (sum/n)²)`. Zero for n < 2 or on numeric underflow.
pub fn population_stddev(roi_sum: f64, roi_squared_sum: f64, n: i64) -> f64 {
    if n < 2 {
        return 0.0;
    }
    let n = n as f64;
    let mean = roi_sum / n;
    let variance = roi_squared_sum / n - mean * mean;
    if variance > 0.0 {
        variance.sqrt()
    } else {
        0.0
    }
}

/// System Quality Number: `sqrt(min(n, 100)) * mean_roi / stddev`.
/// `None` when the stddev is not strictly positive (never divides by zero)
/// or there is no sample at all.
pub fn system_quality_number(n: i64, mean_roi: f64, stddev: f64) -> Option<f64> {
    if n < 1 || stddev <= 0.0 {
        return None;
    }
    Some((n.min(SQN_SAMPLE_CAP) as f64).sqrt() * mean_roi / stddev)
}

/// ROI of one resolved bet: `payout_ratio − 1` on a win, `−1` on a loss.
pub fn bet_roi(won: bool, payout_ratio: f64) -> f64 {
    if won {
        payout_ratio - 1.0
    } else {
        -1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sqn_reference_value() {
        // N=100, meanROI=0.5, stddev=2 ⇒ sqrt(100)*0.5/2 = 2.5
        let sqn = system_quality_number(100, 0.5, 2.0).unwrap();
        assert_relative_eq!(sqn, 2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_sqn_sample_size_is_capped() {
        let capped = system_quality_number(100, 0.5, 2.0).unwrap();
        let over = system_quality_number(10_000, 0.5, 2.0).unwrap();
        assert_relative_eq!(capped, over, epsilon = 1e-9);
    }

    #[test]
    fn test_sqn_zero_stddev_is_ineligible() {
        assert_eq!(system_quality_number(10, 0.5, 0.0), None);
        assert_eq!(system_quality_number(10, 0.5, -1.0), None);
    }

    #[test]
    fn test_population_stddev() {
        // Two observations: +1 and -1 → mean 0, stddev 1
        assert_relative_eq!(population_stddev(0.0, 2.0, 2), 1.0, epsilon = 1e-9);
        // Single observation carries no spread
        assert_relative_eq!(population_stddev(3.0, 9.0, 1), 0.0, epsilon = 1e-9);
        // Identical observations → zero spread (no negative-variance sqrt)
        assert_relative_eq!(population_stddev(4.0, 8.0, 2), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bet_roi() {
        assert_relative_eq!(bet_roi(true, 4.0), 3.0, epsilon = 1e-9);
        assert_relative_eq!(bet_roi(false, 4.0), -1.0, epsilon = 1e-9);
    }
}
