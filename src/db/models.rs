use super::stats::{bet_roi, population_stddev, system_quality_number};

/// Badge-agnostic per-user-per-channel betting aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUserStat {
    pub channel_id: String,
    pub user_id: String,
    pub bet_count: i64,
    pub win_count: i64,
    pub win_rate: f64,
    pub roi_sum: f64,
    pub roi_squared_sum: f64,
    pub stddev: f64,
    pub sqn: f64,
}

impl ChannelUserStat {
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        ChannelUserStat {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            bet_count: 0,
            win_count: 0,
            win_rate: 0.0,
            roi_sum: 0.0,
            roi_squared_sum: 0.0,
            stddev: 0.0,
            sqn: 0.0,
        }
    }

    /// Fold one resolved bet into the aggregate. All derived fields are
    /// recomputed from the updated population sums in one pass; stddev and
    /// SQN keep their previous value while the sample is too small to carry
    /// one (fewer than two bets, or zero spread).
    pub fn apply_resolution(&mut self, won: bool, payout_ratio: f64) {
        let roi = bet_roi(won, payout_ratio);
        self.bet_count += 1;
        if won {
            self.win_count += 1;
        }
        self.win_rate = self.win_count as f64 / self.bet_count as f64;
        self.roi_sum += roi;
        self.roi_squared_sum += roi * roi;
        if self.bet_count > 1 {
            self.stddev = population_stddev(self.roi_sum, self.roi_squared_sum, self.bet_count);
        }
        let mean_roi = self.roi_sum / self.bet_count as f64;
        if let Some(sqn) = system_quality_number(self.bet_count, mean_roi, self.stddev) {
            self.sqn = sqn;
        }
    }
}

/// One row from `top_candidates`: aggregate over the qualifying bettors
/// currently backing one badge.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedBadge {
    pub badge: String,
    pub user_count: i64,
    pub mean_win_rate: f64,
    pub mean_roi: f64,
    pub weighted_mean_roi: f64,
    /// Highest SQN among the backers; the ranking key.
    pub best_sqn: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_apply_resolution_win_then_loss() {
        let mut stat = ChannelUserStat::new("c", "u");
        stat.apply_resolution(true, 3.0); // roi +2
        assert_eq!(stat.bet_count, 1);
        assert_eq!(stat.win_count, 1);
        assert_relative_eq!(stat.win_rate, 1.0, epsilon = 1e-9);
        assert_relative_eq!(stat.roi_sum, 2.0, epsilon = 1e-9);
        // single observation: no spread yet
        assert_relative_eq!(stat.stddev, 0.0, epsilon = 1e-9);
        assert_relative_eq!(stat.sqn, 0.0, epsilon = 1e-9);

        stat.apply_resolution(false, 3.0); // roi -1
        assert_eq!(stat.bet_count, 2);
        assert_eq!(stat.win_count, 1);
        assert_relative_eq!(stat.win_rate, 0.5, epsilon = 1e-9);
        assert_relative_eq!(stat.roi_sum, 1.0, epsilon = 1e-9);
        assert_relative_eq!(stat.roi_squared_sum, 5.0, epsilon = 1e-9);
        // mean 0.5, variance 5/2 - 0.25 = 2.25 → stddev 1.5
        assert_relative_eq!(stat.stddev, 1.5, epsilon = 1e-9);
        // sqrt(2) * 0.5 / 1.5
        assert_relative_eq!(stat.sqn, 2f64.sqrt() * 0.5 / 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_spread_keeps_sqn_untouched() {
        let mut stat = ChannelUserStat::new("c", "u");
        // Two identical losses: mean -1, zero variance → SQN stays at 0
        stat.apply_resolution(false, 2.0);
        stat.apply_resolution(false, 2.0);
        assert_relative_eq!(stat.stddev, 0.0, epsilon = 1e-9);
        assert_relative_eq!(stat.sqn, 0.0, epsilon = 1e-9);
    }
}
