//! Bet-decision pipeline: outcome, amount, and delay strategies.
//!
//! Each role is a closed set of variants built from configuration by
//! [`DecisionPipeline::from_config`]. Any strategy failure aborts betting for
//! that event. The contract favors a missed bet over an incorrect one.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::db::AnalyticsStore;
use crate::pubsub::message::{Outcome, PredictionEvent};

#[derive(Debug, Error)]
pub enum DecisionError {
    /// No picker verdict: insufficient data or no eligible outcome.
    /// Aborts this event's bet; non-fatal.
    #[error("no verdict: {0}")]
    NoVerdict(String),
    #[error("analytics store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

// ── Outcome ──────────────────────────────────────────────────────────────────

/// Picks which outcome to back, or refuses.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomePicker {
    /// Back the badge whose best qualifying bettor carries the highest
    /// System Quality Number.
    HighestSqn { min_total_bets: u32, min_sqn: f64 },
    /// Back the outcome most users are on.
    MostBackers,
}

impl OutcomePicker {
    pub fn choose<'a>(
        &self,
        event: &'a PredictionEvent,
        store: &dyn AnalyticsStore,
    ) -> Result<&'a Outcome, DecisionError> {
        match self {
            OutcomePicker::HighestSqn {
                min_total_bets,
                min_sqn,
            } => {
                let rows =
                    store.top_candidates(&event.channel_id, *min_total_bets, *min_sqn)?;
                for row in &rows {
                    debug!(
                        "Trusted badge '{}': users={} sqn={:.3} mean_roi={:.3}",
                        row.badge, row.user_count, row.best_sqn, row.mean_roi
                    );
                }
                // Rows come back best-SQN-first; ties already broken by the
                // store's stable ordering.
                let best = rows.first().ok_or_else(|| {
                    DecisionError::NoVerdict(
                        "no qualifying bettors, not enough data gathered yet".to_string(),
                    )
                })?;
                event
                    .outcomes
                    .iter()
                    .find(|o| o.badge.eq_ignore_ascii_case(&best.badge))
                    .ok_or_else(|| {
                        DecisionError::NoVerdict(format!(
                            "outcome badge not found: {}",
                            best.badge
                        ))
                    })
            }
            OutcomePicker::MostBackers => event
                .outcomes
                .iter()
                .max_by_key(|o| o.total_users)
                .ok_or_else(|| DecisionError::NoVerdict("event has no outcomes".to_string())),
        }
    }
}

// ── Amount ───────────────────────────────────────────────────────────────────

/// Sizes the wager from the current point balance.
#[derive(Debug, Clone, PartialEq)]
pub enum AmountPicker {
    /// `floor(min(balance * percentage, max))`, clamped to the balance.
    Percentage { percentage: f64, max: u64 },
    /// A fixed wager; refuses when the balance cannot cover it.
    Constant { amount: u64 },
}

impl AmountPicker {
    pub fn amount(&self, balance: u64) -> Result<u64, DecisionError> {
        let wager = match self {
            AmountPicker::Percentage { percentage, max } => {
                let raw = (balance as f64 * percentage).min(*max as f64);
                (raw.floor() as u64).min(balance)
            }
            AmountPicker::Constant { amount } => {
                if *amount > balance {
                    return Err(DecisionError::NoVerdict(format!(
                        "balance {} below fixed wager {}",
                        balance, amount
                    )));
                }
                *amount
            }
        };
        if wager == 0 {
            return Err(DecisionError::NoVerdict("wager rounded down to zero".to_string()));
        }
        Ok(wager)
    }
}

// ── Delay ────────────────────────────────────────────────────────────────────

/// When the pipeline should fire, as an absolute timestamp. An early lock
/// always preempts the pending delay.
#[derive(Debug, Clone, PartialEq)]
pub enum DelayCalculator {
    /// N seconds after the event was created.
    FromStart { seconds: i64 },
    /// N seconds before the lock deadline.
    FromEnd { seconds: i64 },
}

impl DelayCalculator {
    pub fn fire_at(&self, event: &PredictionEvent) -> DateTime<Utc> {
        match self {
            DelayCalculator::FromStart { seconds } => {
                event.created_at + Duration::seconds(*seconds)
            }
            DelayCalculator::FromEnd { seconds } => event.lock_at() - Duration::seconds(*seconds),
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// A fully decided bet, ready to hand to the command API.
#[derive(Debug, Clone, PartialEq)]
pub struct BetDecision {
    pub event_id: String,
    pub outcome_id: String,
    pub badge: String,
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct DecisionPipeline {
    pub outcome: OutcomePicker,
    pub amount: AmountPicker,
    pub delay: DelayCalculator,
}

impl DecisionPipeline {
    /// Build the three strategies from configuration. Unknown strategy names
    /// are a configuration error.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let outcome = match config.outcome_picker.as_str() {
            "highest-sqn" => OutcomePicker::HighestSqn {
                min_total_bets: config.min_total_bets,
                min_sqn: config.min_sqn,
            },
            "most-backers" => OutcomePicker::MostBackers,
            other => anyhow::bail!("unknown outcome picker: {}", other),
        };
        let amount = match config.amount_picker.as_str() {
            "percentage" => AmountPicker::Percentage {
                percentage: config.bet_percentage,
                max: config.max_bet,
            },
            "constant" => AmountPicker::Constant {
                amount: config.max_bet,
            },
            other => anyhow::bail!("unknown amount picker: {}", other),
        };
        let delay = match config.delay_calculator.as_str() {
            "from-start" => DelayCalculator::FromStart {
                seconds: config.delay_seconds,
            },
            "from-end" => DelayCalculator::FromEnd {
                seconds: config.delay_seconds,
            },
            other => anyhow::bail!("unknown delay calculator: {}", other),
        };
        Ok(DecisionPipeline {
            outcome,
            amount,
            delay,
        })
    }

    pub fn fire_at(&self, event: &PredictionEvent) -> DateTime<Utc> {
        self.delay.fire_at(event)
    }

    /// Run outcome then amount selection. Returns a placeable decision or the
    /// first strategy failure.
    pub fn decide(
        &self,
        event: &PredictionEvent,
        balance: u64,
        store: &dyn AnalyticsStore,
    ) -> Result<BetDecision, DecisionError> {
        let outcome = self.outcome.choose(event, store)?;
        let amount = self.amount.amount(balance)?;
        Ok(BetDecision {
            event_id: event.id.clone(),
            outcome_id: outcome.id.clone(),
            badge: outcome.badge.clone(),
            amount,
        })
    }
}
