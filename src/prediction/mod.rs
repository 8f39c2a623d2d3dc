pub mod strategy;
pub mod tracker;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Channel points balance per channel, written by the monitor from
/// points-earned payloads and read by the amount strategies.
pub type PointsBalances = Arc<RwLock<HashMap<String, i64>>>;

pub use strategy::{BetDecision, DecisionPipeline};
pub use tracker::{PredictionTracker, TrackerConfig};
