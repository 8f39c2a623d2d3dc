//! Per-event prediction state machine.
//!
//! Consumes dispatched prediction events and drives each one through
//! `Active → Locked → {Resolved, Canceled}`. While an event is active the
//! tracker records the latest observed bet per user; the lock transition
//! invokes the decision pipeline exactly once; resolution folds every tracked
//! bet into the analytics store as one atomic unit.
//!
//! All activity for a single event is serialized through this task, so the
//! lock/resolve/cancel messages and the timeout-driven expiry path can never
//! race. Scheduled decisions are cancellable task handles tied to the event's
//! lifecycle, so an early lock preempts a still-pending delay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::CommandApi;
use crate::db::AnalyticsStore;
use crate::pubsub::message::{PredictionEvent, PredictionStatus};
use crate::pubsub::TopicEvent;

use super::strategy::DecisionPipeline;
use super::PointsBalances;

/// How often the expiry sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub dry_run: bool,
    /// An event still non-terminal after this long is force-expired.
    pub event_timeout: Duration,
    /// Channels with betting enabled; others are tracked for analytics only.
    pub bet_channels: HashSet<String>,
}

enum DecisionState {
    /// Betting disabled for the channel, or nothing scheduled yet.
    NotScheduled,
    /// Single-shot delayed execution; aborted when lock/cancel/expiry
    /// supersedes it.
    Pending(JoinHandle<()>),
    /// The pipeline ran (or was skipped); it must never run again.
    Attempted,
}

struct TrackedPrediction {
    event: PredictionEvent,
    /// userId → (badge, observedAt); last observation before lock wins.
    bets: HashMap<String, (String, DateTime<Utc>)>,
    decision: DecisionState,
    tracked_at: tokio::time::Instant,
}

impl TrackedPrediction {
    fn abort_pending(&mut self) {
        if let DecisionState::Pending(handle) =
            std::mem::replace(&mut self.decision, DecisionState::NotScheduled)
        {
            handle.abort();
        }
    }
}

fn status_rank(status: PredictionStatus) -> u8 {
    match status {
        PredictionStatus::Active => 0,
        PredictionStatus::Locked => 1,
        PredictionStatus::Resolved | PredictionStatus::Canceled => 2,
        PredictionStatus::Unknown => 0,
    }
}

pub struct PredictionTracker {
    cfg: TrackerConfig,
    pipeline: DecisionPipeline,
    store: Arc<dyn AnalyticsStore>,
    api: Arc<dyn CommandApi>,
    balances: PointsBalances,
    /// eventId → tracked state.
    events: HashMap<String, TrackedPrediction>,
    /// channelId → the currently open event on that channel.
    open_by_channel: HashMap<String, String>,
    due_tx: mpsc::Sender<String>,
    due_rx: Option<mpsc::Receiver<String>>,
}

impl PredictionTracker {
    pub fn new(
        cfg: TrackerConfig,
        pipeline: DecisionPipeline,
        store: Arc<dyn AnalyticsStore>,
        api: Arc<dyn CommandApi>,
        balances: PointsBalances,
    ) -> Self {
        let (due_tx, due_rx) = mpsc::channel(64);
        PredictionTracker {
            cfg,
            pipeline,
            store,
            api,
            balances,
            events: HashMap::new(),
            open_by_channel: HashMap::new(),
            due_tx,
            due_rx: Some(due_rx),
        }
    }

    /// Main loop: consumes dispatched events and internal decision-due
    /// notifications until the dispatcher channel closes.
    pub async fn run(mut self, mut events_rx: mpsc::Receiver<TopicEvent>) {
        info!("Prediction tracker started");
        let mut due_rx = self.due_rx.take().expect("run called twice");
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                ev = events_rx.recv() => {
                    match ev {
                        Some(ev) => self.on_event(ev).await,
                        None => break,
                    }
                }
                Some(event_id) = due_rx.recv() => {
                    self.run_decision(&event_id, "scheduled delay").await;
                }
                _ = sweep.tick() => self.expire_stale(),
            }
        }

        // Shutdown: cancel every still-pending scheduled decision.
        for tracked in self.events.values_mut() {
            tracked.abort_pending();
        }
        info!("Prediction tracker stopped");
    }

    async fn on_event(&mut self, event: TopicEvent) {
        match event {
            TopicEvent::PredictionCreated { event } => self.on_prediction(event).await,
            TopicEvent::PredictionUpdated { event } => self.on_prediction(event).await,
            TopicEvent::BetObserved {
                channel_id,
                user_id,
                badge,
                observed_at,
            } => self.on_bet_observed(&channel_id, user_id, badge, observed_at),
            other => debug!("Tracker ignoring non-prediction event: {:?}", other),
        }
    }

    /// Entry point for both `event-created` and `event-updated`: track the
    /// event if new, then apply the (monotonic) status transition.
    async fn on_prediction(&mut self, event: PredictionEvent) {
        let event_id = event.id.clone();

        if !self.events.contains_key(&event_id) {
            if status_rank(event.status) >= 2 {
                // Terminal state for an event we never tracked, nothing to do.
                return;
            }
            self.track_new(event.clone());
        }

        let tracked = self.events.get_mut(&event_id).expect("just tracked");
        if status_rank(event.status) < status_rank(tracked.event.status) {
            debug!(
                "Ignoring stale status {:?} for event {} (already {:?})",
                event.status, event_id, tracked.event.status
            );
            return;
        }

        let was = tracked.event.status;
        tracked.event = event;

        match tracked.event.status {
            PredictionStatus::Active | PredictionStatus::Unknown => {}
            PredictionStatus::Locked => {
                if was != PredictionStatus::Locked {
                    info!(
                        "Prediction '{}' locked on channel {}",
                        tracked.event.title, tracked.event.channel_id
                    );
                }
                // Idempotent against duplicate LOCKED deliveries.
                self.run_decision(&event_id, "lock").await;
            }
            PredictionStatus::Resolved => self.on_resolved(&event_id),
            PredictionStatus::Canceled => self.on_canceled(&event_id),
        }
    }

    fn track_new(&mut self, event: PredictionEvent) {
        info!(
            "Tracking prediction '{}' on channel {} (locks at {})",
            event.title,
            event.channel_id,
            event.lock_at()
        );
        if let Err(e) = self.store.record_prediction(
            &event.channel_id,
            &event.id,
            &event.title,
            event.created_at,
        ) {
            error!("Failed to record prediction {}: {}", event.id, e);
        }

        let decision = if self.cfg.bet_channels.contains(&event.channel_id) {
            DecisionState::Pending(self.schedule_decision(&event))
        } else {
            DecisionState::NotScheduled
        };

        self.open_by_channel
            .insert(event.channel_id.clone(), event.id.clone());
        self.events.insert(
            event.id.clone(),
            TrackedPrediction {
                event,
                bets: HashMap::new(),
                decision,
                tracked_at: tokio::time::Instant::now(),
            },
        );
    }

    /// Spawn the single-shot delayed execution for this event. The handle is
    /// aborted the instant the event locks early, resolves, cancels or
    /// expires, so at most one pipeline execution ever fires.
    fn schedule_decision(&self, event: &PredictionEvent) -> JoinHandle<()> {
        let fire_at = self.pipeline.fire_at(event);
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(
            "Decision for event {} scheduled at {} (in {:?})",
            event.id, fire_at, delay
        );
        let due_tx = self.due_tx.clone();
        let event_id = event.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due_tx.send(event_id).await;
        })
    }

    fn on_bet_observed(
        &mut self,
        channel_id: &str,
        user_id: String,
        badge: String,
        observed_at: DateTime<Utc>,
    ) {
        let Some(event_id) = self.open_by_channel.get(channel_id) else {
            return;
        };
        let Some(tracked) = self.events.get_mut(event_id) else {
            return;
        };
        // Bet observations freeze at the lock transition.
        if tracked.event.status != PredictionStatus::Active {
            return;
        }
        if let Err(e) = self
            .store
            .record_user_bet(channel_id, &user_id, &badge, observed_at)
        {
            error!("Failed to record bet for user {}: {}", user_id, e);
        }
        tracked.bets.insert(user_id, (badge, observed_at));
    }

    /// Run the decision pipeline for an event, at most once. Any strategy
    /// failure aborts the bet for this event: logged, never retried.
    async fn run_decision(&mut self, event_id: &str, trigger: &str) {
        let Some(tracked) = self.events.get_mut(event_id) else {
            return;
        };
        if matches!(tracked.decision, DecisionState::Attempted) {
            debug!("Decision for event {} already attempted", event_id);
            return;
        }
        if matches!(tracked.decision, DecisionState::NotScheduled) {
            // Betting disabled for this channel.
            return;
        }
        tracked.abort_pending();
        // Marked before any side effect so a duplicate trigger (or a failed
        // placement) can never produce a second wager.
        tracked.decision = DecisionState::Attempted;

        let balance = {
            let balances = self.balances.read().await;
            balances
                .get(&tracked.event.channel_id)
                .copied()
                .unwrap_or(0)
                .max(0) as u64
        };

        match self
            .pipeline
            .decide(&tracked.event, balance, self.store.as_ref())
        {
            Ok(decision) => {
                info!(
                    "Betting {} on '{}' ({}) for prediction '{}' [{}]",
                    decision.amount, decision.badge, decision.outcome_id, tracked.event.title, trigger
                );
                if self.cfg.dry_run {
                    info!("DRY RUN – bet not placed");
                } else if let Err(e) = self
                    .api
                    .place_bet(&decision.event_id, &decision.outcome_id, decision.amount)
                    .await
                {
                    // Event stays Attempted: a failed placement is never retried.
                    error!("Bet placement failed for event {}: {}", event_id, e);
                }
            }
            Err(e) => {
                warn!(
                    "Skipping bet for prediction '{}': {}",
                    tracked.event.title, e
                );
            }
        }
    }

    /// Resolution: fold every tracked bet into the analytics store as one
    /// atomic unit, then discard the event.
    fn on_resolved(&mut self, event_id: &str) {
        let Some(mut tracked) = self.events.remove(event_id) else {
            return;
        };
        tracked.abort_pending();
        self.open_by_channel.remove(&tracked.event.channel_id);

        let Some(winning) = tracked.event.winning_outcome() else {
            warn!("Resolved event {} carries no winning outcome", event_id);
            return;
        };
        let winning_badge = winning.badge.clone();
        let ratio = tracked.event.payout_ratio().unwrap_or(1.0);
        let bets: Vec<(String, String)> = tracked
            .bets
            .into_iter()
            .map(|(user, (badge, _))| (user, badge))
            .collect();
        info!(
            "Prediction '{}' resolved to '{}' (ratio {:.2}, {} tracked bets)",
            tracked.event.title,
            winning_badge,
            ratio,
            bets.len()
        );
        match self.store.record_resolution(
            &tracked.event.channel_id,
            event_id,
            &winning_badge,
            ratio,
            &bets,
        ) {
            Ok(true) => {}
            Ok(false) => debug!("Resolution for event {} already recorded", event_id),
            // Staleness accepted over blocking future decisions.
            Err(e) => error!("Failed to record resolution for event {}: {}", event_id, e),
        }
    }

    /// Cancellation discards tracked state without any store stat mutation.
    fn on_canceled(&mut self, event_id: &str) {
        let Some(mut tracked) = self.events.remove(event_id) else {
            return;
        };
        tracked.abort_pending();
        self.open_by_channel.remove(&tracked.event.channel_id);
        info!("Prediction '{}' canceled", tracked.event.title);
        if let Err(e) =
            self.store
                .cancel_prediction(&tracked.event.channel_id, event_id, Utc::now())
        {
            error!("Failed to record cancellation for event {}: {}", event_id, e);
        }
    }

    /// Force-expire events that never reached a terminal state (e.g. the
    /// channel went offline mid-event). Bounds memory growth.
    fn expire_stale(&mut self) {
        let timeout = self.cfg.event_timeout;
        let stale: Vec<String> = self
            .events
            .iter()
            .filter(|(_, t)| t.tracked_at.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for event_id in stale {
            if let Some(mut tracked) = self.events.remove(&event_id) {
                tracked.abort_pending();
                self.open_by_channel.remove(&tracked.event.channel_id);
                warn!(
                    "Force-expired prediction '{}' after {:?} without a terminal state",
                    tracked.event.title, timeout
                );
            }
        }
    }
}
