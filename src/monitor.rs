//! Channel monitor: consumes the non-prediction side of the dispatcher
//! stream. Keeps the in-memory points balances current, logs stream
//! transitions to the database and claims point bonuses as they appear.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::api::CommandApi;
use crate::db::Database;
use crate::prediction::PointsBalances;
use crate::pubsub::TopicEvent;

pub struct ChannelMonitor {
    db: Database,
    api: Arc<dyn CommandApi>,
    balances: PointsBalances,
    dry_run: bool,
}

impl ChannelMonitor {
    pub fn new(
        db: Database,
        api: Arc<dyn CommandApi>,
        balances: PointsBalances,
        dry_run: bool,
    ) -> Self {
        ChannelMonitor {
            db,
            api,
            balances,
            dry_run,
        }
    }

    pub async fn run(self, mut events_rx: mpsc::Receiver<TopicEvent>) {
        info!("Channel monitor started");
        while let Some(event) = events_rx.recv().await {
            self.handle(event).await;
        }
        info!("Channel monitor stopped");
    }

    async fn handle(&self, event: TopicEvent) {
        match event {
            TopicEvent::StreamUp { channel_id } => {
                info!("Channel {} went live", channel_id);
                if let Err(e) = self.db.update_channel_status(&channel_id, Utc::now()) {
                    error!("Failed to record stream-up for {}: {}", channel_id, e);
                }
            }
            TopicEvent::StreamDown { channel_id } => {
                info!("Channel {} went offline", channel_id);
                if let Err(e) = self.db.update_channel_status(&channel_id, Utc::now()) {
                    error!("Failed to record stream-down for {}: {}", channel_id, e);
                }
            }
            TopicEvent::ViewCount {
                channel_id,
                viewers,
            } => {
                debug!("Channel {} viewers: {}", channel_id, viewers);
            }
            TopicEvent::PointsEarned {
                channel_id,
                balance,
                gained,
            } => {
                debug!(
                    "Channel {} balance {} (+{} points)",
                    channel_id, balance, gained
                );
                self.balances
                    .write()
                    .await
                    .insert(channel_id.clone(), balance);
                if let Err(e) = self.db.record_balance(&channel_id, balance, None) {
                    error!("Failed to log balance for {}: {}", channel_id, e);
                }
            }
            TopicEvent::ClaimAvailable {
                channel_id,
                claim_id,
            } => {
                if self.dry_run {
                    info!("DRY RUN – not claiming bonus on channel {}", channel_id);
                } else if let Err(e) = self.api.claim_bonus(&channel_id, &claim_id).await {
                    error!("Bonus claim failed on channel {}: {}", channel_id, e);
                }
            }
            TopicEvent::OwnBetPlaced {
                channel_id,
                event_id,
                points,
            } => {
                info!(
                    "Bet confirmed on channel {}: {} points on event {}",
                    channel_id, points, event_id
                );
            }
            TopicEvent::OwnBetResult {
                channel_id,
                event_id,
                result,
                points_won,
            } => {
                info!(
                    "Bet result on channel {} event {}: {} ({:+} points)",
                    channel_id, event_id, result, points_won
                );
            }
            other => debug!("Monitor ignoring event: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct FakeApi {
        claims: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CommandApi for FakeApi {
        async fn place_bet(&self, _: &str, _: &str, _: u64) -> Result<()> {
            Ok(())
        }
        async fn claim_bonus(&self, channel_id: &str, claim_id: &str) -> Result<()> {
            self.claims
                .lock()
                .unwrap()
                .push((channel_id.to_string(), claim_id.to_string()));
            Ok(())
        }
    }

    fn monitor(dry_run: bool) -> (ChannelMonitor, Arc<FakeApi>, PointsBalances) {
        let db = Database::open(":memory:").unwrap();
        db.create_channel("chan", "streamer").unwrap();
        let api = Arc::new(FakeApi::default());
        let balances: PointsBalances = Arc::new(RwLock::new(HashMap::new()));
        let m = ChannelMonitor::new(
            db,
            Arc::clone(&api) as Arc<dyn CommandApi>,
            Arc::clone(&balances),
            dry_run,
        );
        (m, api, balances)
    }

    #[tokio::test]
    async fn test_points_earned_updates_shared_balance() {
        let (m, _api, balances) = monitor(false);
        m.handle(TopicEvent::PointsEarned {
            channel_id: "chan".to_string(),
            balance: 1234,
            gained: 50,
        })
        .await;
        assert_eq!(balances.read().await.get("chan"), Some(&1234));
    }

    #[tokio::test]
    async fn test_claim_available_triggers_claim() {
        let (m, api, _) = monitor(false);
        m.handle(TopicEvent::ClaimAvailable {
            channel_id: "chan".to_string(),
            claim_id: "c1".to_string(),
        })
        .await;
        assert_eq!(
            api.claims.lock().unwrap().as_slice(),
            &[("chan".to_string(), "c1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dry_run_skips_claim() {
        let (m, api, _) = monitor(true);
        m.handle(TopicEvent::ClaimAvailable {
            channel_id: "chan".to_string(),
            claim_id: "c1".to_string(),
        })
        .await;
        assert!(api.claims.lock().unwrap().is_empty());
    }
}
