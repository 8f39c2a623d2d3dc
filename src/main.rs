use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod api;
mod config;
mod db;
mod monitor;
mod prediction;
mod pubsub;

use api::{CommandApi, GqlClient};
use config::Config;
use db::Database;
use monitor::ChannelMonitor;
use prediction::{DecisionPipeline, PointsBalances, PredictionTracker, TrackerConfig};
use pubsub::{PoolConfig, PubSubPool, Topic, TopicKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    if config.dry_run {
        info!("🟡 DRY RUN mode – bets and claims are logged, not sent");
    } else {
        info!("🔴 LIVE mode – real bets WILL be placed");
    }

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Bets observed before the last shutdown belong to events we no longer
    // track; their resolutions were lost with the process.
    let purged = db.purge_unresolved_bets()?;
    if purged > 0 {
        info!("Purged {} stale observed bet(s) from previous run", purged);
    }
    for channel in &config.channels {
        db.create_channel(channel, channel)?;
    }

    // Build GQL command client
    let api: Arc<dyn CommandApi> = Arc::new(GqlClient::new(&config.gql_url, &config.auth_token)?);

    // Shared balances: written by the monitor, read by the bet sizing
    let balances: PointsBalances = Default::default();

    // Frame and event plumbing: connections → dispatcher → tracker/monitor
    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(256);
    let (tracker_tx, tracker_rx) = tokio::sync::mpsc::channel(64);
    let (monitor_tx, monitor_rx) = tokio::sync::mpsc::channel(64);

    let pool = PubSubPool::new(
        PoolConfig {
            ws_url: config.ws_url.clone(),
            auth_token: config.auth_token.clone(),
            topics_per_connection: config.topics_per_connection,
            max_connections: config.max_connections,
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            pong_timeout: Duration::from_secs(config.pong_timeout_secs),
        },
        frame_tx,
    );

    // Per-channel topics plus the two user-scoped topics. An exhausted pool
    // here is a configuration error and aborts startup.
    for channel in &config.channels {
        pool.subscribe(Topic::new(TopicKind::VideoPlayback, channel.clone()))
            .await?;
        pool.subscribe(Topic::new(TopicKind::PredictionsChannel, channel.clone()))
            .await?;
        pool.subscribe(Topic::new(TopicKind::ChannelChat, channel.clone()))
            .await?;
    }
    pool.subscribe(Topic::new(
        TopicKind::CommunityPointsUser,
        config.user_id.clone(),
    ))
    .await?;
    pool.subscribe(Topic::new(
        TopicKind::PredictionsUser,
        config.user_id.clone(),
    ))
    .await?;
    info!(
        "Subscribed {} topic(s) across {} connection(s)",
        pool.topic_count().await,
        pool.connection_count().await
    );

    tokio::spawn(pubsub::dispatcher::run(frame_rx, tracker_tx, monitor_tx));

    let channel_monitor = ChannelMonitor::new(
        db.clone(),
        Arc::clone(&api),
        Arc::clone(&balances),
        config.dry_run,
    );
    tokio::spawn(channel_monitor.run(monitor_rx));

    let pipeline = DecisionPipeline::from_config(&config)?;
    let tracker = PredictionTracker::new(
        TrackerConfig {
            dry_run: config.dry_run,
            event_timeout: Duration::from_secs(config.event_timeout_secs),
            bet_channels: config
                .effective_bet_channels()
                .into_iter()
                .collect::<HashSet<_>>(),
        },
        pipeline,
        Arc::new(db.clone()),
        Arc::clone(&api),
        balances,
    );
    tokio::spawn(tracker.run(tracker_rx));

    info!(
        "Watching {} channel(s), betting on {}",
        config.channels.len(),
        config.effective_bet_channels().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    pool.shutdown().await;

    Ok(())
}
