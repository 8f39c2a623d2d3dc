//! Multiplexed PubSub connection pool.
//!
//! The notification service limits how many topics a single socket may carry,
//! so the pool spreads subscriptions across capacity-bounded connections:
//!
//! ```text
//!  subscribe(topic) ──▶ first connection with spare capacity
//!                        │  (or a new one, up to max_connections)
//!                        ▼
//!               connection task: LISTEN / PING-PONG keep-alive /
//!               reconnect with exponential backoff
//!                        │  MESSAGE frames
//!                        ▼
//!                  dispatcher channel (RawFrame)
//! ```
//!
//! A connection that fails too many times in a row is declared dead and its
//! topics are migrated to the remaining connections through the normal
//! `subscribe` path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::message::{listen_frame, ping_frame, unlisten_frame, Envelope, RawFrame};
use super::topic::Topic;

/// Consecutive failed connect/session attempts before a connection is
/// declared dead and its topics are migrated.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Backoff cap between reconnect attempts.
const MAX_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub ws_url: String,
    pub auth_token: String,
    /// Maximum topics per connection (capacity C).
    pub topics_per_connection: usize,
    /// Maximum number of simultaneously open connections.
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Fatal configuration error: the topic set does not fit in
    /// `max_connections` connections. Surfaced, never swallowed.
    #[error("connection pool exhausted: {max_connections} connections of {capacity} topics are all full")]
    Exhausted {
        max_connections: usize,
        capacity: usize,
    },
}

enum ConnCommand {
    Listen(Topic),
    Unlisten(Topic),
    Shutdown,
}

/// Death notice a connection task queues before it exits. Sent before the
/// task drops its command receiver, so a closed command channel always means
/// one of these is already in flight. The supervisor migrates whatever
/// topics the pool bookkeeping still holds for the slot.
struct DeadConnection {
    id: u64,
}

struct ConnectionSlot {
    id: u64,
    topics: HashSet<Topic>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
}

struct PoolInner {
    slots: Vec<ConnectionSlot>,
    next_id: u64,
}

/// Thread-safe handle to the pool; cheap to clone.
#[derive(Clone)]
pub struct PubSubPool {
    cfg: Arc<PoolConfig>,
    inner: Arc<Mutex<PoolInner>>,
    frame_tx: mpsc::Sender<RawFrame>,
    dead_tx: mpsc::UnboundedSender<DeadConnection>,
}

impl PubSubPool {
    /// Create the pool and spawn its supervisor task. Decoded `MESSAGE`
    /// frames from every connection are pushed into `frame_tx`.
    pub fn new(cfg: PoolConfig, frame_tx: mpsc::Sender<RawFrame>) -> Self {
        let (dead_tx, mut dead_rx) = mpsc::unbounded_channel::<DeadConnection>();
        let pool = PubSubPool {
            cfg: Arc::new(cfg),
            inner: Arc::new(Mutex::new(PoolInner {
                slots: Vec::new(),
                next_id: 0,
            })),
            frame_tx,
            dead_tx,
        };

        // Supervisor: migrates topics off dead connections via subscribe().
        // The slot bookkeeping, not the dead task, is the source of truth,
        // so topics unsubscribed while the task was dying stay unsubscribed.
        let supervisor = pool.clone();
        tokio::spawn(async move {
            while let Some(dead) = dead_rx.recv().await {
                let topics = supervisor.remove_connection(dead.id).await;
                warn!(
                    "[pool] connection {} died, migrating {} topic(s)",
                    dead.id,
                    topics.len()
                );
                for topic in topics {
                    if let Err(e) = supervisor.subscribe(topic.clone()).await {
                        error!("[pool] failed to migrate topic {}: {}", topic, e);
                    }
                }
            }
        });

        pool
    }

    /// Subscribe a topic on the first connection with spare capacity, opening
    /// a new connection when every existing one is full. Subscribing an
    /// already-subscribed topic is a no-op.
    pub async fn subscribe(&self, topic: Topic) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;

        if inner.slots.iter().any(|s| s.topics.contains(&topic)) {
            debug!("[pool] already subscribed: {}", topic);
            return Ok(());
        }

        let capacity = self.cfg.topics_per_connection;
        // Place on the first live connection with spare capacity. The topic
        // only enters the slot bookkeeping once the LISTEN command is
        // accepted: a closed command channel means the task already died and
        // its death notice is queued, so the slot is skipped and left for
        // the supervisor to clean up.
        for slot in inner.slots.iter_mut() {
            if slot.topics.len() >= capacity {
                continue;
            }
            if slot
                .cmd_tx
                .send(ConnCommand::Listen(topic.clone()))
                .is_ok()
            {
                slot.topics.insert(topic);
                return Ok(());
            }
            warn!(
                "[pool] connection {} is gone, not placing {} on it",
                slot.id, topic
            );
        }

        if inner.slots.len() >= self.cfg.max_connections {
            return Err(PoolError::Exhausted {
                max_connections: self.cfg.max_connections,
                capacity,
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        info!("[pool] opening connection {} for {}", id, topic);
        tokio::spawn(connection_loop(
            id,
            Arc::clone(&self.cfg),
            vec![topic.clone()],
            cmd_rx,
            self.frame_tx.clone(),
            self.dead_tx.clone(),
        ));
        inner.slots.push(ConnectionSlot {
            id,
            topics: HashSet::from([topic]),
            cmd_tx,
        });
        Ok(())
    }

    /// Unsubscribe a topic wherever it currently lives. Unknown topics are
    /// ignored.
    pub async fn unsubscribe(&self, topic: &Topic) {
        let mut inner = self.inner.lock().await;
        for slot in inner.slots.iter_mut() {
            if slot.topics.remove(topic) {
                let _ = slot.cmd_tx.send(ConnCommand::Unlisten(topic.clone()));
                return;
            }
        }
    }

    /// Best-effort shutdown: every connection sends a close frame and exits.
    /// Does not block on the sockets actually closing.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        info!("[pool] shutting down {} connection(s)", inner.slots.len());
        for slot in inner.slots.drain(..) {
            let _ = slot.cmd_tx.send(ConnCommand::Shutdown);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn topic_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.slots.iter().map(|s| s.topics.len()).sum()
    }

    /// Drop a slot and hand back the topics the pool still wants on it.
    async fn remove_connection(&self, id: u64) -> Vec<Topic> {
        let mut inner = self.inner.lock().await;
        match inner.slots.iter().position(|s| s.id == id) {
            Some(idx) => inner.slots.remove(idx).topics.into_iter().collect(),
            None => Vec::new(),
        }
    }
}

/// What a decoded inbound frame asks of the connection loop.
enum FrameAction {
    None,
    Pong,
    Reconnect,
}

/// Persistent connection loop: connect, LISTEN the assigned topics, then pump
/// frames until the session drops. Reconnects with exponential backoff;
/// gives up (migrating its topics) after too many consecutive failures.
async fn connection_loop(
    id: u64,
    cfg: Arc<PoolConfig>,
    initial_topics: Vec<Topic>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    frame_tx: mpsc::Sender<RawFrame>,
    dead_tx: mpsc::UnboundedSender<DeadConnection>,
) {
    let mut topics: HashSet<Topic> = initial_topics.into_iter().collect();
    let mut backoff_secs = 1u64;
    let mut failures = 0u32;

    loop {
        // Apply commands queued while disconnected before dialing.
        loop {
            match cmd_rx.try_recv() {
                Ok(ConnCommand::Listen(t)) => {
                    topics.insert(t);
                }
                Ok(ConnCommand::Unlisten(t)) => {
                    topics.remove(&t);
                }
                Ok(ConnCommand::Shutdown) => return,
                Err(_) => break,
            }
        }

        info!("[conn {}] connecting to {}", id, cfg.ws_url);
        match tokio_tungstenite::connect_async(&cfg.ws_url).await {
            Ok((ws_stream, _response)) => {
                info!("[conn {}] connected ({} topics)", id, topics.len());
                backoff_secs = 1;
                failures = 0;

                let (mut write, mut read) = ws_stream.split();

                if !topics.is_empty() {
                    let assigned: Vec<Topic> = topics.iter().cloned().collect();
                    let frame = listen_frame(&assigned, &cfg.auth_token, &nonce());
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        error!("[conn {}] LISTEN send failed: {}", id, e);
                        failures += 1;
                        continue;
                    }
                }

                let mut ping_interval = tokio::time::interval(cfg.ping_interval);
                ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let pong_deadline = tokio::time::sleep(Duration::from_secs(0));
                tokio::pin!(pong_deadline);
                let mut awaiting_pong = false;

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    match classify_frame(id, &text, &frame_tx) {
                                        FrameAction::Pong => awaiting_pong = false,
                                        FrameAction::Reconnect => {
                                            warn!("[conn {}] server requested reconnect", id);
                                            break;
                                        }
                                        FrameAction::None => {}
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) => {
                                    warn!("[conn {}] server closed connection", id);
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("[conn {}] socket error: {}", id, e);
                                    break;
                                }
                                None => {
                                    warn!("[conn {}] stream ended", id);
                                    break;
                                }
                                _ => {}
                            }
                        }
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(ConnCommand::Listen(topic)) => {
                                    if topics.insert(topic.clone()) {
                                        let frame = listen_frame(&[topic], &cfg.auth_token, &nonce());
                                        if let Err(e) = write.send(Message::Text(frame)).await {
                                            error!("[conn {}] LISTEN send failed: {}", id, e);
                                            break;
                                        }
                                    }
                                }
                                Some(ConnCommand::Unlisten(topic)) => {
                                    if topics.remove(&topic) {
                                        let frame = unlisten_frame(&[topic], &nonce());
                                        if let Err(e) = write.send(Message::Text(frame)).await {
                                            error!("[conn {}] UNLISTEN send failed: {}", id, e);
                                            break;
                                        }
                                    }
                                }
                                Some(ConnCommand::Shutdown) | None => {
                                    let _ = write.send(Message::Close(None)).await;
                                    info!("[conn {}] closed", id);
                                    return;
                                }
                            }
                        }
                        _ = ping_interval.tick() => {
                            if let Err(e) = write.send(Message::Text(ping_frame())).await {
                                error!("[conn {}] PING failed: {}", id, e);
                                break;
                            }
                            awaiting_pong = true;
                            pong_deadline.as_mut().reset(
                                tokio::time::Instant::now() + cfg.pong_timeout,
                            );
                        }
                        _ = &mut pong_deadline, if awaiting_pong => {
                            warn!(
                                "[conn {}] no PONG within {:?}, forcing reconnect",
                                id, cfg.pong_timeout
                            );
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!("[conn {}] connection failed: {}", id, e);
            }
        }

        failures += 1;
        if failures >= MAX_CONSECUTIVE_FAILURES {
            error!(
                "[conn {}] giving up after {} consecutive failures",
                id, failures
            );
            let _ = dead_tx.send(DeadConnection { id });
            return;
        }

        warn!("[conn {}] reconnecting in {}s...", id, backoff_secs);
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

/// Decode one inbound text frame. `MESSAGE` frames are unwrapped and handed
/// to the dispatcher channel; control frames steer the connection loop.
/// Undecodable frames are dropped without affecting the connection.
fn classify_frame(id: u64, text: &str, frame_tx: &mpsc::Sender<RawFrame>) -> FrameAction {
    let Ok(env) = serde_json::from_str::<Envelope>(text) else {
        debug!("[conn {}] undecodable frame dropped", id);
        return FrameAction::None;
    };

    match env.kind.as_str() {
        "MESSAGE" => {
            let Some(data) = env.data else {
                debug!("[conn {}] MESSAGE without data dropped", id);
                return FrameAction::None;
            };
            match Topic::parse(&data.topic) {
                Some(topic) => {
                    let frame = RawFrame {
                        topic,
                        message: data.message,
                    };
                    // try_send so a slow dispatcher never stalls the read loop
                    if let Err(e) = frame_tx.try_send(frame) {
                        error!("[conn {}] dispatcher channel full, frame DROPPED: {}", id, e);
                    }
                }
                None => debug!("[conn {}] frame on unknown topic '{}' dropped", id, data.topic),
            }
            FrameAction::None
        }
        "PONG" => FrameAction::Pong,
        "RESPONSE" => {
            match env.error.as_deref() {
                Some("") | None => debug!("[conn {}] LISTEN acknowledged", id),
                Some(err) => warn!(
                    "[conn {}] control request failed (nonce {:?}): {}",
                    id, env.nonce, err
                ),
            }
            FrameAction::None
        }
        "RECONNECT" => FrameAction::Reconnect,
        other => {
            debug!("[conn {}] unhandled frame type '{}' dropped", id, other);
            FrameAction::None
        }
    }
}

fn nonce() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(30)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::topic::TopicKind;

    fn test_pool(capacity: usize, max_connections: usize) -> PubSubPool {
        let (frame_tx, _frame_rx) = mpsc::channel(64);
        // Unroutable endpoint: connection tasks fail fast and back off,
        // which is fine: these tests exercise placement bookkeeping only.
        PubSubPool::new(
            PoolConfig {
                ws_url: "ws://127.0.0.1:1".to_string(),
                auth_token: "test-token".to_string(),
                topics_per_connection: capacity,
                max_connections,
                ping_interval: Duration::from_secs(60),
                pong_timeout: Duration::from_secs(10),
            },
            frame_tx,
        )
    }

    fn channel_topic(n: usize) -> Topic {
        Topic::new(TopicKind::PredictionsChannel, n.to_string())
    }

    #[tokio::test]
    async fn test_opens_ceil_k_over_c_connections() {
        let pool = test_pool(3, 10);
        for n in 0..7 {
            pool.subscribe(channel_topic(n)).await.unwrap();
        }
        // 7 topics at capacity 3 → ⌈7/3⌉ = 3 connections
        assert_eq!(pool.connection_count().await, 3);
        assert_eq!(pool.topic_count().await, 7);
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let pool = test_pool(2, 10);
        for n in 0..6 {
            pool.subscribe(channel_topic(n)).await.unwrap();
        }
        let inner = pool.inner.lock().await;
        assert!(inner.slots.iter().all(|s| s.topics.len() <= 2));
    }

    #[tokio::test]
    async fn test_resubscribe_is_noop() {
        let pool = test_pool(3, 10);
        pool.subscribe(channel_topic(1)).await.unwrap();
        pool.subscribe(channel_topic(2)).await.unwrap();
        let before = (pool.connection_count().await, pool.topic_count().await);

        pool.subscribe(channel_topic(1)).await.unwrap();
        pool.subscribe(channel_topic(2)).await.unwrap();
        assert_eq!(
            (pool.connection_count().await, pool.topic_count().await),
            before
        );
    }

    #[tokio::test]
    async fn test_exhaustion_is_surfaced() {
        let pool = test_pool(1, 2);
        pool.subscribe(channel_topic(1)).await.unwrap();
        pool.subscribe(channel_topic(2)).await.unwrap();
        let err = pool.subscribe(channel_topic(3)).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::Exhausted {
                max_connections: 2,
                capacity: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_frees_capacity() {
        let pool = test_pool(1, 1);
        pool.subscribe(channel_topic(1)).await.unwrap();
        pool.unsubscribe(&channel_topic(1)).await;
        assert_eq!(pool.topic_count().await, 0);
        // Freed slot can be reused without opening another connection.
        pool.subscribe(channel_topic(2)).await.unwrap();
        assert_eq!(pool.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_all_connections() {
        let pool = test_pool(2, 5);
        for n in 0..4 {
            pool.subscribe(channel_topic(n)).await.unwrap();
        }
        pool.shutdown().await;
        assert_eq!(pool.connection_count().await, 0);
    }

    /// A slot whose task has already exited but which the supervisor has not
    /// removed yet. Its command channel is closed, exactly as after the
    /// task's death notice.
    async fn plant_dead_slot(pool: &PubSubPool, id: u64, topics: &[Topic]) {
        let mut inner = pool.inner.lock().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        drop(cmd_rx);
        inner.slots.push(ConnectionSlot {
            id,
            topics: topics.iter().cloned().collect(),
            cmd_tx,
        });
        inner.next_id = inner.next_id.max(id + 1);
    }

    #[tokio::test]
    async fn test_subscribe_never_places_on_a_dead_connection() {
        let pool = test_pool(10, 10);
        plant_dead_slot(&pool, 99, &[channel_topic(1)]).await;

        // Placement must not land in the dead slot's bookkeeping, where the
        // migration path would never see it.
        pool.subscribe(channel_topic(2)).await.unwrap();

        let inner = pool.inner.lock().await;
        let dead = inner.slots.iter().find(|s| s.id == 99).unwrap();
        assert!(!dead.topics.contains(&channel_topic(2)));
        let live = inner
            .slots
            .iter()
            .find(|s| s.id != 99)
            .expect("a live connection was opened");
        assert!(live.topics.contains(&channel_topic(2)));
    }

    #[tokio::test]
    async fn test_migration_follows_pool_bookkeeping() {
        let pool = test_pool(10, 10);
        plant_dead_slot(&pool, 99, &[channel_topic(1), channel_topic(2)]).await;

        // Unsubscribed while the task was dying: must stay unsubscribed.
        pool.unsubscribe(&channel_topic(1)).await;

        pool.dead_tx.send(DeadConnection { id: 99 }).unwrap();
        for _ in 0..100 {
            if !pool.inner.lock().await.slots.iter().any(|s| s.id == 99) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let inner = pool.inner.lock().await;
        assert!(!inner.slots.iter().any(|s| s.id == 99));
        let topics: Vec<Topic> = inner
            .slots
            .iter()
            .flat_map(|s| s.topics.iter().cloned())
            .collect();
        assert_eq!(topics, vec![channel_topic(2)]);
    }
}
