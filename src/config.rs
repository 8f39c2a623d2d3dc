use clap::Parser;

/// Channel-points mining bot
#[derive(Parser, Debug, Clone)]
#[command(name = "channelpoints-bot", version, about)]
pub struct Config {
    /// OAuth token used for the PubSub session and GQL commands
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: String,

    /// Our own user id (for the user-scoped topics)
    #[arg(long, env = "USER_ID")]
    pub user_id: String,

    /// Channel ids to watch, comma separated
    #[arg(long, env = "CHANNELS", value_delimiter = ',')]
    pub channels: Vec<String>,

    /// Channel ids with prediction betting enabled (subset of --channels);
    /// empty means betting is enabled everywhere
    #[arg(long, env = "BET_CHANNELS", value_delimiter = ',')]
    pub bet_channels: Vec<String>,

    /// Run without placing bets or claiming bonuses
    #[arg(long, env = "DRY_RUN", default_value = "false")]
    pub dry_run: bool,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "channelpoints.db")]
    pub database_path: String,

    /// PubSub WebSocket URL
    #[arg(long, env = "PUBSUB_WS_URL", default_value = "wss://pubsub-edge.twitch.tv/v1")]
    pub ws_url: String,

    /// GQL command endpoint
    #[arg(long, env = "GQL_URL", default_value = "https://gql.twitch.tv/gql")]
    pub gql_url: String,

    /// Topic capacity of a single PubSub connection
    #[arg(long, env = "TOPICS_PER_CONNECTION", default_value = "50")]
    pub topics_per_connection: usize,

    /// Hard cap on concurrent PubSub connections
    #[arg(long, env = "MAX_CONNECTIONS", default_value = "10")]
    pub max_connections: usize,

    /// Keep-alive ping interval in seconds
    #[arg(long, env = "PING_INTERVAL_SECS", default_value = "180")]
    pub ping_interval_secs: u64,

    /// How long to wait for a PONG before the connection is considered dead
    #[arg(long, env = "PONG_TIMEOUT_SECS", default_value = "10")]
    pub pong_timeout_secs: u64,

    /// Outcome strategy: "highest-sqn" or "most-backers"
    #[arg(long, env = "OUTCOME_PICKER", default_value = "highest-sqn")]
    pub outcome_picker: String,

    /// Minimum resolved bets a bettor needs before their stats count
    #[arg(long, env = "MIN_TOTAL_BETS", default_value = "5")]
    pub min_total_bets: u32,

    /// Minimum System Quality Number a bettor needs to be trusted
    #[arg(long, env = "MIN_SQN", default_value = "2.0")]
    pub min_sqn: f64,

    /// Amount strategy: "percentage" or "constant"
    #[arg(long, env = "AMOUNT_PICKER", default_value = "percentage")]
    pub amount_picker: String,

    /// Fraction of the balance to wager (percentage strategy, 0.0–1.0)
    #[arg(long, env = "BET_PERCENTAGE", default_value = "0.05")]
    pub bet_percentage: f64,

    /// Wager cap in points (also the fixed amount for the constant strategy)
    #[arg(long, env = "MAX_BET", default_value = "5000")]
    pub max_bet: u64,

    /// Delay strategy: "from-start" or "from-end"
    #[arg(long, env = "DELAY_CALCULATOR", default_value = "from-end")]
    pub delay_calculator: String,

    /// Seconds offset for the delay strategy
    #[arg(long, env = "DELAY_SECONDS", default_value = "10")]
    pub delay_seconds: i64,

    /// Force-expire a tracked prediction after this many seconds without a
    /// terminal state
    #[arg(long, env = "EVENT_TIMEOUT_SECS", default_value = "7200")]
    pub event_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            anyhow::bail!("At least one channel id is required (--channels)");
        }
        let ws = url::Url::parse(&self.ws_url)
            .map_err(|e| anyhow::anyhow!("invalid ws_url: {}", e))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            anyhow::bail!("ws_url must use the ws:// or wss:// scheme");
        }
        url::Url::parse(&self.gql_url)
            .map_err(|e| anyhow::anyhow!("invalid gql_url: {}", e))?;
        for ch in &self.bet_channels {
            if !self.channels.contains(ch) {
                anyhow::bail!("bet channel {} is not in --channels", ch);
            }
        }
        if self.topics_per_connection == 0 {
            anyhow::bail!("topics_per_connection must be positive");
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be positive");
        }
        if !(0.0..=1.0).contains(&self.bet_percentage) {
            anyhow::bail!("bet_percentage must be between 0.0 and 1.0");
        }
        if self.max_bet == 0 {
            anyhow::bail!("max_bet must be positive");
        }
        if self.delay_seconds < 0 {
            anyhow::bail!("delay_seconds must not be negative");
        }
        Ok(())
    }

    /// The channels where the tracker is allowed to wager. An empty
    /// --bet-channels list means every watched channel.
    pub fn effective_bet_channels(&self) -> Vec<String> {
        if self.bet_channels.is_empty() {
            self.channels.clone()
        } else {
            self.bet_channels.clone()
        }
    }
}
