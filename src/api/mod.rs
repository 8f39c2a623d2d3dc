//! Outbound command API: the GQL endpoint used to place bets and claim
//! point bonuses. Read traffic arrives over PubSub; this client only issues
//! commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::Client;
use tracing::{debug, info};

const MAKE_PREDICTION_HASH: &str =
    "b44682ecc88358817009f20e69d75081b1e58825bb40aa53d5dbadcc17c881d8";
const CLAIM_POINTS_HASH: &str =
    "46aaeebe02c99afdf4fc97c7c0cba964124bf6b0af229395f1f6d1feed05b3d0";

/// Command surface the tracker and monitor act through. Object-safe so tests
/// swap in recording fakes.
#[async_trait]
pub trait CommandApi: Send + Sync {
    /// Wager `points` on one outcome of a prediction event.
    async fn place_bet(&self, event_id: &str, outcome_id: &str, points: u64) -> Result<()>;

    /// Claim a pending channel-points bonus.
    async fn claim_bonus(&self, channel_id: &str, claim_id: &str) -> Result<()>;
}

/// GQL client speaking persisted queries against the platform endpoint.
#[derive(Clone)]
pub struct GqlClient {
    http: Client,
    gql_url: String,
    auth_token: String,
}

impl GqlClient {
    pub fn new(gql_url: &str, auth_token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(GqlClient {
            http,
            gql_url: gql_url.to_string(),
            auth_token: auth_token.to_string(),
        })
    }

    async fn persisted_query(
        &self,
        operation: &str,
        hash: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "operationName": operation,
            "variables": { "input": input },
            "extensions": {
                "persistedQuery": { "version": 1, "sha256Hash": hash }
            }
        });

        let resp = self
            .http
            .post(&self.gql_url)
            .header("Authorization", format!("OAuth {}", self.auth_token))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("GQL request {} failed", operation))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GQL {} error {}: {}", operation, status, body);
        }

        let raw: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", operation))?;
        debug!("GQL {} response: {}", operation, raw);
        Ok(raw)
    }
}

/// Random transaction id attached to each mutation so the server can
/// deduplicate retried commands.
fn transaction_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[async_trait]
impl CommandApi for GqlClient {
    async fn place_bet(&self, event_id: &str, outcome_id: &str, points: u64) -> Result<()> {
        info!(
            "Placing bet: event={}, outcome={}, points={}",
            event_id, outcome_id, points
        );
        let raw = self
            .persisted_query(
                "MakePrediction",
                MAKE_PREDICTION_HASH,
                serde_json::json!({
                    "eventID": event_id,
                    "outcomeID": outcome_id,
                    "points": points,
                    "transactionID": transaction_id(),
                }),
            )
            .await?;

        let error = &raw["data"]["makePrediction"]["error"];
        if !error.is_null() {
            anyhow::bail!(
                "Bet rejected: {}",
                error["code"].as_str().unwrap_or("unknown")
            );
        }
        Ok(())
    }

    async fn claim_bonus(&self, channel_id: &str, claim_id: &str) -> Result<()> {
        info!("Claiming bonus {} on channel {}", claim_id, channel_id);
        let raw = self
            .persisted_query(
                "ClaimCommunityPoints",
                CLAIM_POINTS_HASH,
                serde_json::json!({
                    "channelID": channel_id,
                    "claimID": claim_id,
                }),
            )
            .await?;

        let error = &raw["data"]["claimCommunityPoints"]["error"];
        if !error.is_null() {
            anyhow::bail!(
                "Claim rejected: {}",
                error["code"].as_str().unwrap_or("unknown")
            );
        }
        Ok(())
    }
}
