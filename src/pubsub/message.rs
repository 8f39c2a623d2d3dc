//! Wire types for the PubSub protocol.
//!
//! The socket carries JSON envelopes of shape `{type, data}`. `MESSAGE`
//! envelopes wrap a topic key plus an inner payload that is itself a JSON
//! *string*. Connections unwrap the envelope; the dispatcher decodes the
//! inner payload according to the topic kind.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::topic::Topic;

/// One `MESSAGE` frame unwrapped by a connection read loop, forwarded to the
/// dispatcher with its inner payload still encoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub topic: Topic,
    pub message: String,
}

// ── Outer envelope ───────────────────────────────────────────────────────────

/// Outer envelope for every frame the server pushes.
/// `type` is one of `MESSAGE`, `PONG`, `RESPONSE`, `RECONNECT`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub nonce: Option<String>,
    /// Non-empty on a failed `RESPONSE` (e.g. `ERR_BADAUTH`).
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<EnvelopeData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    pub topic: String,
    pub message: String,
}

/// Build a `LISTEN` control frame subscribing the given topics.
pub fn listen_frame(topics: &[Topic], auth_token: &str, nonce: &str) -> String {
    let keys: Vec<String> = topics.iter().map(Topic::to_string).collect();
    serde_json::json!({
        "type": "LISTEN",
        "nonce": nonce,
        "data": { "topics": keys, "auth_token": auth_token }
    })
    .to_string()
}

/// Build an `UNLISTEN` control frame.
pub fn unlisten_frame(topics: &[Topic], nonce: &str) -> String {
    let keys: Vec<String> = topics.iter().map(Topic::to_string).collect();
    serde_json::json!({
        "type": "UNLISTEN",
        "nonce": nonce,
        "data": { "topics": keys }
    })
    .to_string()
}

pub fn ping_frame() -> String {
    r#"{"type":"PING"}"#.to_string()
}

// ── Prediction events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PredictionsPayload {
    #[serde(rename = "event-created")]
    EventCreated { data: PredictionEventEnvelope },
    #[serde(rename = "event-updated")]
    EventUpdated { data: PredictionEventEnvelope },
}

impl PredictionsPayload {
    pub fn into_event(self) -> PredictionEvent {
        match self {
            PredictionsPayload::EventCreated { data } => data.event,
            PredictionsPayload::EventUpdated { data } => data.event,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionEventEnvelope {
    pub event: PredictionEvent,
}

/// A time-boxed wagering event with two or more mutually exclusive outcomes.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionEvent {
    pub id: String,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    /// Seconds from `created_at` until the event locks.
    pub prediction_window_seconds: i64,
    pub status: PredictionStatus,
    pub title: String,
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
    #[serde(default)]
    pub winning_outcome_id: Option<String>,
}

impl PredictionEvent {
    /// Deadline after which no further bets are accepted.
    pub fn lock_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.prediction_window_seconds)
    }

    pub fn winning_outcome(&self) -> Option<&Outcome> {
        let id = self.winning_outcome_id.as_deref()?;
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Gross return per point staked on the winning outcome:
    /// total points across all outcomes divided by points on the winner.
    /// `None` when there is no winner or the winning side holds zero points.
    pub fn payout_ratio(&self) -> Option<f64> {
        let winning = self.winning_outcome()?;
        if winning.total_points == 0 {
            return None;
        }
        let total: u64 = self.outcomes.iter().map(|o| o.total_points).sum();
        Some(total as f64 / winning.total_points as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PredictionStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "LOCKED")]
    Locked,
    #[serde(rename = "RESOLVED")]
    Resolved,
    #[serde(rename = "CANCELED")]
    Canceled,
    /// Forward-compatibility: statuses we do not know about.
    #[serde(other)]
    Unknown,
}

/// One outcome ("badge") within a prediction.
#[derive(Debug, Clone, Deserialize)]
pub struct Outcome {
    pub id: String,
    /// Badge identifier, e.g. `BLUE` / `PINK`.
    #[serde(rename = "color")]
    pub badge: String,
    pub title: String,
    #[serde(default)]
    pub total_points: u64,
    #[serde(default)]
    pub total_users: u64,
}

// ── Video playback ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum PlaybackPayload {
    #[serde(rename = "viewcount")]
    ViewCount { viewers: u64 },
    #[serde(rename = "stream-up")]
    StreamUp,
    #[serde(rename = "stream-down")]
    StreamDown,
}

// ── Community points ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CommunityPointsPayload {
    #[serde(rename = "points-earned")]
    PointsEarned { data: PointsEarnedData },
    #[serde(rename = "claim-available")]
    ClaimAvailable { data: ClaimAvailableData },
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointsEarnedData {
    pub channel_id: String,
    pub balance: PointsBalance,
    #[serde(default)]
    pub point_gain: Option<PointGain>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointsBalance {
    pub balance: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointGain {
    pub total_points: i64,
    #[serde(default)]
    pub reason_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimAvailableData {
    pub claim: PointsClaim,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointsClaim {
    pub id: String,
    pub channel_id: String,
}

// ── Chat with badge annotations ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ChatPayload {
    #[serde(rename = "chat-message")]
    ChatMessage { data: ChatMessageData },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageData {
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub badges: Vec<ChatBadge>,
}

impl ChatMessageData {
    /// The badge of the prediction outcome this user has bet on, if any.
    pub fn prediction_badge(&self) -> Option<&str> {
        self.badges
            .iter()
            .find(|b| b.set_id == "predictions")
            .map(|b| b.version.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatBadge {
    pub set_id: String,
    pub version: String,
}

// ── Own bets (predictions-user) ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum UserPredictionsPayload {
    #[serde(rename = "prediction-made")]
    PredictionMade { data: UserPredictionData },
    #[serde(rename = "prediction-result")]
    PredictionResult { data: UserPredictionData },
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPredictionData {
    pub prediction: UserPrediction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPrediction {
    pub event_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub points: Option<u64>,
    #[serde(default)]
    pub result: Option<UserPredictionResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPredictionResult {
    /// `WIN` or `LOSE`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub points_won: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message_envelope() {
        let frame = r#"{"type":"MESSAGE","data":{"topic":"video-playback-by-id.123","message":"{\"type\":\"viewcount\",\"viewers\":42}"}}"#;
        let env: Envelope = serde_json::from_str(frame).unwrap();
        assert_eq!(env.kind, "MESSAGE");
        let data = env.data.unwrap();
        assert_eq!(data.topic, "video-playback-by-id.123");
        let payload: PlaybackPayload = serde_json::from_str(&data.message).unwrap();
        assert_eq!(payload, PlaybackPayload::ViewCount { viewers: 42 });
    }

    #[test]
    fn test_decode_response_with_error() {
        let frame = r#"{"type":"RESPONSE","nonce":"abc","error":"ERR_BADAUTH"}"#;
        let env: Envelope = serde_json::from_str(frame).unwrap();
        assert_eq!(env.kind, "RESPONSE");
        assert_eq!(env.error.as_deref(), Some("ERR_BADAUTH"));
    }

    #[test]
    fn test_decode_prediction_event() {
        let msg = r#"{
            "type": "event-created",
            "data": {
                "timestamp": "2024-05-01T12:00:05Z",
                "event": {
                    "id": "ev1",
                    "channel_id": "123",
                    "created_at": "2024-05-01T12:00:00Z",
                    "prediction_window_seconds": 120,
                    "status": "ACTIVE",
                    "title": "Will they win?",
                    "outcomes": [
                        {"id": "o1", "color": "BLUE", "title": "Yes", "total_points": 600, "total_users": 3},
                        {"id": "o2", "color": "PINK", "title": "No", "total_points": 200, "total_users": 1}
                    ]
                }
            }
        }"#;
        let payload: PredictionsPayload = serde_json::from_str(msg).unwrap();
        let event = payload.into_event();
        assert_eq!(event.id, "ev1");
        assert_eq!(event.status, PredictionStatus::Active);
        assert_eq!(event.outcomes.len(), 2);
        assert_eq!(event.outcomes[0].badge, "BLUE");
        assert_eq!(
            event.lock_at(),
            event.created_at + Duration::seconds(120)
        );
    }

    #[test]
    fn test_payout_ratio() {
        let msg = r#"{
            "id": "ev1", "channel_id": "123",
            "created_at": "2024-05-01T12:00:00Z",
            "prediction_window_seconds": 120,
            "status": "RESOLVED", "title": "t",
            "winning_outcome_id": "o2",
            "outcomes": [
                {"id": "o1", "color": "BLUE", "title": "Yes", "total_points": 600, "total_users": 3},
                {"id": "o2", "color": "PINK", "title": "No", "total_points": 200, "total_users": 1}
            ]
        }"#;
        let event: PredictionEvent = serde_json::from_str(msg).unwrap();
        assert_eq!(event.payout_ratio(), Some(4.0));
    }

    #[test]
    fn test_unknown_status_decodes() {
        let msg = r#"{
            "id": "ev1", "channel_id": "123",
            "created_at": "2024-05-01T12:00:00Z",
            "prediction_window_seconds": 120,
            "status": "RESOLVE_PENDING", "title": "t"
        }"#;
        let event: PredictionEvent = serde_json::from_str(msg).unwrap();
        assert_eq!(event.status, PredictionStatus::Unknown);
    }

    #[test]
    fn test_chat_prediction_badge() {
        let msg = r#"{
            "type": "chat-message",
            "data": {
                "channel_id": "123",
                "user_id": "u9",
                "badges": [
                    {"set_id": "subscriber", "version": "12"},
                    {"set_id": "predictions", "version": "BLUE"}
                ]
            }
        }"#;
        let ChatPayload::ChatMessage { data } = serde_json::from_str(msg).unwrap();
        assert_eq!(data.prediction_badge(), Some("BLUE"));
    }

    #[test]
    fn test_listen_frame_shape() {
        let topics = vec![Topic::parse("predictions-channel-v1.123").unwrap()];
        let frame = listen_frame(&topics, "tok", "n1");
        let val: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(val["type"], "LISTEN");
        assert_eq!(val["nonce"], "n1");
        assert_eq!(val["data"]["topics"][0], "predictions-channel-v1.123");
        assert_eq!(val["data"]["auth_token"], "tok");
    }
}
