//! Decodes raw PubSub frames into typed domain events and routes them by
//! topic kind.
//!
//! Runs as its own task between the connection read loops and the handler
//! tasks, so a slow handler never stalls frame ingestion: connections feed
//! this task through a bounded channel, and routed events flow onward through
//! per-handler bounded channels. Frames for one topic always arrive from a
//! single connection, so per-topic ordering is preserved end to end.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::message::{
    ChatPayload, CommunityPointsPayload, PlaybackPayload, PredictionEvent, PredictionsPayload,
    RawFrame, UserPredictionsPayload,
};
use super::topic::TopicKind;

/// A decoded, routable domain event.
#[derive(Debug, Clone)]
pub enum TopicEvent {
    PredictionCreated {
        event: PredictionEvent,
    },
    PredictionUpdated {
        event: PredictionEvent,
    },
    /// Another user's bet, observed through their chat badge.
    BetObserved {
        channel_id: String,
        user_id: String,
        badge: String,
        observed_at: DateTime<Utc>,
    },
    ViewCount {
        channel_id: String,
        viewers: u64,
    },
    StreamUp {
        channel_id: String,
    },
    StreamDown {
        channel_id: String,
    },
    PointsEarned {
        channel_id: String,
        balance: i64,
        gained: i64,
    },
    ClaimAvailable {
        channel_id: String,
        claim_id: String,
    },
    OwnBetPlaced {
        channel_id: String,
        event_id: String,
        points: u64,
    },
    OwnBetResult {
        channel_id: String,
        event_id: String,
        result: String,
        points_won: i64,
    },
}

impl TopicEvent {
    /// Prediction-lifecycle events go to the tracker; everything else to the
    /// channel monitor.
    fn is_prediction(&self) -> bool {
        matches!(
            self,
            TopicEvent::PredictionCreated { .. }
                | TopicEvent::PredictionUpdated { .. }
                | TopicEvent::BetObserved { .. }
        )
    }
}

/// Dispatcher task: decode each frame and forward it to its handler channel.
/// Malformed or unknown payloads are dropped; the stream keeps flowing.
pub async fn run(
    mut frame_rx: mpsc::Receiver<RawFrame>,
    tracker_tx: mpsc::Sender<TopicEvent>,
    monitor_tx: mpsc::Sender<TopicEvent>,
) {
    info!("Dispatcher started");
    while let Some(frame) = frame_rx.recv().await {
        let event = match decode_frame(&frame) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                debug!("Dropping undecodable payload on {}: {}", frame.topic, e);
                continue;
            }
        };
        let tx = if event.is_prediction() {
            &tracker_tx
        } else {
            &monitor_tx
        };
        if tx.send(event).await.is_err() {
            // Handler gone, we are shutting down.
            break;
        }
    }
    info!("Dispatcher stopped");
}

/// Decode one frame's inner payload according to its topic kind.
/// `Ok(None)` means a well-formed payload we deliberately ignore.
pub fn decode_frame(frame: &RawFrame) -> Result<Option<TopicEvent>, serde_json::Error> {
    let owner = frame.topic.owner_id.clone();
    let event = match frame.topic.kind {
        TopicKind::PredictionsChannel => {
            match serde_json::from_str::<PredictionsPayload>(&frame.message)? {
                PredictionsPayload::EventCreated { data } => {
                    TopicEvent::PredictionCreated { event: data.event }
                }
                PredictionsPayload::EventUpdated { data } => {
                    TopicEvent::PredictionUpdated { event: data.event }
                }
            }
        }
        TopicKind::ChannelChat => {
            let ChatPayload::ChatMessage { data } =
                serde_json::from_str::<ChatPayload>(&frame.message)?;
            match data.prediction_badge() {
                Some(badge) => TopicEvent::BetObserved {
                    badge: badge.to_string(),
                    channel_id: data.channel_id,
                    user_id: data.user_id,
                    observed_at: Utc::now(),
                },
                // Chatter without a prediction badge, nothing to record.
                None => return Ok(None),
            }
        }
        TopicKind::VideoPlayback => {
            match serde_json::from_str::<PlaybackPayload>(&frame.message)? {
                PlaybackPayload::ViewCount { viewers } => TopicEvent::ViewCount {
                    channel_id: owner,
                    viewers,
                },
                PlaybackPayload::StreamUp => TopicEvent::StreamUp { channel_id: owner },
                PlaybackPayload::StreamDown => TopicEvent::StreamDown { channel_id: owner },
            }
        }
        TopicKind::CommunityPointsUser => {
            match serde_json::from_str::<CommunityPointsPayload>(&frame.message)? {
                CommunityPointsPayload::PointsEarned { data } => TopicEvent::PointsEarned {
                    channel_id: data.channel_id,
                    balance: data.balance.balance,
                    gained: data.point_gain.map(|g| g.total_points).unwrap_or(0),
                },
                CommunityPointsPayload::ClaimAvailable { data } => TopicEvent::ClaimAvailable {
                    channel_id: data.claim.channel_id,
                    claim_id: data.claim.id,
                },
            }
        }
        TopicKind::PredictionsUser => {
            match serde_json::from_str::<UserPredictionsPayload>(&frame.message)? {
                UserPredictionsPayload::PredictionMade { data } => TopicEvent::OwnBetPlaced {
                    channel_id: data.prediction.channel_id,
                    event_id: data.prediction.event_id,
                    points: data.prediction.points.unwrap_or(0),
                },
                UserPredictionsPayload::PredictionResult { data } => {
                    let result = data.prediction.result;
                    TopicEvent::OwnBetResult {
                        channel_id: data.prediction.channel_id,
                        event_id: data.prediction.event_id,
                        result: result
                            .as_ref()
                            .map(|r| r.kind.clone())
                            .unwrap_or_else(|| "UNKNOWN".to_string()),
                        points_won: result.and_then(|r| r.points_won).unwrap_or(0),
                    }
                }
            }
        }
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::topic::Topic;

    fn frame(topic: &str, message: &str) -> RawFrame {
        RawFrame {
            topic: Topic::parse(topic).unwrap(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_routes_predictions_to_tracker_and_rest_to_monitor() {
        let (frame_tx, frame_rx) = mpsc::channel(16);
        let (tracker_tx, mut tracker_rx) = mpsc::channel(16);
        let (monitor_tx, mut monitor_rx) = mpsc::channel(16);
        tokio::spawn(run(frame_rx, tracker_tx, monitor_tx));

        frame_tx
            .send(frame(
                "channel-chat-v1.123",
                r#"{"type":"chat-message","data":{"channel_id":"123","user_id":"u1","badges":[{"set_id":"predictions","version":"BLUE"}]}}"#,
            ))
            .await
            .unwrap();
        frame_tx
            .send(frame(
                "video-playback-by-id.123",
                r#"{"type":"viewcount","viewers":7}"#,
            ))
            .await
            .unwrap();

        match tracker_rx.recv().await.unwrap() {
            TopicEvent::BetObserved { user_id, badge, .. } => {
                assert_eq!(user_id, "u1");
                assert_eq!(badge, "BLUE");
            }
            other => panic!("unexpected tracker event: {:?}", other),
        }
        match monitor_rx.recv().await.unwrap() {
            TopicEvent::ViewCount {
                channel_id,
                viewers,
            } => {
                assert_eq!(channel_id, "123");
                assert_eq!(viewers, 7);
            }
            other => panic!("unexpected monitor event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_payload_kind_is_an_error() {
        let f = frame("video-playback-by-id.123", r#"{"type":"commercial"}"#);
        assert!(decode_frame(&f).is_err());
    }

    #[test]
    fn test_chat_without_prediction_badge_is_ignored() {
        let f = frame(
            "channel-chat-v1.123",
            r#"{"type":"chat-message","data":{"channel_id":"123","user_id":"u1","badges":[]}}"#,
        );
        assert!(decode_frame(&f).unwrap().is_none());
    }

    #[test]
    fn test_stream_down_decodes_with_channel_from_topic() {
        let f = frame(
            "video-playback-by-id.555",
            r#"{"type":"stream-down","server_time":1714564800}"#,
        );
        match decode_frame(&f).unwrap().unwrap() {
            TopicEvent::StreamDown { channel_id } => assert_eq!(channel_id, "555"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
