use std::fmt;
use std::str::FromStr;

/// Kinds of push-notification streams the PubSub service exposes.
///
/// Only the kinds the bot actually consumes are enumerated; frames on any
/// other kind never get subscribed in the first place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Viewer counts and stream-up / stream-down for a channel.
    VideoPlayback,
    /// Prediction event lifecycle for a channel.
    PredictionsChannel,
    /// The logged-in user's own bet confirmations and results.
    PredictionsUser,
    /// Points balance changes and bonus claims for the logged-in user.
    CommunityPointsUser,
    /// Chat messages with badge annotations (other users' bet observations).
    ChannelChat,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::VideoPlayback => "video-playback-by-id",
            TopicKind::PredictionsChannel => "predictions-channel-v1",
            TopicKind::PredictionsUser => "predictions-user-v1",
            TopicKind::CommunityPointsUser => "community-points-user-v1",
            TopicKind::ChannelChat => "channel-chat-v1",
        }
    }
}

impl FromStr for TopicKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video-playback-by-id" => Ok(TopicKind::VideoPlayback),
            "predictions-channel-v1" => Ok(TopicKind::PredictionsChannel),
            "predictions-user-v1" => Ok(TopicKind::PredictionsUser),
            "community-points-user-v1" => Ok(TopicKind::CommunityPointsUser),
            "channel-chat-v1" => Ok(TopicKind::ChannelChat),
            _ => Err(()),
        }
    }
}

/// Identity of one push stream: a kind scoped to an owning entity (channel
/// or user ID). Wire format is `"<kind>.<ownerId>"`.
///
/// Value equality is identity: a topic belongs to at most one pool
/// connection at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub owner_id: String,
}

impl Topic {
    pub fn new(kind: TopicKind, owner_id: impl Into<String>) -> Self {
        Topic {
            kind,
            owner_id: owner_id.into(),
        }
    }

    /// Parse a wire key like `"predictions-channel-v1.12345"`.
    /// Returns `None` for unknown kinds or malformed keys.
    pub fn parse(key: &str) -> Option<Topic> {
        let (kind, owner_id) = key.split_once('.')?;
        if owner_id.is_empty() {
            return None;
        }
        let kind = kind.parse().ok()?;
        Some(Topic::new(kind, owner_id))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_key_roundtrip() {
        let topic = Topic::new(TopicKind::PredictionsChannel, "12345");
        assert_eq!(topic.to_string(), "predictions-channel-v1.12345");
        assert_eq!(Topic::parse("predictions-channel-v1.12345"), Some(topic));
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert_eq!(Topic::parse("predictions-channel-v1"), None);
        assert_eq!(Topic::parse("predictions-channel-v1."), None);
        assert_eq!(Topic::parse("no-such-kind.123"), None);
        assert_eq!(Topic::parse(""), None);
    }

    #[test]
    fn test_value_equality() {
        let a = Topic::new(TopicKind::VideoPlayback, "42");
        let b = Topic::parse("video-playback-by-id.42").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Topic::new(TopicKind::VideoPlayback, "43"));
        assert_ne!(a, Topic::new(TopicKind::ChannelChat, "42"));
    }
}
