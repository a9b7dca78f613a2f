use std::fmt;

use serde::{Deserialize, Serialize};

/// The fixed set of PubSub topic kinds the miner subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicKind {
    VideoPlayback,
    CommunityPointsUser,
    PredictionsChannel,
    PredictionsUser,
    Raid,
    CommunityMoments,
    CommunityPointsChannel,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::VideoPlayback => "video-playback-by-id",
            TopicKind::CommunityPointsUser => "community-points-user-v1",
            TopicKind::PredictionsChannel => "predictions-channel-v1",
            TopicKind::PredictionsUser => "predictions-user-v1",
            TopicKind::Raid => "raid",
            TopicKind::CommunityMoments => "community-moments-channel-v1",
            TopicKind::CommunityPointsChannel => "community-points-channel-v1",
        }
    }

    pub fn parse(s: &str) -> Option<TopicKind> {
        match s {
            "video-playback-by-id" => Some(TopicKind::VideoPlayback),
            "community-points-user-v1" => Some(TopicKind::CommunityPointsUser),
            "predictions-channel-v1" => Some(TopicKind::PredictionsChannel),
            "predictions-user-v1" => Some(TopicKind::PredictionsUser),
            "raid" => Some(TopicKind::Raid),
            "community-moments-channel-v1" => Some(TopicKind::CommunityMoments),
            "community-points-channel-v1" => Some(TopicKind::CommunityPointsChannel),
            _ => None,
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a topic is scoped to: the authenticated user or a streamer's channel.
///
/// Channel topics carry the streamer login only as a back-reference for
/// logging; topic identity is the canonical `"<kind>.<id>"` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopicTarget {
    User { user_id: String },
    Channel { channel_id: String, login: String },
}

/// A PubSub subscription topic, identified by its canonical string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubTopic {
    pub kind: TopicKind,
    pub target: TopicTarget,
}

impl PubSubTopic {
    pub fn user(kind: TopicKind, user_id: impl Into<String>) -> PubSubTopic {
        PubSubTopic {
            kind,
            target: TopicTarget::User {
                user_id: user_id.into(),
            },
        }
    }

    pub fn channel(
        kind: TopicKind,
        channel_id: impl Into<String>,
        login: impl Into<String>,
    ) -> PubSubTopic {
        PubSubTopic {
            kind,
            target: TopicTarget::Channel {
                channel_id: channel_id.into(),
                login: login.into(),
            },
        }
    }

    pub fn is_user_topic(&self) -> bool {
        matches!(self.target, TopicTarget::User { .. })
    }

    /// The id half of the canonical string.
    pub fn id(&self) -> &str {
        match &self.target {
            TopicTarget::User { user_id } => user_id,
            TopicTarget::Channel { channel_id, .. } => channel_id,
        }
    }

    /// The streamer login for channel topics, `None` for user topics.
    pub fn login(&self) -> Option<&str> {
        match &self.target {
            TopicTarget::User { .. } => None,
            TopicTarget::Channel { login, .. } => Some(login),
        }
    }

    /// A topic with an empty channel id must not be subscribed.
    pub fn is_valid(&self) -> bool {
        !self.id().is_empty()
    }

    /// Parses a canonical `"<kind>.<id>"` string. The scope is not recoverable
    /// from the wire format, so user-kind topics come back user-scoped and
    /// everything else channel-scoped with an empty login.
    pub fn parse(s: &str) -> Option<PubSubTopic> {
        let (kind, id) = s.rsplit_once('.')?;
        let kind = TopicKind::parse(kind)?;
        match kind {
            TopicKind::CommunityPointsUser | TopicKind::PredictionsUser => {
                Some(PubSubTopic::user(kind, id))
            }
            _ => Some(PubSubTopic::channel(kind, id, "")),
        }
    }
}

impl fmt::Display for PubSubTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.id())
    }
}

impl PartialEq for PubSubTopic {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.id() == other.id()
    }
}

impl Eq for PubSubTopic {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_string_roundtrip() {
        let topics = [
            PubSubTopic::channel(TopicKind::VideoPlayback, "123", "somestreamer"),
            PubSubTopic::user(TopicKind::CommunityPointsUser, "456"),
            PubSubTopic::channel(TopicKind::PredictionsChannel, "789", "other"),
            PubSubTopic::channel(TopicKind::Raid, "42", "other"),
        ];

        for topic in topics {
            let s = topic.to_string();
            let parsed = PubSubTopic::parse(&s).unwrap();
            assert_eq!(parsed, topic);
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn identity_ignores_login_snapshot() {
        let a = PubSubTopic::channel(TopicKind::Raid, "1", "old_login");
        let b = PubSubTopic::channel(TopicKind::Raid, "1", "new_login");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_channel_id_is_invalid() {
        let topic = PubSubTopic::channel(TopicKind::VideoPlayback, "", "ghost");
        assert!(!topic.is_valid());
        assert!(PubSubTopic::user(TopicKind::PredictionsUser, "9").is_valid());
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert!(PubSubTopic::parse("hype-train-events-v1.123").is_none());
        assert!(PubSubTopic::parse("no-dot-here").is_none());
    }
}
