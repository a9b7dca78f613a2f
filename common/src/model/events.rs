use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Tags attached to loggable events, used to filter what reaches the
/// notification sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    StreamerOnline,
    StreamerOffline,
    GainForRaid,
    GainForClaim,
    GainForWatch,
    GainForWatchStreak,
    BetWin,
    BetLose,
    BetRefund,
    BetFilters,
    BetGeneral,
    BetFailed,
    BetStart,
    BonusClaim,
    MomentClaim,
    JoinRaid,
    DropClaim,
    DropStatus,
}

impl Event {
    /// Maps a points-earned reason code to its gain event.
    pub fn from_reason_code(reason: &str) -> Event {
        match reason {
            "CLAIM" => Event::GainForClaim,
            "RAID" => Event::GainForRaid,
            "WATCH_STREAK" => Event::GainForWatchStreak,
            _ => Event::GainForWatch,
        }
    }
}

/// A selector applied in order when choosing which online streamers to
/// watch this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Order,
    Streak,
    Drops,
    Subscribed,
    PointsAscending,
    PointsDescending,
}

/// Sort order for the followed-channels expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FollowersOrder {
    #[default]
    Asc,
    Desc,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reason_code_mapping() {
        assert_eq!(Event::from_reason_code("CLAIM"), Event::GainForClaim);
        assert_eq!(Event::from_reason_code("RAID"), Event::GainForRaid);
        assert_eq!(
            Event::from_reason_code("WATCH_STREAK"),
            Event::GainForWatchStreak
        );
        assert_eq!(Event::from_reason_code("WATCH"), Event::GainForWatch);
        assert_eq!(
            Event::from_reason_code("WATCH_CONSECUTIVE_GAMES"),
            Event::GainForWatch
        );
    }

    #[test]
    fn event_tags_serialize_screaming() {
        assert_eq!(Event::BetFilters.to_string(), "BET_FILTERS");
        assert_eq!(
            serde_json::to_string(&Priority::PointsAscending).unwrap(),
            "\"POINTS_ASCENDING\""
        );
    }
}
