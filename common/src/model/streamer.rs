use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strum_macros::Display;

use super::goal::CommunityGoal;
use super::prediction::BetSettings;
use super::stream::Stream;

/// History reason code for prediction wins/losses.
pub const REASON_PREDICTION: &str = "PREDICTION";
/// History reason code for refunded bets.
pub const REASON_REFUND: &str = "REFUND";
/// History reason code for watch-streak bonuses.
pub const REASON_WATCH_STREAK: &str = "WATCH_STREAK";

/// When the miner should sit in a streamer's chat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatPresence {
    Always,
    Never,
    #[default]
    Online,
    Offline,
}

/// Whether chat should be joined for the given presence policy and state.
pub fn should_join_chat(presence: ChatPresence, is_online: bool) -> bool {
    match presence {
        ChatPresence::Always => true,
        ChatPresence::Never => false,
        ChatPresence::Online => is_online,
        ChatPresence::Offline => !is_online,
    }
}

/// Per-streamer feature toggles and bet configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerSettings {
    pub make_predictions: bool,
    pub follow_raid: bool,
    pub claim_drops: bool,
    pub claim_moments: bool,
    pub watch_streak: bool,
    pub community_goals: bool,
    pub chat: ChatPresence,
    pub bet: BetSettings,
}

impl Default for StreamerSettings {
    fn default() -> StreamerSettings {
        StreamerSettings {
            make_predictions: true,
            follow_raid: true,
            claim_drops: true,
            claim_moments: true,
            watch_streak: true,
            community_goals: false,
            chat: ChatPresence::Online,
            bet: BetSettings::default(),
        }
    }
}

/// An active channel points multiplier on the viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointsMultiplier {
    pub factor: f64,
}

/// Cumulative points moved for one reason code. Counters only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub counter: i64,
    pub amount: i64,
}

/// An active raid on a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raid {
    pub raid_id: String,
    pub target_login: String,
}

/// Mutable state of a tracked streamer, guarded by the streamer's lock.
#[derive(Debug, Default)]
pub struct StreamerState {
    pub display_name: Option<String>,
    pub settings: StreamerSettings,

    pub is_online: bool,
    pub is_category_watched: bool,
    pub category_slug: Option<String>,

    pub stream_up_at: Option<Instant>,
    pub online_at: Option<Instant>,
    pub offline_at: Option<Instant>,

    pub channel_points: u64,
    pub active_multipliers: Vec<PointsMultiplier>,
    pub viewer_is_mod: bool,

    pub stream: Stream,
    pub raid: Option<Raid>,
    pub community_goals: HashMap<String, CommunityGoal>,
    pub history: HashMap<String, HistoryEntry>,
}

impl StreamerState {
    /// Marks the streamer online. A fresh transition records the timestamp
    /// and resets watch-streak tracking.
    pub fn set_online(&mut self) {
        if !self.is_online {
            self.is_online = true;
            self.online_at = Some(Instant::now());
            self.stream.init_watch_streak();
        }
    }

    /// Marks the streamer offline, recording the timestamp on a transition.
    pub fn set_offline(&mut self) {
        if self.is_online {
            self.is_online = false;
            self.offline_at = Some(Instant::now());
        }
    }

    /// Adds to the cumulative history for a reason code.
    pub fn update_history(&mut self, reason_code: &str, earned: i64, counter: i64) {
        let entry = self.history.entry(reason_code.to_owned()).or_default();
        entry.counter += counter;
        entry.amount += earned;

        if reason_code == REASON_WATCH_STREAK {
            self.stream.watch_streak_missing = false;
        }
    }

    /// True once the stream-up debounce window has passed.
    pub fn stream_up_elapsed(&self) -> bool {
        match self.stream_up_at {
            Some(at) => at.elapsed() > Duration::from_secs(120),
            None => true,
        }
    }

    /// True when the streamer qualifies for drop mining.
    pub fn drops_condition(&self) -> bool {
        self.settings.claim_drops && self.is_online && !self.stream.campaign_ids.is_empty()
    }

    pub fn has_points_multiplier(&self) -> bool {
        !self.active_multipliers.is_empty()
    }

    pub fn total_points_multiplier(&self) -> f64 {
        self.active_multipliers.iter().map(|m| m.factor).sum()
    }

    /// Best available category identifier, for logging.
    pub fn resolve_category(&self) -> String {
        if let Some(slug) = &self.category_slug {
            if !slug.is_empty() {
                return slug.clone();
            }
        }
        let slug = self.stream.game_slug();
        if !slug.is_empty() {
            return slug;
        }
        let display = self.stream.game_display_name();
        if !display.is_empty() {
            return display.to_owned();
        }
        "unknown".to_owned()
    }
}

/// A tracked Twitch channel. Identity fields are immutable; everything else
/// lives behind the streamer's own reader-writer lock. Callers must never
/// hold a guard across network I/O.
#[derive(Debug)]
pub struct Streamer {
    pub login: String,
    pub channel_id: String,
    state: RwLock<StreamerState>,
}

impl Streamer {
    pub fn new(login: impl Into<String>, channel_id: impl Into<String>) -> Streamer {
        let login = login.into().to_lowercase();
        Streamer {
            login,
            channel_id: channel_id.into(),
            state: RwLock::new(StreamerState {
                stream: Stream::new(),
                ..Default::default()
            }),
        }
    }

    pub fn with_settings(self, settings: StreamerSettings) -> Streamer {
        self.state.write().unwrap().settings = settings;
        self
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StreamerState> {
        self.state.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, StreamerState> {
        self.state.write().unwrap()
    }

    pub fn url(&self) -> String {
        format!("https://www.twitch.tv/{}", self.login)
    }
}

impl std::fmt::Display for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.login, self.channel_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn online_transitions_record_timestamps() {
        let streamer = Streamer::new("Some_Streamer", "123");
        assert_eq!(streamer.login, "some_streamer");

        {
            let mut state = streamer.write();
            assert!(state.online_at.is_none());
            state.set_online();
            assert!(state.is_online);
            assert!(state.online_at.is_some());

            let first_online = state.online_at;
            state.set_online();
            assert_eq!(state.online_at, first_online, "no-op on repeat set_online");

            state.set_offline();
            assert!(!state.is_online);
            assert!(state.offline_at.is_some());
        }
    }

    #[test]
    fn fresh_online_resets_watch_streak() {
        let streamer = Streamer::new("a", "1");
        let mut state = streamer.write();
        state.set_online();
        state.stream.update_minute_watched();
        state.stream.update_minute_watched();
        state.set_offline();
        state.set_online();
        assert_eq!(state.stream.minute_watched, 0.0);
        assert!(state.stream.watch_streak_missing);
    }

    #[test]
    fn history_is_cumulative() {
        let streamer = Streamer::new("a", "1");
        let mut state = streamer.write();
        state.update_history("WATCH", 10, 1);
        state.update_history("WATCH", 12, 1);
        let entry = state.history["WATCH"];
        assert_eq!(entry.counter, 2);
        assert_eq!(entry.amount, 22);
    }

    #[test]
    fn watch_streak_history_clears_missing_flag() {
        let streamer = Streamer::new("a", "1");
        let mut state = streamer.write();
        state.set_online();
        assert!(state.stream.watch_streak_missing);
        state.update_history(REASON_WATCH_STREAK, 300, 1);
        assert!(!state.stream.watch_streak_missing);
    }

    #[test]
    fn chat_presence_rules() {
        assert!(should_join_chat(ChatPresence::Always, false));
        assert!(!should_join_chat(ChatPresence::Never, true));
        assert!(should_join_chat(ChatPresence::Online, true));
        assert!(!should_join_chat(ChatPresence::Online, false));
        assert!(should_join_chat(ChatPresence::Offline, false));
        assert!(!should_join_chat(ChatPresence::Offline, true));
    }

    #[test]
    fn drops_condition_requires_campaigns() {
        let streamer = Streamer::new("a", "1");
        {
            let mut state = streamer.write();
            state.set_online();
            assert!(!state.drops_condition());
            state.stream.campaign_ids = vec!["c1".to_owned()];
            assert!(state.drops_condition());
            state.settings.claim_drops = false;
            assert!(!state.drops_condition());
        }
    }
}
