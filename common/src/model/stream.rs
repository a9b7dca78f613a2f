use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry;
use crate::model::campaign::Campaign;

/// Interval after which cached stream info must be refreshed.
pub const STREAM_UPDATE_INTERVAL: Duration = Duration::from_secs(120);

/// Game/category metadata from the Twitch API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    #[serde(default, rename = "localizedName")]
    pub localized_name: String,
}

/// The live-broadcast facet of a streamer.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    pub broadcast_id: String,
    pub title: String,
    pub game: Option<GameInfo>,
    pub tags: Vec<Tag>,
    pub drops_tags: bool,
    pub viewers_count: u64,
    pub campaigns: Vec<Campaign>,
    pub campaign_ids: Vec<String>,
    pub spade_url: Option<String>,
    pub payload: Option<Value>,
    pub watch_streak_missing: bool,
    pub minute_watched: f64,
    minute_watched_at: Option<Instant>,
    last_update: Option<Instant>,
}

impl Stream {
    pub fn new() -> Stream {
        let mut s = Stream::default();
        s.init_watch_streak();
        s
    }

    /// Refreshes the stream info with a fresh API response.
    pub fn update(
        &mut self,
        broadcast_id: String,
        title: String,
        game: Option<GameInfo>,
        tags: Vec<Tag>,
        viewers_count: u64,
        drops_tag_id: &str,
    ) {
        self.broadcast_id = broadcast_id;
        self.title = title;
        self.game = game;
        self.tags = tags;
        self.viewers_count = viewers_count;
        self.drops_tags =
            self.game.is_some() && self.tags.iter().any(|tag| tag.id == drops_tag_id);
        self.last_update = Some(Instant::now());
    }

    pub fn game_id(&self) -> &str {
        self.game.as_ref().map(|g| g.id.as_str()).unwrap_or("")
    }

    pub fn game_name(&self) -> &str {
        self.game.as_ref().map(|g| g.name.as_str()).unwrap_or("")
    }

    pub fn game_display_name(&self) -> &str {
        self.game
            .as_ref()
            .map(|g| g.display_name.as_str())
            .unwrap_or("")
    }

    /// The game's URL slug: the API value when present, otherwise the
    /// process-wide registry populated by the category watcher.
    pub fn game_slug(&self) -> String {
        let Some(game) = &self.game else {
            return String::new();
        };
        if !game.slug.is_empty() {
            return game.slug.clone();
        }
        if !game.id.is_empty() {
            if let Some(slug) = registry::lookup_game_slug(&game.id) {
                return slug;
            }
        }
        String::new()
    }

    pub fn update_required(&self) -> bool {
        match self.last_update {
            Some(at) => at.elapsed() >= STREAM_UPDATE_INTERVAL,
            None => true,
        }
    }

    /// Marks the info fresh without changing it, e.g. when a stream record is
    /// seeded from a category-watcher API response.
    pub fn mark_updated(&mut self) {
        self.last_update = Some(Instant::now());
    }

    /// Resets watch-streak tracking. Called on every fresh online transition,
    /// which is the only point where `minute_watched` may go back to zero.
    pub fn init_watch_streak(&mut self) {
        self.watch_streak_missing = true;
        self.minute_watched = 0.0;
        self.minute_watched_at = None;
    }

    /// Accumulates minutes watched since the previous successful beacon.
    pub fn update_minute_watched(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.minute_watched_at {
            self.minute_watched += now.duration_since(prev).as_secs_f64() / 60.0;
        }
        self.minute_watched_at = now.into();
    }
}
