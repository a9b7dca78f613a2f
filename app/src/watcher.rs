//! Category-driven auto-discovery: polls the top streams of configured game
//! categories and keeps at most one discovered streamer per category in the
//! tracked set, releasing it when a regular streamer covers the category or
//! the pick goes offline or switches games.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use common::config::AccountConfig;
use common::model::registry;
use common::model::stream::GameInfo;
use common::model::streamer::{Streamer, StreamerSettings};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::miner::Miner;

const TOP_STREAMS_LIMIT: u32 = 10;

#[derive(Debug, Clone)]
struct CategoryEntry {
    slug: String,
    /// Resolved lazily from the first directory response.
    game_id: String,
    drops_only: Option<bool>,
}

pub struct CategoryWatcher {
    categories: Vec<CategoryEntry>,
    global_drops_only: bool,
    poll_interval: Duration,
    blacklist: HashSet<String>,
    defaults: StreamerSettings,
    /// Current pick per category slug; empty string means no pick held.
    picks: HashMap<String, String>,
}

impl CategoryWatcher {
    pub fn new(cfg: &AccountConfig) -> CategoryWatcher {
        let categories = cfg
            .category_watcher
            .categories
            .iter()
            .map(|c| CategoryEntry {
                slug: c.slug.clone(),
                game_id: String::new(),
                drops_only: c.drops_only,
            })
            .collect::<Vec<_>>();

        let mut defaults = cfg.streamer_defaults();
        // Discovered picks never follow raids away from their category.
        defaults.follow_raid = false;

        CategoryWatcher {
            picks: categories
                .iter()
                .map(|c| (c.slug.clone(), String::new()))
                .collect(),
            categories,
            global_drops_only: cfg.category_watcher.drops_only,
            poll_interval: cfg.category_watcher.interval(),
            blacklist: cfg.blacklist.iter().map(|b| b.to_lowercase()).collect(),
            defaults,
        }
    }

    pub async fn run(mut self, miner: Arc<Miner>) -> Result<()> {
        info!(
            categories = self.categories.len(),
            poll_interval = ?self.poll_interval,
            "Category watcher started"
        );

        let mut ticker = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = miner.cancel.cancelled() => {
                    info!("Category watcher stopping");
                    for (_, login) in self.picks.iter() {
                        if !login.is_empty() {
                            miner.remove_streamer(login, "category_watcher_shutdown");
                        }
                    }
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            self.evaluate(&miner).await;
        }
    }

    /// One poll pass over all configured categories. Picks are only dropped
    /// when they go offline, change category or become redundant; a busier
    /// stream appearing in the directory never evicts a valid pick.
    async fn evaluate(&mut self, miner: &Arc<Miner>) {
        for i in 0..self.categories.len() {
            if miner.cancel.is_cancelled() {
                return;
            }

            let entry = self.categories[i].clone();
            let drops_only = entry.drops_only.unwrap_or(self.global_drops_only);
            let tracked = miner.streamers();

            if is_category_covered(&tracked, &entry) {
                let current = self.picks.get(&entry.slug).cloned().unwrap_or_default();
                if !current.is_empty() {
                    debug!(
                        category = entry.slug,
                        "Category covered by regular streamer, releasing pick"
                    );
                    miner.remove_streamer(&current, "category_covered_by_regular");
                    self.picks.insert(entry.slug.clone(), String::new());
                }
                continue;
            }

            let current = self.picks.get(&entry.slug).cloned().unwrap_or_default();
            if !current.is_empty() {
                match check_pick_validity(&tracked, &current, &entry) {
                    Ok(()) => continue,
                    Err(reason) => {
                        miner.remove_streamer(&current, reason);
                        self.picks.insert(entry.slug.clone(), String::new());
                    }
                }
            }

            let streams = match miner
                .api
                .gql()
                .get_top_streams_by_category(&entry.slug, TOP_STREAMS_LIMIT, drops_only)
                .await
            {
                Ok(streams) => streams,
                Err(err) => {
                    warn!(category = entry.slug, "Failed to fetch top streams: {err:#}");
                    continue;
                }
            };

            if streams.is_empty() {
                info!(
                    category = entry.slug,
                    drops_only, "No live streams for category"
                );
                continue;
            }

            if self.categories[i].game_id.is_empty() && !streams[0].game_id.is_empty() {
                self.categories[i].game_id = streams[0].game_id.clone();
                info!(
                    category = entry.slug,
                    game_id = self.categories[i].game_id,
                    "Resolved category to game id"
                );
            }

            // Directory responses are the main source of id -> slug pairs.
            registry::register_game_slug(&self.categories[i].game_id, &entry.slug);
            for stream in &streams {
                registry::register_game_slug(&stream.game_id, &stream.game_slug);
            }

            let tracked_ids = tracked
                .iter()
                .map(|s| s.channel_id.clone())
                .collect::<HashSet<_>>();
            let candidate = streams.iter().find(|s| {
                !tracked_ids.contains(&s.channel_id)
                    && !self.blacklist.contains(&s.login.to_lowercase())
            });

            let Some(candidate) = candidate else {
                info!(
                    category = entry.slug,
                    "All top streams for category are already tracked"
                );
                continue;
            };

            let streamer = Arc::new(
                Streamer::new(&candidate.login, &candidate.channel_id)
                    .with_settings(self.defaults.clone()),
            );
            {
                let mut state = streamer.write();
                state.display_name = Some(candidate.display_name.clone());
                state.is_category_watched = true;
                state.category_slug = Some(entry.slug.clone());
                state.set_online();
                state.stream.game = Some(GameInfo {
                    id: self.categories[i].game_id.clone(),
                    name: candidate.game_name.clone(),
                    display_name: candidate.game_name.clone(),
                    slug: entry.slug.clone(),
                });
                state.stream.viewers_count = candidate.viewers_count;
                state.stream.mark_updated();
            }

            self.picks
                .insert(entry.slug.clone(), candidate.login.to_lowercase());
            miner.add_streamer(streamer);

            info!(
                streamer = %candidate.login,
                category = entry.slug,
                viewers = candidate.viewers_count,
                "Discovered via category"
            );
        }
    }
}

/// A category is covered when a regular (non-discovered) streamer is online
/// in it.
fn is_category_covered(streamers: &[Arc<Streamer>], entry: &CategoryEntry) -> bool {
    streamers.iter().any(|s| {
        let state = s.read();
        !state.is_category_watched && state.is_online && matches_category(&state, entry)
    })
}

/// Checks whether a held pick is still online and in the right category.
/// Returns the removal reason otherwise.
fn check_pick_validity(
    streamers: &[Arc<Streamer>],
    login: &str,
    entry: &CategoryEntry,
) -> Result<(), &'static str> {
    for streamer in streamers {
        if !streamer.login.eq_ignore_ascii_case(login) {
            continue;
        }
        let state = streamer.read();
        if !state.is_online {
            return Err("streamer_went_offline");
        }
        if !matches_category(&state, entry) {
            return Err("streamer_changed_category");
        }
        return Ok(());
    }
    Err("streamer_not_found")
}

/// Compares by immutable game id when both sides know it, falling back to
/// the slug before the id has been resolved.
fn matches_category(
    state: &common::model::streamer::StreamerState,
    entry: &CategoryEntry,
) -> bool {
    let Some(game) = &state.stream.game else {
        return false;
    };

    if !entry.game_id.is_empty() && !game.id.is_empty() {
        return entry.game_id == game.id;
    }
    if !game.slug.is_empty() {
        return game.slug.eq_ignore_ascii_case(&entry.slug);
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(slug: &str, game_id: &str) -> CategoryEntry {
        CategoryEntry {
            slug: slug.to_owned(),
            game_id: game_id.to_owned(),
            drops_only: None,
        }
    }

    fn streamer_in_game(
        login: &str,
        id: &str,
        game: Option<GameInfo>,
        online: bool,
        category_watched: bool,
    ) -> Arc<Streamer> {
        let streamer = Arc::new(Streamer::new(login, id));
        {
            let mut state = streamer.write();
            state.is_online = online;
            state.is_category_watched = category_watched;
            state.stream.game = game;
        }
        streamer
    }

    fn rust_game() -> Option<GameInfo> {
        Some(GameInfo {
            id: "263490".into(),
            name: "Rust".into(),
            display_name: "Rust".into(),
            slug: "rust".into(),
        })
    }

    #[test]
    fn match_prefers_game_id() {
        let streamer = streamer_in_game("a", "1", rust_game(), true, false);
        let state = streamer.read();

        assert!(matches_category(&state, &entry("rust", "263490")));
        assert!(!matches_category(&state, &entry("rust", "999")));
        // Unresolved game id falls back to the slug.
        assert!(matches_category(&state, &entry("rust", "")));
        assert!(!matches_category(&state, &entry("fortnite", "")));
    }

    #[test]
    fn coverage_requires_regular_online_streamer() {
        let cat = entry("rust", "263490");

        let regular_online = streamer_in_game("a", "1", rust_game(), true, false);
        assert!(is_category_covered(&[regular_online], &cat));

        let regular_offline = streamer_in_game("b", "2", rust_game(), false, false);
        assert!(!is_category_covered(&[regular_offline], &cat));

        // A category pick never counts as coverage.
        let pick = streamer_in_game("c", "3", rust_game(), true, true);
        assert!(!is_category_covered(&[pick], &cat));
    }

    #[test]
    fn pick_validity_reasons() {
        let cat = entry("rust", "263490");

        let valid = streamer_in_game("pick", "1", rust_game(), true, true);
        assert!(check_pick_validity(&[valid], "pick", &cat).is_ok());

        let offline = streamer_in_game("pick", "1", rust_game(), false, true);
        assert_eq!(
            check_pick_validity(&[offline], "pick", &cat),
            Err("streamer_went_offline")
        );

        let other_game = streamer_in_game(
            "pick",
            "1",
            Some(GameInfo {
                id: "999".into(),
                slug: "fortnite".into(),
                ..Default::default()
            }),
            true,
            true,
        );
        assert_eq!(
            check_pick_validity(&[other_game], "pick", &cat),
            Err("streamer_changed_category")
        );

        assert_eq!(
            check_pick_validity(&[], "pick", &cat),
            Err("streamer_not_found")
        );
    }
}
