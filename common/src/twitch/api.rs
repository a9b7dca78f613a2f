//! High-level Twitch operations built on the GQL client: online checks,
//! stream refresh, channel-points context, community-goal contribution and
//! the minute-watched heartbeat with its spade-URL scrape.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use eyre::{eyre, Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use super::auth::Authenticator;
use super::gql;
use super::{CHROME_USER_AGENT, DROPS_TAG_ID, USER_AGENT};
use crate::model::registry;
use crate::model::streamer::Streamer;

/// Cached spade URLs rarely change mid-stream; six hours is safe.
const SPADE_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Don't re-check a streamer that went offline moments ago.
const OFFLINE_CHECK_DEBOUNCE: Duration = Duration::from_secs(60);
const ONLINE_CHECK_DEBOUNCE: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
struct SpadeCache {
    entries: HashMap<String, (String, Instant)>,
}

impl SpadeCache {
    fn get(&mut self, login: &str) -> Option<String> {
        match self.entries.get(login) {
            Some((url, fetched_at)) if fetched_at.elapsed() <= SPADE_CACHE_TTL => {
                Some(url.clone())
            }
            Some(_) => {
                self.entries.remove(login);
                None
            }
            None => None,
        }
    }

    fn set(&mut self, login: &str, url: String) {
        self.entries.insert(login.to_owned(), (url, Instant::now()));
    }

    /// Opportunistically drops expired entries, e.g. streamers the category
    /// watcher has since removed.
    fn prune(&mut self) {
        self.entries
            .retain(|_, (_, fetched_at)| fetched_at.elapsed() <= SPADE_CACHE_TTL);
    }
}

/// The per-account Twitch API facade: auth + GQL + spade cache.
#[derive(Clone)]
pub struct TwitchApi {
    auth: Arc<Authenticator>,
    gql: gql::Client,
    spade: Arc<Mutex<SpadeCache>>,
}

impl TwitchApi {
    pub fn new(auth: Arc<Authenticator>) -> TwitchApi {
        let gql = gql::Client::new(Arc::clone(&auth));
        TwitchApi {
            auth,
            gql,
            spade: Arc::new(Mutex::new(SpadeCache::default())),
        }
    }

    pub fn auth(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    pub fn gql(&self) -> &gql::Client {
        &self.gql
    }

    /// Checks whether a streamer is live and refreshes their stream record.
    /// Recently-offline streamers are debounced; recently-online ones are
    /// only skipped when their spade URL is already known, so category picks
    /// (marked online before the scrape) still get one.
    pub async fn check_streamer_online(&self, streamer: &Streamer) -> Result<()> {
        let was_online = {
            let state = streamer.read();
            if let Some(offline_at) = state.offline_at {
                if !state.is_online && offline_at.elapsed() < OFFLINE_CHECK_DEBOUNCE {
                    return Ok(());
                }
            }
            if state.is_online {
                if let Some(online_at) = state.online_at {
                    if online_at.elapsed() < ONLINE_CHECK_DEBOUNCE
                        && state.stream.spade_url.is_some()
                    {
                        return Ok(());
                    }
                }
            }
            state.is_online
        };

        if !was_online {
            if let Err(err) = self.update_spade_url(streamer).await {
                debug!(streamer = %streamer.login, "Failed to get spade URL: {err:#}");
            }

            match self.update_stream(streamer).await {
                Ok(()) => streamer.write().set_online(),
                Err(_) => streamer.write().set_offline(),
            }
        } else {
            let needs_spade = streamer.read().stream.spade_url.is_none();
            if needs_spade {
                if let Err(err) = self.update_spade_url(streamer).await {
                    debug!(streamer = %streamer.login, "Failed to refresh spade URL: {err:#}");
                }
            }

            if self.update_stream(streamer).await.is_err() {
                streamer.write().set_offline();
            }
        }

        Ok(())
    }

    /// Refreshes the stream record from the API when the cached copy is
    /// stale, resolving the game slug and rebuilding the beacon payload.
    async fn update_stream(&self, streamer: &Streamer) -> Result<()> {
        if !streamer.read().stream.update_required() {
            return Ok(());
        }

        let info = self
            .gql
            .get_stream_info(&streamer.login)
            .await
            .wrap_err_with(|| format!("Getting stream info for {}", streamer.login))?
            .ok_or_else(|| eyre!("Streamer {} is offline", streamer.login))?;

        let (game_id, slug_known, claim_drops) = {
            let mut state = streamer.write();
            state.stream.update(
                info.broadcast_id,
                info.title,
                info.game,
                info.tags,
                info.viewers_count,
                DROPS_TAG_ID,
            );
            (
                state.stream.game_id().to_owned(),
                !state.stream.game_slug().is_empty(),
                state.settings.claim_drops,
            )
        };

        // Resolve the slug outside the lock; VideoPlayerStreamInfo omits it.
        if !slug_known && !game_id.is_empty() {
            match self.gql.get_game_slug(&game_id).await {
                Ok(slug) => {
                    registry::register_game_slug(&game_id, &slug);
                    let mut state = streamer.write();
                    if let Some(game) = state.stream.game.as_mut() {
                        game.slug = slug;
                    }
                }
                Err(err) => debug!(
                    streamer = %streamer.login,
                    game_id,
                    "Failed to fetch game slug: {err:#}"
                ),
            }
        }

        let campaign_ids = if claim_drops && !game_id.is_empty() {
            self.gql
                .get_available_campaigns(&streamer.channel_id)
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut state = streamer.write();
        state.stream.campaign_ids = campaign_ids;

        let mut properties = json!({
            "channel_id": streamer.channel_id,
            "broadcast_id": state.stream.broadcast_id,
            "player": "site",
            "user_id": self.auth.user_id(),
            "live": true,
            "channel": streamer.login,
        });
        if claim_drops && !state.stream.game_name().is_empty() && !game_id.is_empty() {
            properties["game"] = json!(state.stream.game_name());
            properties["game_id"] = json!(game_id);
        }
        state.stream.payload = Some(json!({
            "event": "minute-watched",
            "properties": properties,
        }));

        Ok(())
    }

    /// Scrapes the channel page for the settings JS and pulls the spade URL
    /// out of it. Cached per streamer.
    async fn update_spade_url(&self, streamer: &Streamer) -> Result<()> {
        if let Some(cached) = self.spade.lock().unwrap().get(&streamer.login) {
            streamer.write().stream.spade_url = Some(cached);
            debug!(streamer = %streamer.login, "Using cached spade URL");
            return Ok(());
        }

        let page = self
            .gql
            .http()
            .get(streamer.url())
            .header("User-Agent", CHROME_USER_AGENT)
            .send()
            .await
            .wrap_err_with(|| format!("Fetching {}", streamer.url()))?
            .text()
            .await?;

        let settings_url = find_settings_url(&page)
            .ok_or_else(|| eyre!("Settings URL not found in {}", streamer.url()))?;

        let settings = self
            .gql
            .http()
            .get(&settings_url)
            .header("User-Agent", CHROME_USER_AGENT)
            .send()
            .await
            .context("Fetching settings JS")?
            .text()
            .await?;

        let spade_url =
            find_spade_url(&settings).ok_or_else(|| eyre!("spade_url not found in settings"))?;

        {
            let mut cache = self.spade.lock().unwrap();
            cache.set(&streamer.login, spade_url.clone());
            cache.prune();
        }
        streamer.write().stream.spade_url = Some(spade_url);
        debug!(streamer = %streamer.login, "Updated spade URL");
        Ok(())
    }

    /// Loads balance, multipliers, claims and community goals for a
    /// streamer; claims an available bonus and contributes to goals.
    pub async fn load_channel_points_context(&self, streamer: &Streamer) -> Result<()> {
        let ctx = self
            .gql
            .get_channel_points_context(&streamer.login)
            .await
            .wrap_err_with(|| format!("Loading channel points context for {}", streamer.login))?;

        let goals_enabled = {
            let mut state = streamer.write();
            state.channel_points = ctx.balance;
            state.active_multipliers = ctx.active_multipliers;

            let goals_enabled = state.settings.community_goals;
            if goals_enabled {
                for goal in ctx.community_goals {
                    state.community_goals.insert(goal.goal_id.clone(), goal);
                }
            }
            goals_enabled
        };

        if let Some(claim_id) = ctx.available_claim_id {
            info!(
                streamer = %streamer.login,
                claim_id,
                "Claiming channel points bonus"
            );
            if let Err(err) = self
                .gql
                .claim_community_points(&claim_id, &streamer.channel_id)
                .await
            {
                warn!(streamer = %streamer.login, "Failed to claim bonus: {err:#}");
            }
        }

        if goals_enabled {
            self.contribute_to_community_goals(streamer).await;
        }

        Ok(())
    }

    /// Contributes points to every started in-stock goal, bounded by the
    /// per-stream user cap and the current balance.
    async fn contribute_to_community_goals(&self, streamer: &Streamer) {
        let active_goals = {
            let state = streamer.read();
            state
                .community_goals
                .values()
                .filter(|g| g.status == "STARTED" && g.is_in_stock)
                .cloned()
                .collect::<Vec<_>>()
        };
        if active_goals.is_empty() {
            return;
        }

        let contributions = match self.gql.get_user_points_contribution(&streamer.login).await {
            Ok(contributions) => contributions,
            Err(err) => {
                debug!(streamer = %streamer.login, "Failed to get goal contributions: {err:#}");
                return;
            }
        };

        for contribution in contributions {
            let Some(goal) = active_goals
                .iter()
                .find(|g| g.goal_id == contribution.goal_id)
            else {
                continue;
            };

            let balance = streamer.read().channel_points;
            let user_left = goal
                .per_stream_user_max_contribution
                .saturating_sub(contribution.user_points_contributed_this_stream);
            let amount = goal.amount_left().min(user_left).min(balance);
            if amount == 0 {
                continue;
            }

            match self
                .gql
                .contribute_to_community_goal(&goal.goal_id, &streamer.channel_id, amount)
                .await
            {
                Ok(()) => {
                    info!(
                        streamer = %streamer.login,
                        goal = %goal.title,
                        amount,
                        "Contributed to community goal"
                    );
                    let mut state = streamer.write();
                    state.channel_points = state.channel_points.saturating_sub(amount);
                }
                Err(err) => warn!(
                    streamer = %streamer.login,
                    goal = %goal.title,
                    "Failed to contribute to community goal: {err:#}"
                ),
            }
        }
    }

    pub async fn check_viewer_is_mod(&self, streamer: &Streamer) {
        match self.gql.check_viewer_is_mod(&streamer.login).await {
            Ok(is_mod) => streamer.write().viewer_is_mod = is_mod,
            Err(err) => {
                debug!(streamer = %streamer.login, "Failed to check mod status: {err:#}")
            }
        }
    }

    /// The full heartbeat for one streamer: playback token, HLS manifest
    /// (last URL), segment list (second-to-last URL), HEAD the segment, then
    /// POST the base64 payload to the spade URL. On success the streamer's
    /// minute-watched accumulator advances.
    pub async fn send_minute_watched(&self, streamer: &Streamer) -> Result<()> {
        let (spade_url, payload) = {
            let state = streamer.read();
            (
                state
                    .stream
                    .spade_url
                    .clone()
                    .ok_or_else(|| eyre!("No spade URL for {}", streamer.login))?,
                state
                    .stream
                    .payload
                    .clone()
                    .ok_or_else(|| eyre!("No payload for {}", streamer.login))?,
            )
        };

        let token = self
            .gql
            .get_playback_access_token(&streamer.login)
            .await
            .wrap_err_with(|| format!("Playback access token for {}", streamer.login))?;

        let manifest_url = format!(
            "https://usher.ttvnw.net/api/channel/hls/{}.m3u8?sig={}&token={}",
            streamer.login, token.signature, token.value
        );
        let manifest = self.fetch_text(&manifest_url).await.context("HLS manifest")?;
        let playlist_url = last_url(&manifest)
            .ok_or_else(|| eyre!("No stream URL in manifest for {}", streamer.login))?;

        let playlist = self.fetch_text(playlist_url).await.context("Segment list")?;
        let segment_url = second_last_url(&playlist)
            .ok_or_else(|| eyre!("No segment URL for {}", streamer.login))?;

        let head = self
            .gql
            .http()
            .head(segment_url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("HEAD segment")?;
        if !head.status().is_success() {
            return Err(eyre!("Segment HEAD returned status {}", head.status()));
        }

        let body = BASE64.encode(serde_json::to_vec(&json!([payload]))?);
        let spade = self
            .gql
            .http()
            .post(&spade_url)
            .header("User-Agent", USER_AGENT)
            .body(body)
            .send()
            .await
            .context("Posting spade event")?;

        match spade.status().as_u16() {
            200 | 204 => {
                streamer.write().stream.update_minute_watched();
                debug!(streamer = %streamer.login, "Sent minute watched event");
                Ok(())
            }
            status => Err(eyre!("Spade event returned status {status}")),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let res = self
            .gql
            .http()
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(eyre!("{url} returned status {}", res.status()));
        }
        Ok(res.text().await?)
    }

}

/// Finds the settings JS URL in a channel page, trying both CDN prefixes.
fn find_settings_url(page: &str) -> Option<String> {
    for prefix in [
        "https://static.twitchcdn.net/config/settings.",
        "https://assets.twitch.tv/config/settings.",
    ] {
        if let Some((_, after)) = page.split_once(prefix) {
            if let Some((stem, _)) = after.split_once(".js") {
                return Some(format!("{prefix}{stem}.js"));
            }
        }
    }
    None
}

fn find_spade_url(settings: &str) -> Option<String> {
    let (_, after) = settings.split_once(r#""spade_url":""#)?;
    let (url, _) = after.split_once('"')?;
    Some(url.to_owned())
}

/// The last URL line of an m3u8 manifest, i.e. the lowest-quality stream.
fn last_url(manifest: &str) -> Option<&str> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("http://") || l.starts_with("https://"))
        .last()
}

/// The second-to-last URL of a segment playlist; falls back to the last one
/// for single-entry playlists.
fn second_last_url(playlist: &str) -> Option<&str> {
    let urls = playlist
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("http://") || l.starts_with("https://"))
        .collect::<Vec<_>>();
    match urls.len() {
        0 => None,
        1 => Some(urls[0]),
        n => Some(urls[n - 2]),
    }
}
