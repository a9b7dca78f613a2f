//! Typed client for Twitch's persisted-query GraphQL endpoint: connection
//! pooling, per-call retry with exponential backoff, a circuit breaker,
//! batched requests and a cached client version.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use eyre::{eyre, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::auth::Authenticator;
use super::{
    generate_hex, traverse_json, GqlOperation, CLIENT_VERSION, DROPS_TAG_ID, GQL_URL, TWITCH_URL,
    USER_AGENT,
};
use crate::model::goal::CommunityGoal;
use crate::model::stream::{GameInfo, Tag};
use crate::model::streamer::PointsMultiplier;
use crate::model::FollowersOrder;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: u32 = 3;
const STARTUP_MAX_RETRIES: u32 = 1;

/// How long the scraped client version stays valid.
const CLIENT_VERSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Campaign details are fetched in batches of this size with a small delay
/// in between to stay under the radar.
const CAMPAIGN_BATCH_SIZE: usize = 20;
const CAMPAIGN_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Operations where "integrity check" failures are routine and logged at
/// debug instead of warn.
const INTEGRITY_FLAKY_OPS: [&str; 3] =
    ["JoinRaid", "ClaimCommunityPoints", "ViewerDropsDashboard"];

/// Errors from the request layer. Callers match on `CircuitOpen` to treat it
/// as transient.
#[derive(Debug, thiserror::Error)]
pub enum GqlError {
    #[error("CIRCUIT_OPEN: API requests temporarily suspended")]
    CircuitOpen,
    #[error("GQL request for {op} failed: {source}")]
    Transport {
        op: String,
        source: reqwest::Error,
    },
    #[error("GQL request for {op} returned status {status}")]
    Status { op: String, status: u16 },
    #[error("GQL request for {op} exhausted {attempts} attempts")]
    Exhausted { op: String, attempts: u32 },
    #[error("Parsing GQL response for {op}: {source}")]
    Decode {
        op: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Default)]
struct CircuitBreaker {
    consecutive_fails: u32,
    cooldown_until: Option<Instant>,
}

impl CircuitBreaker {
    /// After ten consecutive failures the breaker opens for
    /// `(fails - 9) * 30s`, capped at five minutes.
    fn record_failure(&mut self) {
        self.consecutive_fails += 1;
        if self.consecutive_fails >= 10 {
            let backoff = Duration::from_secs(30 * (self.consecutive_fails - 9) as u64)
                .min(Duration::from_secs(5 * 60));
            self.cooldown_until = Some(Instant::now() + backoff);
        }
    }

    fn record_success(&mut self) {
        self.consecutive_fails = 0;
        self.cooldown_until = None;
    }

    fn is_open(&self) -> bool {
        matches!(self.cooldown_until, Some(until) if Instant::now() < until)
    }
}

#[derive(Debug)]
struct VersionCache {
    version: String,
    updated_at: Option<Instant>,
}

impl VersionCache {
    fn get(&self) -> (String, bool) {
        let valid = matches!(self.updated_at, Some(at) if at.elapsed() < CLIENT_VERSION_TTL);
        (self.version.clone(), valid)
    }

    fn set(&mut self, version: String) {
        self.version = version;
        self.updated_at = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestMode {
    timeout: Duration,
    max_retries: u32,
}

#[derive(Debug, Serialize)]
struct GqlRequestBody {
    #[serde(rename = "operationName")]
    operation_name: &'static str,
    variables: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct GqlResponseBody {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    errors: Vec<GqlResponseError>,
}

#[derive(Debug, Deserialize)]
struct GqlResponseError {
    #[serde(default)]
    message: String,
}

struct ClientInner {
    http: reqwest::Client,
    auth: Arc<Authenticator>,
    url: String,
    breaker: Mutex<CircuitBreaker>,
    version: RwLock<VersionCache>,
    mode: RwLock<RequestMode>,
}

/// The shared GQL client. Cloning is cheap; all clones share the HTTP pool,
/// the circuit breaker and the version cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Parsed `ChannelPointsContext` response.
#[derive(Debug, Default)]
pub struct ChannelPointsContext {
    pub balance: u64,
    pub active_multipliers: Vec<PointsMultiplier>,
    pub available_claim_id: Option<String>,
    pub community_goals: Vec<CommunityGoal>,
}

/// `PlaybackAccessToken` response: the signature/value pair for HLS access.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackAccessToken {
    pub signature: String,
    pub value: String,
}

/// Parsed stream info from `VideoPlayerStreamInfoOverlayChannel`.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub broadcast_id: String,
    pub title: String,
    pub game: Option<GameInfo>,
    pub tags: Vec<Tag>,
    pub viewers_count: u64,
}

/// One entry from the `DirectoryPage_Game` top-streams listing.
#[derive(Debug, Clone, Default)]
pub struct TopStream {
    pub login: String,
    pub channel_id: String,
    pub display_name: String,
    pub viewers_count: u64,
    pub game_id: String,
    pub game_name: String,
    pub game_slug: String,
}

/// A user's contribution record for one community goal this stream.
#[derive(Debug, Clone, Default)]
pub struct GoalContribution {
    pub goal_id: String,
    pub user_points_contributed_this_stream: u64,
}

impl Client {
    pub fn new(auth: Arc<Authenticator>) -> Client {
        Client::with_url(auth, GQL_URL.to_owned())
    }

    pub fn with_url(auth: Arc<Authenticator>, url: String) -> Client {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Building GQL HTTP client");

        Client {
            inner: Arc::new(ClientInner {
                http,
                auth,
                url,
                breaker: Mutex::new(CircuitBreaker::default()),
                version: RwLock::new(VersionCache {
                    version: CLIENT_VERSION.to_owned(),
                    updated_at: None,
                }),
                mode: RwLock::new(RequestMode {
                    timeout: DEFAULT_TIMEOUT,
                    max_retries: DEFAULT_MAX_RETRIES,
                }),
            }),
        }
    }

    /// Lowers timeout and retries for the initial resolve/load phase.
    pub fn set_startup_mode(&self) {
        *self.inner.mode.write().unwrap() = RequestMode {
            timeout: STARTUP_TIMEOUT,
            max_retries: STARTUP_MAX_RETRIES,
        };
        debug!("GQL client switched to startup mode");
    }

    pub fn set_normal_mode(&self) {
        *self.inner.mode.write().unwrap() = RequestMode {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        };
        debug!("GQL client switched to normal mode");
    }

    /// The pooled HTTP client, shared with the heartbeat sender.
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    fn build_body(op: GqlOperation, variables: Value) -> GqlRequestBody {
        if op.query.is_empty() {
            GqlRequestBody {
                operation_name: op.name,
                variables,
                extensions: Some(json!({
                    "persistedQuery": {"version": 1, "sha256Hash": op.sha256}
                })),
                query: None,
            }
        } else {
            GqlRequestBody {
                operation_name: op.name,
                variables,
                extensions: None,
                query: Some(op.query),
            }
        }
    }

    /// Sends one operation and returns the `data` portion of the response.
    /// Server-side `errors[]` are logged, not fatal; Twitch regularly returns
    /// partial data next to them.
    pub async fn post_gql(&self, op: GqlOperation, variables: Value) -> Result<Value, GqlError> {
        let body = serde_json::to_vec(&Self::build_body(op, variables))
            .map_err(|source| GqlError::Decode {
                op: op.name.to_owned(),
                source,
            })?;
        let raw = self.do_http_request(body, op.name).await?;

        let response: GqlResponseBody =
            serde_json::from_slice(&raw).map_err(|source| GqlError::Decode {
                op: op.name.to_owned(),
                source,
            })?;
        self.log_gql_errors(op.name, &response.errors);
        Ok(response.data)
    }

    /// Sends several operations as one JSON array; one HTTP round trip, one
    /// retry chain, `N` data payloads back in order.
    pub async fn post_gql_batch(
        &self,
        requests: Vec<(GqlOperation, Value)>,
    ) -> Result<Vec<Value>, GqlError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let bodies = requests
            .iter()
            .map(|(op, vars)| Self::build_body(*op, vars.clone()))
            .collect::<Vec<_>>();
        let body = serde_json::to_vec(&bodies).map_err(|source| GqlError::Decode {
            op: "batch".to_owned(),
            source,
        })?;

        let raw = self.do_http_request(body, "batch").await?;
        let responses: Vec<GqlResponseBody> =
            serde_json::from_slice(&raw).map_err(|source| GqlError::Decode {
                op: "batch".to_owned(),
                source,
            })?;

        Ok(responses
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                if let Some(err) = r.errors.first() {
                    warn!(index = i, error = %err.message, "GQL batch error");
                }
                r.data
            })
            .collect())
    }

    fn log_gql_errors(&self, op_name: &str, errors: &[GqlResponseError]) {
        let Some(first) = errors.first() else { return };
        if first.message.contains("integrity check") && INTEGRITY_FLAKY_OPS.contains(&op_name) {
            debug!(operation = op_name, error = %first.message, "GQL integrity check failure (expected)");
        } else {
            warn!(operation = op_name, error = %first.message, "GQL operation returned errors");
        }
    }

    async fn do_http_request(&self, body: Vec<u8>, op_name: &str) -> Result<Vec<u8>, GqlError> {
        if self.inner.breaker.lock().unwrap().is_open() {
            debug!(operation = op_name, "Circuit breaker open, skipping request");
            return Err(GqlError::CircuitOpen);
        }

        let mode = *self.inner.mode.read().unwrap();

        for attempt in 0..=mode.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_secs(1u64 << (attempt - 1));
                debug!(
                    operation = op_name,
                    attempt,
                    max = mode.max_retries,
                    ?backoff,
                    "Retrying GQL request"
                );
                sleep(backoff).await;
            }

            let version = self.current_client_version().await;
            let mut req = self
                .inner
                .http
                .post(&self.inner.url)
                .timeout(mode.timeout)
                .header("Content-Type", "application/json")
                .header("Client-Version", version);
            for (k, v) in self.inner.auth.auth_headers() {
                req = req.header(k, v);
            }
            match self.inner.auth.fetch_integrity_token().await {
                Ok(token) if !token.is_empty() => {
                    req = req.header("Client-Integrity", token);
                }
                Ok(_) => {}
                Err(err) => debug!(
                    operation = op_name,
                    "Proceeding without integrity token: {err:#}"
                ),
            }

            let res = match req.body(body.clone()).send().await {
                Ok(res) => res,
                Err(err) => {
                    if attempt < mode.max_retries {
                        debug!(operation = op_name, "GQL request failed, will retry: {err}");
                        continue;
                    }
                    warn!(
                        operation = op_name,
                        attempts = mode.max_retries + 1,
                        "GQL request failed after all retries: {err}"
                    );
                    self.inner.breaker.lock().unwrap().record_failure();
                    return Err(GqlError::Transport {
                        op: op_name.to_owned(),
                        source: err,
                    });
                }
            };

            let status = res.status();
            if status.as_u16() == 429 || status.is_server_error() {
                if attempt < mode.max_retries {
                    debug!(
                        operation = op_name,
                        status = status.as_u16(),
                        "GQL request returned retryable status, will retry"
                    );
                    continue;
                }
                warn!(
                    operation = op_name,
                    status = status.as_u16(),
                    attempts = mode.max_retries + 1,
                    "GQL request returned retryable status after all retries"
                );
                self.inner.breaker.lock().unwrap().record_failure();
                return Err(GqlError::Status {
                    op: op_name.to_owned(),
                    status: status.as_u16(),
                });
            }

            if !status.is_success() {
                self.inner.breaker.lock().unwrap().record_failure();
                return Err(GqlError::Status {
                    op: op_name.to_owned(),
                    status: status.as_u16(),
                });
            }

            let bytes = match res.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    if attempt < mode.max_retries {
                        debug!(operation = op_name, "Failed to read GQL response, will retry: {err}");
                        continue;
                    }
                    self.inner.breaker.lock().unwrap().record_failure();
                    return Err(GqlError::Transport {
                        op: op_name.to_owned(),
                        source: err,
                    });
                }
            };

            self.inner.breaker.lock().unwrap().record_success();
            return Ok(bytes.to_vec());
        }

        self.inner.breaker.lock().unwrap().record_failure();
        Err(GqlError::Exhausted {
            op: op_name.to_owned(),
            attempts: mode.max_retries + 1,
        })
    }

    /// The cached client version, re-scraped from the homepage every 30
    /// minutes. Falls back to the previous value on scrape failure.
    async fn current_client_version(&self) -> String {
        {
            let (version, valid) = self.inner.version.read().unwrap().get();
            if valid {
                return version;
            }
        }

        match self.fetch_client_version().await {
            Ok(version) => {
                debug!(version, "Updated client version");
                self.inner.version.write().unwrap().set(version.clone());
                version
            }
            Err(err) => {
                debug!("Failed to update client version, using cached: {err:#}");
                self.inner.version.read().unwrap().get().0
            }
        }
    }

    async fn fetch_client_version(&self) -> Result<String> {
        let body = self
            .inner
            .http
            .get(TWITCH_URL)
            .header("User-Agent", USER_AGENT)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .context("Fetching Twitch homepage")?
            .error_for_status()?
            .text()
            .await
            .context("Reading Twitch homepage")?;

        parse_build_id(&body).ok_or_else(|| eyre!("Twilight build id not found in homepage"))
    }

    // ---- typed operations ------------------------------------------------

    /// Resolves a login to its channel id.
    pub async fn get_user_id(&self, login: &str) -> Result<String> {
        let data = self
            .post_gql(super::OP_GET_ID_FROM_LOGIN, json!({"login": login}))
            .await?;
        traverse_json(&data, ".user.id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| eyre!("User {login} not found"))
    }

    /// Current stream info for a channel, `None` when offline.
    pub async fn get_stream_info(&self, login: &str) -> Result<Option<StreamInfo>> {
        let data = self
            .post_gql(super::OP_STREAM_INFO, json!({"channel": login}))
            .await?;

        let Some(user) = data.get("user").filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let Some(stream) = user.get("stream").filter(|v| !v.is_null()) else {
            return Ok(None);
        };

        let mut info = StreamInfo {
            broadcast_id: crate::utils::string_from_value(stream.get("id")),
            viewers_count: crate::utils::int_from_value(stream.get("viewersCount")),
            ..Default::default()
        };

        if let Some(settings) = user.get("broadcastSettings") {
            info.title = crate::utils::string_from_value(settings.get("title"));
            if let Some(game) = settings.get("game").filter(|v| !v.is_null()) {
                info.game = serde_json::from_value(game.clone()).ok();
            }
        }
        if let Some(tags) = stream.get("tags").and_then(|v| v.as_array()) {
            info.tags = tags
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect();
        }

        Ok(Some(info))
    }

    /// Balance, multipliers, available claim and community goals for a channel.
    pub async fn get_channel_points_context(&self, login: &str) -> Result<ChannelPointsContext> {
        let data = self
            .post_gql(
                super::OP_CHANNEL_POINTS_CONTEXT,
                json!({"channelLogin": login}),
            )
            .await?;

        if traverse_json(&data, ".community").map_or(true, Value::is_null) {
            return Err(eyre!("Channel {login} not found (community is null)"));
        }

        let mut ctx = ChannelPointsContext {
            balance: crate::utils::int_from_value(traverse_json(
                &data,
                ".community.channel.self.communityPoints.balance",
            )),
            ..Default::default()
        };

        if let Some(multipliers) = traverse_json(
            &data,
            ".community.channel.self.communityPoints.activeMultipliers",
        )
        .and_then(|v| v.as_array())
        {
            ctx.active_multipliers = multipliers
                .iter()
                .map(|m| PointsMultiplier {
                    factor: crate::utils::float_from_value(m.get("factor")),
                })
                .collect();
        }

        ctx.available_claim_id = traverse_json(
            &data,
            ".community.channel.self.communityPoints.availableClaim.id",
        )
        .and_then(|v| v.as_str())
        .map(str::to_owned);

        if let Some(goals) =
            traverse_json(&data, ".community.channel.communityPointsSettings.goals")
                .and_then(|v| v.as_array())
        {
            ctx.community_goals = goals.iter().map(CommunityGoal::from_gql).collect();
        }

        Ok(ctx)
    }

    pub async fn claim_community_points(&self, claim_id: &str, channel_id: &str) -> Result<()> {
        self.post_gql(
            super::OP_CLAIM_COMMUNITY_POINTS,
            json!({"input": {"channelID": channel_id, "claimID": claim_id}}),
        )
        .await
        .context("ClaimCommunityPoints")?;
        Ok(())
    }

    pub async fn claim_moment(&self, moment_id: &str) -> Result<()> {
        self.post_gql(
            super::OP_CLAIM_MOMENT,
            json!({"input": {"momentID": moment_id}}),
        )
        .await
        .context("CommunityMomentCallout_Claim")?;
        Ok(())
    }

    pub async fn join_raid(&self, raid_id: &str) -> Result<()> {
        self.post_gql(super::OP_JOIN_RAID, json!({"input": {"raidID": raid_id}}))
            .await
            .context("JoinRaid")?;
        Ok(())
    }

    /// Places a bet. The server echoes failures inside `data`, so those are
    /// surfaced as errors here rather than in `errors[]`.
    pub async fn make_prediction(
        &self,
        event_id: &str,
        outcome_id: &str,
        points: u64,
    ) -> Result<()> {
        let data = self
            .post_gql(
                super::OP_MAKE_PREDICTION,
                json!({"input": {
                    "eventID": event_id,
                    "outcomeID": outcome_id,
                    "points": points,
                    "transactionID": generate_hex(16),
                }}),
            )
            .await?;

        if let Some(code) = traverse_json(&data, ".makePrediction.error.code")
            .filter(|v| !v.is_null())
            .and_then(|v| v.as_str())
        {
            return Err(eyre!("Prediction error: {code}"));
        }
        Ok(())
    }

    pub async fn get_playback_access_token(&self, login: &str) -> Result<PlaybackAccessToken> {
        let data = self
            .post_gql(
                super::OP_PLAYBACK_ACCESS_TOKEN,
                json!({
                    "login": login,
                    "isLive": true,
                    "isVod": false,
                    "vodID": "",
                    "playerType": "site",
                }),
            )
            .await?;

        let token = traverse_json(&data, ".streamPlaybackAccessToken")
            .filter(|v| !v.is_null())
            .ok_or_else(|| eyre!("No playback access token for {login} (stream may be offline)"))?;
        serde_json::from_value(token.clone()).context("Parsing PlaybackAccessToken")
    }

    /// All followed channel logins, paginated.
    pub async fn get_followed_streamers(
        &self,
        limit: u32,
        order: FollowersOrder,
    ) -> Result<Vec<String>> {
        let mut follows = Vec::new();
        let mut cursor = String::new();

        loop {
            let data = self
                .post_gql(
                    super::OP_CHANNEL_FOLLOWS,
                    json!({"limit": limit, "order": order.to_string(), "cursor": cursor}),
                )
                .await?;

            let Some(edges) =
                traverse_json(&data, ".user.follows.edges").and_then(|v| v.as_array())
            else {
                return Ok(follows);
            };

            for edge in edges {
                if let Some(login) = traverse_json(edge, ".node.login").and_then(|v| v.as_str()) {
                    follows.push(login.to_owned());
                }
                cursor = crate::utils::string_from_value(edge.get("cursor"));
            }

            let has_next = traverse_json(&data, ".user.follows.pageInfo.hasNextPage")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !has_next {
                return Ok(follows);
            }
        }
    }

    /// Campaign ids with drops available on a channel right now.
    pub async fn get_available_campaigns(&self, channel_id: &str) -> Result<Vec<String>> {
        let data = self
            .post_gql(super::OP_AVAILABLE_DROPS, json!({"channelID": channel_id}))
            .await?;

        Ok(
            traverse_json(&data, ".channel.viewerDropCampaigns")
                .and_then(|v| v.as_array())
                .map(|campaigns| {
                    campaigns
                        .iter()
                        .filter_map(|c| c.get("id").and_then(|v| v.as_str()))
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        )
    }

    /// Dashboard campaigns, optionally filtered by status.
    pub async fn get_drops_dashboard(&self, status: Option<&str>) -> Result<Vec<Value>> {
        let data = self
            .post_gql(super::OP_DROPS_DASHBOARD, json!({}))
            .await?;

        let campaigns = traverse_json(&data, ".currentUser.dropCampaigns")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(match status {
            Some(status) => campaigns
                .into_iter()
                .filter(|c| c.get("status").and_then(|v| v.as_str()) == Some(status))
                .collect(),
            None => campaigns,
        })
    }

    pub async fn get_drops_inventory(&self) -> Result<Value> {
        let data = self.post_gql(super::OP_INVENTORY, json!({})).await?;
        Ok(traverse_json(&data, ".currentUser.inventory")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Details for many campaigns, 20 per HTTP round trip with a 100 ms gap
    /// between batches.
    pub async fn get_drop_campaign_details_batch(
        &self,
        campaign_ids: &[String],
        channel_login: &str,
    ) -> Result<Vec<Value>> {
        let mut details = Vec::with_capacity(campaign_ids.len());

        for (i, chunk) in campaign_ids.chunks(CAMPAIGN_BATCH_SIZE).enumerate() {
            if i > 0 {
                sleep(CAMPAIGN_BATCH_DELAY).await;
            }

            let requests = chunk
                .iter()
                .map(|id| {
                    (
                        super::OP_DROP_CAMPAIGN_DETAILS,
                        json!({"dropID": id, "channelLogin": channel_login}),
                    )
                })
                .collect();

            for data in self.post_gql_batch(requests).await? {
                details.push(
                    traverse_json(&data, ".user.dropCampaign")
                        .cloned()
                        .unwrap_or(Value::Null),
                );
            }
        }

        Ok(details)
    }

    /// Claims a drop. `true` when the reward is (already) owned.
    pub async fn claim_drop_rewards(&self, drop_instance_id: &str) -> Result<bool> {
        let data = self
            .post_gql(
                super::OP_CLAIM_DROP_REWARDS,
                json!({"input": {"dropInstanceID": drop_instance_id}}),
            )
            .await?;

        let status = traverse_json(&data, ".claimDropRewards.status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(matches!(
            status,
            "ELIGIBLE_FOR_ALL" | "DROP_INSTANCE_ALREADY_CLAIMED"
        ))
    }

    /// Top streams for a game category, with the drops-only tag filter when
    /// asked. One of the two operations Twitch only accepts inline.
    pub async fn get_top_streams_by_category(
        &self,
        slug: &str,
        limit: u32,
        drops_only: bool,
    ) -> Result<Vec<TopStream>> {
        let mut variables = json!({"slug": slug, "first": limit});
        if drops_only {
            variables["options"] = json!({"tags": [DROPS_TAG_ID]});
        }

        let data = self
            .post_gql(super::OP_DIRECTORY_PAGE_GAME, variables)
            .await?;

        if traverse_json(&data, ".game").map_or(true, Value::is_null) {
            return Err(eyre!("Category {slug} not found"));
        }

        let edges = traverse_json(&data, ".game.streams.edges")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut streams = Vec::with_capacity(edges.len());
        for edge in &edges {
            let node = edge.get("node").cloned().unwrap_or(Value::Null);
            let mut stream = TopStream {
                login: crate::utils::string_from_value(traverse_json(&node, ".broadcaster.login")),
                channel_id: crate::utils::string_from_value(traverse_json(
                    &node,
                    ".broadcaster.id",
                )),
                display_name: crate::utils::string_from_value(traverse_json(
                    &node,
                    ".broadcaster.displayName",
                )),
                viewers_count: crate::utils::int_from_value(node.get("viewersCount")),
                ..Default::default()
            };
            if let Some(game) = node.get("game").filter(|v| !v.is_null()) {
                stream.game_id = crate::utils::string_from_value(game.get("id"));
                stream.game_name = crate::utils::string_from_value(game.get("displayName"));
                stream.game_slug = crate::utils::string_from_value(game.get("slug"));
            }

            if stream.channel_id.is_empty() {
                if stream.login.is_empty() {
                    continue;
                }
                match self.get_user_id(&stream.login).await {
                    Ok(id) => stream.channel_id = id,
                    Err(_) => continue,
                }
            }

            streams.push(stream);
        }

        Ok(streams)
    }

    /// Looks up a game slug by id. The second inline-only operation.
    pub async fn get_game_slug(&self, game_id: &str) -> Result<String> {
        let data = self
            .post_gql(super::OP_GAME_BY_ID, json!({"id": game_id}))
            .await?;
        traverse_json(&data, ".game.slug")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| eyre!("No slug for game {game_id}"))
    }

    pub async fn get_user_points_contribution(
        &self,
        login: &str,
    ) -> Result<Vec<GoalContribution>> {
        let data = self
            .post_gql(
                super::OP_USER_POINTS_CONTRIBUTION,
                json!({"channelLogin": login}),
            )
            .await?;

        Ok(traverse_json(
            &data,
            ".community.channel.self.communityPoints.goalContributions",
        )
        .and_then(|v| v.as_array())
        .map(|contributions| {
            contributions
                .iter()
                .map(|c| GoalContribution {
                    goal_id: crate::utils::string_from_value(traverse_json(c, ".goal.id")),
                    user_points_contributed_this_stream: crate::utils::int_from_value(
                        c.get("userPointsContributedThisStream"),
                    ),
                })
                .collect()
        })
        .unwrap_or_default())
    }

    pub async fn contribute_to_community_goal(
        &self,
        goal_id: &str,
        channel_id: &str,
        amount: u64,
    ) -> Result<()> {
        self.post_gql(
            super::OP_CONTRIBUTE_COMMUNITY_GOAL,
            json!({"input": {
                "amount": amount,
                "channelID": channel_id,
                "goalID": goal_id,
                "transactionID": generate_hex(16),
            }}),
        )
        .await
        .context("ContributeCommunityPointsCommunityGoal")?;
        Ok(())
    }

    pub async fn check_viewer_is_mod(&self, login: &str) -> Result<bool> {
        let data = self
            .post_gql(super::OP_MOD_VIEW_CHANNEL, json!({"channelLogin": login}))
            .await?;
        Ok(traverse_json(&data, ".user.self.isModerator")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }
}

/// Extracts `window.__twilightBuildID = "<uuid>"` from the homepage HTML.
fn parse_build_id(body: &str) -> Option<String> {
    let (_, after) = body.split_once("window.__twilightBuildID")?;
    let (_, after) = after.split_once('"')?;
    let (id, _) = after.split_once('"')?;
    let uuid_shaped = id.len() == 36
        && id
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-');
    uuid_shaped.then(|| id.to_owned())
}
