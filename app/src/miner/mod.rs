//! The per-account mining orchestrator. Wires auth, GQL, the PubSub pool,
//! the message router, the prediction engine and the periodic tasks under
//! one cancellable scope.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use color_eyre::eyre::{Context, Result};
use common::config::AccountConfig;
use common::model::prediction::EventPrediction;
use common::model::streamer::{should_join_chat, Streamer};
use common::model::topic::{PubSubTopic, TopicKind};
use common::model::{Event, Priority};
use common::twitch::api::TwitchApi;
use common::twitch::auth::Authenticator;
use common::twitch::ws::{self, PubSubPool};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::ChatManager;
use crate::notify::Dispatcher;
use crate::watcher::CategoryWatcher;

pub mod campaigns;
pub mod handler;
pub mod manager;
pub mod predictions;
pub mod scheduler;

/// Width of the startup worker pools (resolve, points context, online check).
const STARTUP_WORKERS: usize = 5;

pub struct Miner {
    pub cfg: AccountConfig,
    pub api: TwitchApi,
    pub pubsub: Mutex<PubSubPool>,
    pub chat: ChatManager,
    pub notify: Dispatcher,
    pub cancel: CancellationToken,
    pub simulate: bool,

    running: AtomicBool,
    priorities: Vec<Priority>,

    pub(crate) streamers: RwLock<Vec<Arc<Streamer>>>,
    pub(crate) predictions: Mutex<HashMap<String, Arc<Mutex<EventPrediction>>>>,
    pub(crate) pending_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub(crate) last_watching: Mutex<HashSet<String>>,
}

impl Miner {
    /// Builds a miner for one account. No I/O happens until [`Miner::run`].
    pub fn new(cfg: AccountConfig, simulate: bool, cancel: CancellationToken) -> Arc<Miner> {
        let auth = Arc::new(Authenticator::new(
            &cfg.username,
            cfg.auth_config(),
            std::env::var("DATA_DIR").ok().map(std::path::PathBuf::from).as_deref(),
        ));
        let api = TwitchApi::new(Arc::clone(&auth));
        let pubsub = Mutex::new(PubSubPool::new(auth, cancel.clone()));
        let notify = Dispatcher::new(&cfg.username, cfg.notifications.clone(), cancel.clone());
        let priorities = cfg.priorities();

        Arc::new(Miner {
            cfg,
            api,
            pubsub,
            chat: ChatManager::new(),
            notify,
            cancel,
            simulate,
            running: AtomicBool::new(false),
            priorities,
            streamers: RwLock::new(Vec::new()),
            predictions: Mutex::new(HashMap::new()),
            pending_timers: Mutex::new(HashMap::new()),
            last_watching: Mutex::new(HashSet::new()),
        })
    }

    pub fn username(&self) -> &str {
        &self.cfg.username
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn priorities(&self) -> &[Priority] {
        &self.priorities
    }

    /// Snapshot of the tracked streamer list.
    pub fn streamers(&self) -> Vec<Arc<Streamer>> {
        self.streamers.read().unwrap().clone()
    }

    /// Logs an event and forwards it to the notify sinks.
    pub fn emit(&self, event: Event, message: impl Into<String>) {
        let message = message.into();
        info!(account = %self.cfg.username, event = %event, "{message}");
        self.notify.notify(event, message);
    }

    /// The full account lifecycle: login, startup resolution, topic
    /// subscription, then the long-lived task tree until cancellation.
    pub async fn run(self: Arc<Miner>) -> Result<()> {
        let start = Instant::now();
        info!(account = %self.cfg.username, "Starting miner");

        self.api
            .auth()
            .login()
            .await
            .wrap_err_with(|| format!("Login failed for {}", self.cfg.username))?;
        info!(account = %self.cfg.username, "Logged in");

        if self.cfg.features.claim_drops_startup {
            info!(account = %self.cfg.username, "Claiming pending drops from inventory");
            if let Err(err) = campaigns::claim_all_drops_from_inventory(&self).await {
                warn!("Failed to claim drops on startup: {err:#}");
            }
        }

        self.api.gql().set_startup_mode();
        if let Err(err) = manager::resolve_streamers(&self).await {
            self.api.gql().set_normal_mode();
            return Err(err.wrap_err("Resolving streamers"));
        }

        let merged_rx = {
            let mut pool = self.pubsub.lock().unwrap();
            pool.take_messages()
        };
        self.subscribe_all_topics()
            .context("Subscribing to PubSub topics")?;

        self.join_initial_chats();

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        {
            let miner = Arc::clone(&self);
            tasks.spawn(async move { handler::route_loop(miner, merged_rx).await });
        }

        {
            let miner = Arc::clone(&self);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                ws::health_monitor(move || miner.pubsub.lock().unwrap().connections(), cancel)
                    .await;
                Ok(())
            });
        }

        {
            let miner = Arc::clone(&self);
            tasks.spawn(async move {
                miner.load_all_channel_points_context().await;
                miner.api.gql().set_normal_mode();
                Ok(())
            });
        }

        {
            let miner = Arc::clone(&self);
            tasks.spawn(async move {
                miner.check_all_streamers_online().await;
                Ok(())
            });
        }

        {
            let miner = Arc::clone(&self);
            tasks.spawn(async move { scheduler::run_minute_watcher(miner).await });
        }

        {
            let miner = Arc::clone(&self);
            tasks.spawn(async move { campaigns::run_campaign_sync(miner).await });
        }

        {
            let miner = Arc::clone(&self);
            tasks.spawn(async move { scheduler::run_context_refresh(miner).await });
        }

        {
            let miner = Arc::clone(&self);
            tasks.spawn(async move { scheduler::run_online_monitor(miner).await });
        }

        if self.cfg.category_watcher.enabled && !self.cfg.category_watcher.categories.is_empty() {
            let watcher = CategoryWatcher::new(&self.cfg);
            let miner = Arc::clone(&self);
            tasks.spawn(async move { watcher.run(miner).await });
        }

        self.running.store(true, Ordering::Relaxed);
        info!(
            account = %self.cfg.username,
            streamers = self.streamers.read().unwrap().len(),
            pubsub_topics = self.pubsub.lock().unwrap().total_topic_count(),
            startup = ?start.elapsed(),
            "Miner fully started"
        );

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    if !self.cancel.is_cancelled() {
                        result = Err(err);
                        self.cancel.cancel();
                    }
                }
                Err(err) if err.is_panic() => {
                    result = Err(color_eyre::eyre::eyre!("Miner task panicked: {err}"));
                    self.cancel.cancel();
                }
                Err(_) => continue,
            }
        }

        self.running.store(false, Ordering::Relaxed);
        self.stop_pending_timers();
        result
    }

    /// Stops and drops every scheduled bet timer. Called on shutdown.
    pub fn stop_pending_timers(&self) {
        let mut timers = self.pending_timers.lock().unwrap();
        for (_, timer) in timers.drain() {
            timer.abort();
        }
    }

    /// Every topic the account subscribes to: the user community-points
    /// topic, the user predictions topic when any streamer bets, plus each
    /// streamer's derived topic set.
    fn subscribe_all_topics(&self) -> Result<()> {
        let user_id = self.api.auth().user_id();
        let streamers = self.streamers();

        let mut topics = vec![PubSubTopic::user(TopicKind::CommunityPointsUser, &user_id)];

        if streamers
            .iter()
            .any(|s| s.read().settings.make_predictions)
        {
            topics.push(PubSubTopic::user(TopicKind::PredictionsUser, &user_id));
        }

        for streamer in &streamers {
            topics.extend(streamer_topics(streamer));
        }

        self.pubsub
            .lock()
            .unwrap()
            .subscribe(&topics)
            .map_err(|err| color_eyre::eyre::eyre!("{err:#}"))
    }

    fn join_initial_chats(&self) {
        for streamer in self.streamers() {
            let (presence, online) = {
                let state = streamer.read();
                (state.settings.chat, state.is_online)
            };
            if should_join_chat(presence, online) {
                self.chat.join(&streamer.login);
            }
        }
    }

    /// Loads the channel points context for every streamer with a bounded
    /// worker pool.
    async fn load_all_channel_points_context(&self) {
        let streamers = self.streamers();
        if streamers.is_empty() {
            return;
        }

        info!(
            count = streamers.len(),
            workers = STARTUP_WORKERS,
            "Loading channel points context"
        );

        let sem = Arc::new(Semaphore::new(STARTUP_WORKERS));
        let mut pool = JoinSet::new();
        for streamer in streamers {
            if self.cancel.is_cancelled() {
                break;
            }
            let sem = Arc::clone(&sem);
            let api = self.api.clone();
            pool.spawn(async move {
                let _permit = sem.acquire().await;
                if let Err(err) = api.load_channel_points_context(&streamer).await {
                    warn!(streamer = %streamer.login, "Failed to load channel points context: {err:#}");
                    return;
                }
                let state = streamer.read();
                if state.is_online {
                    info!(
                        streamer = %streamer.login,
                        balance = state.channel_points,
                        "Channel points loaded"
                    );
                } else {
                    debug!(
                        streamer = %streamer.login,
                        balance = state.channel_points,
                        "Offline"
                    );
                }
            });
        }
        while pool.join_next().await.is_some() {}
        info!("Channel points context loaded");
    }

    /// Checks the initial online state of every streamer with a bounded
    /// worker pool.
    async fn check_all_streamers_online(&self) {
        let streamers = self.streamers();
        if streamers.is_empty() {
            return;
        }

        info!(
            count = streamers.len(),
            workers = STARTUP_WORKERS,
            "Checking initial online status"
        );

        let sem = Arc::new(Semaphore::new(STARTUP_WORKERS));
        let mut pool = JoinSet::new();
        for streamer in streamers {
            if self.cancel.is_cancelled() {
                break;
            }
            let sem = Arc::clone(&sem);
            let api = self.api.clone();
            pool.spawn(async move {
                let _permit = sem.acquire().await;
                if let Err(err) = api.check_streamer_online(&streamer).await {
                    debug!(streamer = %streamer.login, "Failed to check online status: {err:#}");
                    return false;
                }
                let state = streamer.read();
                if state.is_online {
                    info!(
                        streamer = %streamer.login,
                        category = %state.resolve_category(),
                        viewers = state.stream.viewers_count,
                        "Online"
                    );
                }
                state.is_online
            });
        }

        let mut online = 0usize;
        let mut offline = 0usize;
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(true) => online += 1,
                Ok(false) => offline += 1,
                Err(_) => {}
            }
        }
        info!(online, offline, "Initial online status check complete");
    }
}

/// The topic set derived from one streamer's settings. Video playback is
/// unconditional; the rest follow the feature toggles.
pub fn streamer_topics(streamer: &Arc<Streamer>) -> Vec<PubSubTopic> {
    let state = streamer.read();
    let channel = |kind| PubSubTopic::channel(kind, &streamer.channel_id, &streamer.login);

    let mut topics = vec![channel(TopicKind::VideoPlayback)];
    if state.settings.follow_raid {
        topics.push(channel(TopicKind::Raid));
    }
    if state.settings.make_predictions {
        topics.push(channel(TopicKind::PredictionsChannel));
    }
    if state.settings.claim_moments {
        topics.push(channel(TopicKind::CommunityMoments));
    }
    if state.settings.community_goals {
        topics.push(channel(TopicKind::CommunityPointsChannel));
    }
    topics
}
