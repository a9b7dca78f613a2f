//! Streamer-set management: the tracked collection, the derived topic
//! graph, and initial resolution of configured logins and followers.

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use common::model::streamer::Streamer;
use common::remove_duplicates_in_place;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{streamer_topics, Miner, STARTUP_WORKERS};

impl Miner {
    pub(crate) fn get_streamer_by_channel_id(&self, channel_id: &str) -> Option<Arc<Streamer>> {
        self.streamers
            .read()
            .unwrap()
            .iter()
            .find(|s| s.channel_id == channel_id)
            .cloned()
    }

    pub(crate) fn get_streamer_by_login(&self, login: &str) -> Option<Arc<Streamer>> {
        self.streamers
            .read()
            .unwrap()
            .iter()
            .find(|s| s.login.eq_ignore_ascii_case(login))
            .cloned()
    }

    /// Appends a streamer and subscribes its topic set.
    pub fn add_streamer(&self, streamer: Arc<Streamer>) {
        {
            let mut streamers = self.streamers.write().unwrap();
            if streamers
                .iter()
                .any(|s| s.login.eq_ignore_ascii_case(&streamer.login))
            {
                warn!(streamer = %streamer.login, "Already tracked, not adding twice");
                return;
            }
            streamers.push(Arc::clone(&streamer));
        }

        let topics = streamer_topics(&streamer);
        if let Err(err) = self.pubsub.lock().unwrap().subscribe(&topics) {
            warn!(
                streamer = %streamer.login,
                "Failed to subscribe topics for new streamer: {err:#}"
            );
        }

        if !streamer.read().is_category_watched {
            info!(
                streamer = %streamer.login,
                channel_id = %streamer.channel_id,
                "Added"
            );
        }
    }

    /// Removes a streamer: list first (under the write lock), then its
    /// PubSub topics and chat presence.
    pub fn remove_streamer(&self, login: &str, reason: &str) {
        let removed = {
            let mut streamers = self.streamers.write().unwrap();
            match streamers
                .iter()
                .position(|s| s.login.eq_ignore_ascii_case(login))
            {
                Some(i) => streamers.remove(i),
                None => {
                    warn!(streamer = login, "Not found for removal");
                    return;
                }
            }
        };

        self.pubsub.lock().unwrap().unsubscribe_streamer(&removed);

        if self.chat.is_joined(&removed.login) {
            self.chat.leave(&removed.login);
        }

        let category = removed.read().category_slug.clone();
        match (reason.is_empty(), category) {
            (false, Some(category)) => {
                info!(streamer = %removed.login, reason, category, "Removed")
            }
            (false, None) => info!(streamer = %removed.login, reason, "Removed"),
            (true, _) => info!(streamer = %removed.login, "Removed"),
        }
    }
}

/// Resolves channel ids for the configured streamer list plus the optional
/// followers expansion, with a bounded worker pool. Input order survives via
/// index tagging; logins that resolve empty are dropped with a warning.
pub async fn resolve_streamers(miner: &Arc<Miner>) -> Result<()> {
    let defaults = miner.cfg.streamer_defaults();

    let blacklist = miner
        .cfg
        .blacklist
        .iter()
        .map(|b| b.to_lowercase())
        .collect::<Vec<_>>();

    let mut logins = Vec::new();
    let mut settings_map = HashMap::new();
    for entry in &miner.cfg.streamers {
        let login = entry.username.trim().to_lowercase();
        if login.is_empty() || blacklist.contains(&login) {
            continue;
        }
        if let Some(settings) = &entry.settings {
            settings_map.insert(login.clone(), settings.clone());
        }
        logins.push(login);
    }

    if miner.cfg.followers.enabled {
        match miner
            .api
            .gql()
            .get_followed_streamers(100, miner.cfg.followers.order)
            .await
        {
            Ok(followers) => {
                info!(count = followers.len(), "Loaded followers");
                for follower in followers {
                    let follower = follower.to_lowercase();
                    if !blacklist.contains(&follower) {
                        logins.push(follower);
                    }
                }
            }
            Err(err) => warn!("Failed to load followers: {err:#}"),
        }
    }

    let logins = remove_duplicates_in_place(logins, |a, b| a == b);

    info!(
        count = logins.len(),
        workers = STARTUP_WORKERS,
        "Resolving channel ids"
    );

    let sem = Arc::new(Semaphore::new(STARTUP_WORKERS));
    let mut pool: JoinSet<Option<(usize, Arc<Streamer>)>> = JoinSet::new();

    for (idx, login) in logins.iter().cloned().enumerate() {
        if miner.cancel.is_cancelled() {
            break;
        }

        let sem = Arc::clone(&sem);
        let api = miner.api.clone();
        let settings = settings_map
            .get(&login)
            .map(|overlay| overlay.overlay(&defaults))
            .unwrap_or_else(|| defaults.clone());

        pool.spawn(async move {
            let _permit = sem.acquire().await;

            let channel_id = match api.gql().get_user_id(&login).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(streamer = login, "Failed to resolve channel id, skipping: {err:#}");
                    return None;
                }
            };
            if channel_id.is_empty() {
                warn!(streamer = login, "Empty channel id, skipping");
                return None;
            }

            debug!(streamer = login, channel_id, "Resolved");
            Some((
                idx,
                Arc::new(Streamer::new(login, channel_id).with_settings(settings)),
            ))
        });
    }

    let mut by_index: HashMap<usize, Arc<Streamer>> = HashMap::new();
    while let Some(joined) = pool.join_next().await {
        if let Ok(Some((idx, streamer))) = joined {
            by_index.insert(idx, streamer);
        }
    }

    let resolved = (0..logins.len())
        .filter_map(|i| by_index.remove(&i))
        .collect::<Vec<_>>();

    if resolved.is_empty() && !miner.cfg.category_watcher.enabled {
        return Err(eyre!(
            "No streamers could be resolved for account {}",
            miner.cfg.username
        ));
    }

    info!(count = resolved.len(), "Streamers resolved");
    *miner.streamers.write().unwrap() = resolved;
    Ok(())
}

#[cfg(test)]
mod test {
    use common::model::streamer::StreamerSettings;

    use super::super::test_support::{add_test_streamer, offline_miner};
    use super::*;

    #[tokio::test]
    async fn add_rejects_case_insensitive_duplicates() {
        let miner = offline_miner();
        add_test_streamer(&miner, "somebody", "1");

        miner.add_streamer(Arc::new(Streamer::new("SomeBody", "1")));
        assert_eq!(miner.streamers().len(), 1);
    }

    #[tokio::test]
    async fn add_and_remove_round_trip_topics() {
        let miner = offline_miner();
        let streamer =
            Arc::new(Streamer::new("a", "42").with_settings(StreamerSettings::default()));

        miner.add_streamer(Arc::clone(&streamer));
        let expected = streamer_topics(&streamer).len();
        assert_eq!(miner.pubsub.lock().unwrap().total_topic_count(), expected);
        assert_eq!(miner.streamers().len(), 1);

        miner.remove_streamer("A", "test_reason");
        assert!(miner.streamers().is_empty());
        assert_eq!(miner.pubsub.lock().unwrap().total_topic_count(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_is_a_noop() {
        let miner = offline_miner();
        miner.remove_streamer("ghost", "");
        assert!(miner.streamers().is_empty());
    }

    #[tokio::test]
    async fn lookup_by_channel_id_and_login() {
        let miner = offline_miner();
        add_test_streamer(&miner, "aaa", "100");
        add_test_streamer(&miner, "bbb", "200");

        assert_eq!(
            miner.get_streamer_by_channel_id("200").unwrap().login,
            "bbb"
        );
        assert!(miner.get_streamer_by_channel_id("300").is_none());
        assert_eq!(miner.get_streamer_by_login("AAA").unwrap().channel_id, "100");
    }
}
