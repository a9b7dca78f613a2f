//! Routes decoded PubSub messages to handlers keyed by topic kind and inner
//! message type. The router is the single consumer of the pool's merged
//! channel, so handler invocations are serialized.

use std::sync::Arc;

use color_eyre::eyre::Result;
use common::model::goal::CommunityGoal;
use common::model::message::Message;
use common::model::streamer::{should_join_chat, Raid, Streamer};
use common::model::Event;
use common::utils::{int_from_value, millify, string_from_value};
use flume::Receiver;
use tracing::{debug, warn};

use super::Miner;

/// Consumes the merged PubSub stream until cancellation or channel close.
pub async fn route_loop(miner: Arc<Miner>, messages: Receiver<Message>) -> Result<()> {
    loop {
        let msg = tokio::select! {
            _ = miner.cancel.cancelled() => return Ok(()),
            msg = messages.recv_async() => match msg {
                Ok(msg) => msg,
                Err(_) => return Ok(()),
            },
        };

        Arc::clone(&miner).handle_message(msg).await;
    }
}

impl Miner {
    pub(crate) async fn handle_message(self: Arc<Self>, mut msg: Message) {
        let streamer = self.get_streamer_by_channel_id(&msg.channel_id);

        match msg.topic.as_str() {
            "community-points-user-v1" => self.handle_community_points(&msg, streamer).await,
            "video-playback-by-id" => self.handle_video_playback(&msg, streamer).await,
            "predictions-channel-v1" => {
                super::predictions::handle_predictions_channel(&self, &msg, streamer).await
            }
            "predictions-user-v1" => {
                super::predictions::handle_predictions_user(&self, &msg, streamer).await
            }
            "raid" => self.handle_raid(&msg, streamer).await,
            "community-moments-channel-v1" => self.handle_community_moments(&msg, streamer).await,
            "community-points-channel-v1" => self.handle_community_goals(&msg, streamer),
            other => debug!(topic = other, msg_type = %msg.msg_type, "Unhandled PubSub topic"),
        }

        // Handlers have extracted what they need; release the decoded
        // payload before the next message arrives.
        msg.raw = None;
    }

    async fn handle_community_points(&self, msg: &Message, streamer: Option<Arc<Streamer>>) {
        match msg.msg_type.as_str() {
            "points-earned" | "points-spent" => self.handle_points_update(msg, streamer),
            "claim-available" => self.handle_claim_available(msg, streamer).await,
            other => debug!(msg_type = other, "Unhandled community-points message type"),
        }
    }

    fn handle_points_update(&self, msg: &Message, streamer: Option<Arc<Streamer>>) {
        let balance = msg
            .data_get("balance")
            .map(|b| int_from_value(b.get("balance")))
            .unwrap_or(0);

        let Some(streamer) = streamer else { return };
        if balance > 0 {
            streamer.write().channel_points = balance;
        }

        if msg.msg_type != "points-earned" {
            return;
        }
        let Some(point_gain) = msg.data_get("point_gain") else {
            return;
        };

        let earned = int_from_value(point_gain.get("total_points")) as i64;
        let reason_code = string_from_value(point_gain.get("reason_code"));

        let current_balance = {
            let mut state = streamer.write();
            state.update_history(&reason_code, earned, 1);
            state.channel_points
        };

        self.emit(
            Event::from_reason_code(&reason_code),
            format!(
                "{}: +{} points ({reason_code}, balance {})",
                streamer.login,
                millify(earned, 2),
                millify(current_balance as i64, 2)
            ),
        );
    }

    /// Claim-available carries a claim id; the claim call is idempotent on
    /// the Twitch side, so a duplicate delivery is harmless.
    async fn handle_claim_available(&self, msg: &Message, streamer: Option<Arc<Streamer>>) {
        let Some(streamer) = streamer else { return };
        let claim_id = msg
            .data_get("claim")
            .map(|c| string_from_value(c.get("id")))
            .unwrap_or_default();
        if claim_id.is_empty() {
            return;
        }

        self.emit(
            Event::BonusClaim,
            format!("{}: claiming bonus", streamer.login),
        );
        if let Err(err) = self
            .api
            .gql()
            .claim_community_points(&claim_id, &streamer.channel_id)
            .await
        {
            warn!(streamer = %streamer.login, "Failed to claim bonus: {err:#}");
        }
    }

    async fn handle_video_playback(&self, msg: &Message, streamer: Option<Arc<Streamer>>) {
        let Some(streamer) = streamer else { return };
        match msg.msg_type.as_str() {
            "stream-up" => self.handle_stream_up(&streamer),
            "stream-down" => self.handle_stream_down(&streamer),
            "viewcount" => self.handle_viewcount(msg, &streamer).await,
            _ => {}
        }
    }

    fn handle_stream_up(&self, streamer: &Arc<Streamer>) {
        let category = {
            let mut state = streamer.write();
            state.stream_up_at = Some(std::time::Instant::now());
            state.resolve_category()
        };

        self.emit(
            Event::StreamerOnline,
            format!("{}: stream online ({category})", streamer.login),
        );
        self.update_chat_presence(streamer, true);
    }

    fn handle_stream_down(&self, streamer: &Arc<Streamer>) {
        let was_online = {
            let mut state = streamer.write();
            let was_online = state.is_online;
            state.set_offline();
            was_online
        };

        if was_online {
            self.emit(
                Event::StreamerOffline,
                format!("{}: stream went offline", streamer.login),
            );
        }
        self.update_chat_presence(streamer, false);
    }

    async fn handle_viewcount(&self, msg: &Message, streamer: &Arc<Streamer>) {
        let debounced = {
            let mut state = streamer.write();
            if let Some(raw) = &msg.raw {
                let viewers = int_from_value(raw.get("viewers"));
                if viewers > 0 {
                    state.stream.viewers_count = viewers;
                }
            }
            !state.stream_up_elapsed()
        };

        if debounced {
            return;
        }
        if let Err(err) = self.api.check_streamer_online(streamer).await {
            debug!(streamer = %streamer.login, "Online check on viewcount failed: {err:#}");
        }
    }

    async fn handle_raid(&self, msg: &Message, streamer: Option<Arc<Streamer>>) {
        let Some(streamer) = streamer else { return };
        if msg.msg_type != "raid_update_v2" {
            return;
        }
        if !streamer.read().settings.follow_raid {
            return;
        }

        let Some(raid) = msg.raw.as_ref().and_then(|r| r.get("raid")) else {
            return;
        };
        let raid_id = string_from_value(raid.get("id"));
        let target_login = string_from_value(raid.get("target_login"));
        if raid_id.is_empty() {
            return;
        }

        self.emit(
            Event::JoinRaid,
            format!("{}: joining raid to {target_login}", streamer.login),
        );

        streamer.write().raid = Some(Raid {
            raid_id: raid_id.clone(),
            target_login,
        });

        if let Err(err) = self.api.gql().join_raid(&raid_id).await {
            warn!(streamer = %streamer.login, raid_id, "Failed to join raid: {err:#}");
        }
    }

    async fn handle_community_moments(&self, msg: &Message, streamer: Option<Arc<Streamer>>) {
        let Some(streamer) = streamer else { return };
        if msg.msg_type != "active" {
            return;
        }
        if !streamer.read().settings.claim_moments {
            return;
        }

        let moment_id = string_from_value(msg.data_get("moment_id"));
        if moment_id.is_empty() {
            return;
        }

        self.emit(
            Event::MomentClaim,
            format!("{}: claiming moment", streamer.login),
        );
        if let Err(err) = self.api.gql().claim_moment(&moment_id).await {
            warn!(streamer = %streamer.login, moment_id, "Failed to claim moment: {err:#}");
        }
    }

    fn handle_community_goals(&self, msg: &Message, streamer: Option<Arc<Streamer>>) {
        let Some(streamer) = streamer else { return };
        if !streamer.read().settings.community_goals {
            return;
        }
        let Some(goal_data) = msg.data_get("community_goal") else {
            return;
        };

        match msg.msg_type.as_str() {
            "community-goal-created" | "community-goal-updated" => {
                let goal = CommunityGoal::from_pubsub(goal_data);
                if !goal.goal_id.is_empty() {
                    streamer
                        .write()
                        .community_goals
                        .insert(goal.goal_id.clone(), goal);
                }
            }
            "community-goal-deleted" => {
                let goal_id = string_from_value(goal_data.get("id"));
                if !goal_id.is_empty() {
                    streamer.write().community_goals.remove(&goal_id);
                }
            }
            _ => {}
        }
    }

    fn update_chat_presence(&self, streamer: &Arc<Streamer>, is_online: bool) {
        let presence = streamer.read().settings.chat;
        if should_join_chat(presence, is_online) {
            self.chat.join(&streamer.login);
        } else if self.chat.is_joined(&streamer.login) {
            self.chat.leave(&streamer.login);
        }
    }
}

#[cfg(test)]
mod test {
    use common::model::streamer::REASON_WATCH_STREAK;

    use super::super::test_support::{add_test_streamer, offline_miner};
    use super::*;

    fn message(topic: &str, inner: &str) -> Message {
        Message::parse(topic, inner).unwrap()
    }

    #[tokio::test]
    async fn points_earned_updates_balance_and_history() {
        let miner = offline_miner();
        let streamer = add_test_streamer(&miner, "a", "77");

        let inner = r#"{
            "type": "points-earned",
            "data": {
                "timestamp": "2024-06-01T12:00:00Z",
                "balance": {"channel_id": "77", "balance": 1510},
                "point_gain": {"total_points": 10, "reason_code": "WATCH"}
            }
        }"#;
        miner
            .clone()
            .handle_message(message("community-points-user-v1.9", inner))
            .await;

        let state = streamer.read();
        assert_eq!(state.channel_points, 1510);
        let entry = state.history["WATCH"];
        assert_eq!(entry.counter, 1);
        assert_eq!(entry.amount, 10);
    }

    #[tokio::test]
    async fn watch_streak_gain_clears_missing_flag() {
        let miner = offline_miner();
        let streamer = add_test_streamer(&miner, "a", "77");
        streamer.write().set_online();
        assert!(streamer.read().stream.watch_streak_missing);

        let inner = r#"{
            "type": "points-earned",
            "data": {
                "balance": {"channel_id": "77", "balance": 900},
                "point_gain": {"total_points": 300, "reason_code": "WATCH_STREAK"}
            }
        }"#;
        miner
            .clone()
            .handle_message(message("community-points-user-v1.9", inner))
            .await;

        let state = streamer.read();
        assert!(!state.stream.watch_streak_missing);
        assert_eq!(state.history[REASON_WATCH_STREAK].amount, 300);
    }

    #[tokio::test]
    async fn stream_down_only_fires_when_previously_online() {
        let miner = offline_miner();
        let streamer = add_test_streamer(&miner, "a", "5");
        streamer.write().set_online();

        miner
            .clone()
            .handle_message(message(
                "video-playback-by-id.5",
                r#"{"type":"stream-down","server_time":1700000000.0}"#,
            ))
            .await;
        assert!(!streamer.read().is_online);
        assert!(streamer.read().offline_at.is_some());

        // A second stream-down must not refresh the offline timestamp.
        let first_offline = streamer.read().offline_at;
        miner
            .clone()
            .handle_message(message(
                "video-playback-by-id.5",
                r#"{"type":"stream-down","server_time":1700000001.0}"#,
            ))
            .await;
        assert_eq!(streamer.read().offline_at, first_offline);
    }

    #[tokio::test]
    async fn stream_up_records_timestamp_and_joins_chat() {
        let miner = offline_miner();
        let streamer = add_test_streamer(&miner, "a", "5");
        streamer.write().set_online(); // chat policy ONLINE needs this

        miner
            .clone()
            .handle_message(message(
                "video-playback-by-id.5",
                r#"{"type":"stream-up","server_time":1700000000.0,"play_delay":0}"#,
            ))
            .await;

        assert!(streamer.read().stream_up_at.is_some());
        assert!(miner.chat.is_joined("a"));
    }

    #[tokio::test]
    async fn community_goal_lifecycle() {
        let miner = offline_miner();
        let streamer = add_test_streamer(&miner, "a", "5");
        streamer.write().settings.community_goals = true;

        let created = r#"{
            "type": "community-goal-created",
            "data": {"channel_id": "5", "community_goal": {
                "id": "g1", "title": "Emote", "is_in_stock": true,
                "points_contributed": 10, "goal_amount": 100, "status": "STARTED"
            }}
        }"#;
        miner
            .clone()
            .handle_message(message("community-points-channel-v1.5", created))
            .await;
        assert_eq!(streamer.read().community_goals["g1"].title, "Emote");

        let deleted = r#"{
            "type": "community-goal-deleted",
            "data": {"channel_id": "5", "community_goal": {"id": "g1"}}
        }"#;
        miner
            .clone()
            .handle_message(message("community-points-channel-v1.5", deleted))
            .await;
        assert!(streamer.read().community_goals.is_empty());
    }

    #[tokio::test]
    async fn messages_for_unknown_channels_are_dropped() {
        let miner = offline_miner();
        miner
            .clone()
            .handle_message(message(
                "video-playback-by-id.404",
                r#"{"type":"stream-up","server_time":1.0,"play_delay":0}"#,
            ))
            .await;
        // Nothing to assert beyond not panicking: state-model violations
        // are logged and dropped.
    }
}
