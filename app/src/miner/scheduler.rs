//! The watch-selection scheduler: every tick, pick at most two streamers by
//! the configured priority chain and send their minute-watched heartbeats.
//! Also hosts the slower periodic loops (online monitor, context refresh).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use common::model::streamer::Streamer;
use common::model::Priority;
use rand::Rng;
use tokio::time::{interval, sleep};
use tracing::{debug, info};

use super::Miner;

/// Heartbeat tick.
const MINUTE_WATCHED_INTERVAL: Duration = Duration::from_secs(20);
/// A streamer must have been online this long before it is watchable.
const ONLINE_ELIGIBILITY: Duration = Duration::from_secs(30);
/// At most this many streams are watched per tick.
const MAX_WATCH_STREAMS: usize = 2;
/// Context refresh cadence.
const CONTEXT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Selects up to `max_watch` streamers from the snapshot, applying each
/// priority rule in order until the slots are filled.
pub fn select_streamers_to_watch(
    streamers: &[Arc<Streamer>],
    priorities: &[Priority],
    max_watch: usize,
) -> Vec<Arc<Streamer>> {
    let eligible = streamers
        .iter()
        .enumerate()
        .filter(|(_, s)| {
            let state = s.read();
            state.is_online
                && state
                    .online_at
                    .map_or(true, |at| at.elapsed() > ONLINE_ELIGIBILITY)
        })
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    if eligible.is_empty() {
        return Vec::new();
    }

    let mut watching: Vec<usize> = Vec::new();
    let mut pick = |watching: &mut Vec<usize>, idx: usize| {
        if !watching.contains(&idx) && watching.len() < max_watch {
            watching.push(idx);
        }
    };

    for priority in priorities {
        if watching.len() >= max_watch {
            break;
        }

        match priority {
            Priority::Order => {
                for &idx in &eligible {
                    pick(&mut watching, idx);
                }
            }
            Priority::Streak => {
                for &idx in &eligible {
                    let state = streamers[idx].read();
                    let qualifies = state.settings.watch_streak
                        && state.stream.watch_streak_missing
                        && state
                            .offline_at
                            .map_or(true, |at| at.elapsed() > Duration::from_secs(30 * 60))
                        && state.stream.minute_watched < 7.0;
                    drop(state);
                    if qualifies {
                        pick(&mut watching, idx);
                    }
                }
            }
            Priority::Drops => {
                for &idx in &eligible {
                    if streamers[idx].read().drops_condition() {
                        pick(&mut watching, idx);
                    }
                }
            }
            Priority::Subscribed => {
                let mut with_multiplier = eligible
                    .iter()
                    .filter_map(|&idx| {
                        let state = streamers[idx].read();
                        state
                            .has_points_multiplier()
                            .then(|| (idx, state.total_points_multiplier()))
                    })
                    .collect::<Vec<_>>();
                with_multiplier
                    .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                for (idx, _) in with_multiplier {
                    pick(&mut watching, idx);
                }
            }
            Priority::PointsAscending | Priority::PointsDescending => {
                let mut by_points = eligible
                    .iter()
                    .map(|&idx| (idx, streamers[idx].read().channel_points))
                    .collect::<Vec<_>>();
                match priority {
                    Priority::PointsAscending => by_points.sort_by_key(|&(_, points)| points),
                    _ => by_points.sort_by_key(|&(_, points)| std::cmp::Reverse(points)),
                }
                for (idx, _) in by_points {
                    pick(&mut watching, idx);
                }
            }
        }
    }

    watching
        .into_iter()
        .take(max_watch)
        .map(|idx| Arc::clone(&streamers[idx]))
        .collect()
}

/// The 20-second heartbeat loop. Per-streamer failures are swallowed; the
/// tick continues with the next selection.
pub async fn run_minute_watcher(miner: Arc<Miner>) -> Result<()> {
    let mut ticker = interval(MINUTE_WATCHED_INTERVAL);

    loop {
        tokio::select! {
            _ = miner.cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let streamers = miner.streamers();
        let to_watch =
            select_streamers_to_watch(&streamers, miner.priorities(), MAX_WATCH_STREAMS);

        log_watching_changes(&miner, &to_watch);

        for streamer in &to_watch {
            if miner.cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(err) = miner.api.send_minute_watched(streamer).await {
                debug!(streamer = %streamer.login, "Minute watched failed: {err:#}");
                continue;
            }
            log_drop_progress(&miner, streamer);
        }
    }
}

/// Diffs the selection against the previous tick and logs started/stopped
/// watches.
fn log_watching_changes(miner: &Miner, to_watch: &[Arc<Streamer>]) {
    let current = to_watch
        .iter()
        .map(|s| s.login.clone())
        .collect::<HashSet<_>>();

    let mut last = miner.last_watching.lock().unwrap();
    for login in current.iter() {
        if !last.contains(login) {
            info!(streamer = %login, "Watching");
        }
    }
    for login in last.iter() {
        if !current.contains(login) {
            info!(streamer = %login, "Stopped watching");
        }
    }
    *last = current;
}

fn log_drop_progress(miner: &Miner, streamer: &Arc<Streamer>) {
    let state = streamer.read();
    for campaign in &state.stream.campaigns {
        for drop in &campaign.drops {
            if drop.has_preconditions_met == Some(false) {
                continue;
            }
            if drop.is_printable {
                miner.emit(
                    common::model::Event::DropStatus,
                    format!(
                        "{}: {campaign} {drop} {}",
                        streamer.login,
                        drop.progress_bar()
                    ),
                );
            }
        }
    }
}

/// Re-checks every streamer's online state on a jittered 20-60s cadence.
pub async fn run_online_monitor(miner: Arc<Miner>) -> Result<()> {
    loop {
        let wait = Duration::from_secs(20 + rand::thread_rng().gen_range(0..40));
        tokio::select! {
            _ = miner.cancel.cancelled() => return Ok(()),
            _ = sleep(wait) => {}
        }

        for streamer in miner.streamers() {
            if miner.cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(err) = miner.api.check_streamer_online(&streamer).await {
                debug!(streamer = %streamer.login, "Online check failed: {err:#}");
            }
        }
    }
}

/// Periodically reloads the channel points context of online streamers so
/// balances and multipliers cannot drift.
pub async fn run_context_refresh(miner: Arc<Miner>) -> Result<()> {
    let mut ticker = interval(CONTEXT_REFRESH_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = miner.cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        for streamer in miner.streamers() {
            if miner.cancel.is_cancelled() {
                return Ok(());
            }
            if !streamer.read().is_online {
                continue;
            }
            if let Err(err) = miner.api.load_channel_points_context(&streamer).await {
                debug!(streamer = %streamer.login, "Context refresh failed: {err:#}");
            }
        }
    }
}
