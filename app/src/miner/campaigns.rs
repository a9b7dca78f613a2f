//! Drop campaign synchronization: reconciles dashboard campaigns against
//! the user's inventory, auto-claims finished drops and attaches matching
//! campaigns to streamers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::eyre::{Context, Result};
use common::model::campaign::{Campaign, Drop};
use common::model::stream::GameInfo;
use common::model::streamer::Streamer;
use common::model::Event;
use common::utils::{bool_from_value, int_from_value, string_from_value};
use rand::Rng;
use serde_json::Value;
use tokio::time::{interval, sleep};
use tracing::{debug, warn};

use super::Miner;

const CAMPAIGN_SYNC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// The periodic sync loop. Idles forever when no streamer mines drops.
pub async fn run_campaign_sync(miner: Arc<Miner>) -> Result<()> {
    let any_drops = miner
        .streamers()
        .iter()
        .any(|s| s.read().settings.claim_drops);
    if !any_drops {
        miner.cancel.cancelled().await;
        return Ok(());
    }

    if let Err(err) = sync_campaigns(&miner).await {
        warn!("Initial campaign sync failed: {err:#}");
    }

    let mut ticker = interval(CAMPAIGN_SYNC_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = miner.cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        if let Err(err) = sync_campaigns(&miner).await {
            if miner.cancel.is_cancelled() {
                return Ok(());
            }
            warn!("Campaign sync failed: {err:#}");
        }
    }
}

/// One full reconciliation: claim pending inventory drops, fetch active
/// dashboard campaigns, batch-load their details, fold in inventory
/// progress and attach the survivors to qualifying streamers.
pub async fn sync_campaigns(miner: &Arc<Miner>) -> Result<()> {
    if let Err(err) = claim_all_drops_from_inventory(miner).await {
        warn!("Failed to claim drops from inventory: {err:#}");
    }

    let dashboard = miner
        .api
        .gql()
        .get_drops_dashboard(Some("ACTIVE"))
        .await
        .context("Getting drops dashboard")?;
    if dashboard.is_empty() {
        return Ok(());
    }

    let campaign_ids = dashboard
        .iter()
        .filter_map(|c| c.get("id").and_then(|v| v.as_str()))
        .map(str::to_owned)
        .collect::<Vec<_>>();

    let details = miner
        .api
        .gql()
        .get_drop_campaign_details_batch(&campaign_ids, miner.username())
        .await
        .context("Getting campaign details")?;

    let mut campaigns = details
        .iter()
        .filter(|raw| !raw.is_null())
        .filter_map(|raw| parse_campaign(raw))
        .filter_map(|mut campaign| {
            if !campaign.is_within_time_window {
                return None;
            }
            campaign.clear_drops();
            (!campaign.drops.is_empty()).then_some(campaign)
        })
        .collect::<Vec<_>>();

    if let Err(err) = sync_with_inventory(miner, &mut campaigns).await {
        warn!("Failed to sync campaigns with inventory: {err:#}");
    }

    for streamer in miner.streamers() {
        let mut state = streamer.write();
        if state.drops_condition() {
            let matching = campaigns
                .iter()
                .filter(|c| !c.drops.is_empty() && campaign_matches_streamer(c, &state))
                .cloned()
                .collect::<Vec<_>>();
            state.stream.campaigns = matching;
        }
    }

    Ok(())
}

/// Folds inventory progress into the campaign list and claims every drop
/// that became claimable.
async fn sync_with_inventory(miner: &Arc<Miner>, campaigns: &mut [Campaign]) -> Result<()> {
    let inventory = miner
        .api
        .gql()
        .get_drops_inventory()
        .await
        .context("Getting inventory")?;
    let Some(in_progress) = inventory
        .get("dropCampaignsInProgress")
        .and_then(|v| v.as_array())
    else {
        return Ok(());
    };

    for campaign in campaigns.iter_mut() {
        campaign.clear_drops();
        let Some(progress) = in_progress
            .iter()
            .find(|p| p.get("id").and_then(|v| v.as_str()) == Some(campaign.id.as_str()))
        else {
            continue;
        };
        campaign.in_inventory = true;

        let time_based = progress
            .get("timeBasedDrops")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for time_drop in &time_based {
            let drop_id = string_from_value(time_drop.get("id"));
            let Some(own) = time_drop.get("self").filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(drop) = campaign.drops.iter_mut().find(|d| d.id == drop_id) else {
                continue;
            };

            drop.update(
                bool_from_value(own.get("hasPreconditionsMet")),
                int_from_value(own.get("currentMinutesWatched")),
                string_from_value(own.get("dropInstanceID")),
                bool_from_value(own.get("isClaimed")),
            );

            if drop.is_claimable {
                miner.emit(Event::DropClaim, format!("Claiming drop {drop}"));
                match miner
                    .api
                    .gql()
                    .claim_drop_rewards(&drop.drop_instance_id)
                    .await
                {
                    Ok(claimed) => drop.is_claimed = claimed,
                    Err(err) => warn!(drop = %drop.name, "Failed to claim drop: {err:#}"),
                }
            }
        }
        campaign.clear_drops();
    }

    Ok(())
}

/// Claims every unclaimed drop sitting in the inventory, with a small
/// randomized delay between claims.
pub async fn claim_all_drops_from_inventory(miner: &Arc<Miner>) -> Result<()> {
    let inventory = miner
        .api
        .gql()
        .get_drops_inventory()
        .await
        .context("Getting inventory")?;
    let Some(in_progress) = inventory
        .get("dropCampaignsInProgress")
        .and_then(|v| v.as_array())
    else {
        return Ok(());
    };

    for campaign in in_progress {
        let time_based = campaign
            .get("timeBasedDrops")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for drop in &time_based {
            let Some(own) = drop.get("self").filter(|v| !v.is_null()) else {
                continue;
            };
            let instance_id = string_from_value(own.get("dropInstanceID"));
            if bool_from_value(own.get("isClaimed")) || instance_id.is_empty() {
                continue;
            }

            let name = string_from_value(drop.get("name"));
            miner.emit(
                Event::DropClaim,
                format!("Claiming drop {name} from inventory"),
            );
            if let Err(err) = miner.api.gql().claim_drop_rewards(&instance_id).await {
                warn!(drop = name, "Failed to claim drop from inventory: {err:#}");
            }

            let pause = Duration::from_secs(5 + rand::thread_rng().gen_range(0..5));
            tokio::select! {
                _ = miner.cancel.cancelled() => return Ok(()),
                _ = sleep(pause) => {}
            }
        }
    }

    Ok(())
}

/// Builds a [`Campaign`] from a `DropCampaignDetails` payload.
fn parse_campaign(raw: &Value) -> Option<Campaign> {
    let id = string_from_value(raw.get("id"));
    if id.is_empty() {
        debug!("Campaign payload without id, skipping");
        return None;
    }

    let game = raw
        .get("game")
        .filter(|v| !v.is_null())
        .map(|g| GameInfo {
            id: string_from_value(g.get("id")),
            name: string_from_value(g.get("name")),
            display_name: string_from_value(g.get("displayName")),
            slug: string_from_value(g.get("slug")),
        });

    let channels = raw
        .get("allow")
        .and_then(|a| a.get("channels"))
        .and_then(|v| v.as_array())
        .map(|channels| {
            channels
                .iter()
                .map(|c| string_from_value(c.get("id")))
                .filter(|id| !id.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut campaign = Campaign::new(
        id,
        string_from_value(raw.get("name")),
        string_from_value(raw.get("status")),
        game,
        parse_rfc3339(raw.get("startAt")),
        parse_rfc3339(raw.get("endAt")),
        channels,
    );

    if let Some(time_based) = raw.get("timeBasedDrops").and_then(|v| v.as_array()) {
        for time_drop in time_based {
            let benefits = time_drop
                .get("benefitEdges")
                .and_then(|v| v.as_array())
                .map(|edges| {
                    edges
                        .iter()
                        .map(|e| {
                            string_from_value(e.get("benefit").and_then(|b| b.get("name")))
                        })
                        .filter(|name| !name.is_empty())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            campaign.drops.push(Drop::new(
                string_from_value(time_drop.get("id")),
                string_from_value(time_drop.get("name")),
                benefits,
                int_from_value(time_drop.get("requiredMinutesWatched")),
                parse_rfc3339(time_drop.get("startAt")),
                parse_rfc3339(time_drop.get("endAt")),
            ));
        }
    }

    Some(campaign)
}

fn parse_rfc3339(v: Option<&Value>) -> DateTime<Utc> {
    v.and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// A campaign applies to a streamer when the games agree (if both are
/// known) and the streamer advertises the campaign id.
fn campaign_matches_streamer(
    campaign: &Campaign,
    state: &common::model::streamer::StreamerState,
) -> bool {
    if let (Some(campaign_game), Some(stream_game)) = (&campaign.game, &state.stream.game) {
        if campaign_game.name != stream_game.name {
            return false;
        }
    }

    state
        .stream
        .campaign_ids
        .iter()
        .any(|id| *id == campaign.id)
}

#[cfg(test)]
mod test {
    use chrono::Duration as ChronoDuration;
    use common::model::stream::Stream;
    use common::model::streamer::StreamerState;
    use serde_json::json;

    use super::*;

    fn campaign_payload(id: &str, start_offset_h: i64, end_offset_h: i64) -> Value {
        let now = Utc::now();
        json!({
            "id": id,
            "name": "Rust Legends",
            "status": "ACTIVE",
            "startAt": (now + ChronoDuration::hours(start_offset_h)).to_rfc3339(),
            "endAt": (now + ChronoDuration::hours(end_offset_h)).to_rfc3339(),
            "game": {"id": "g1", "name": "rust", "displayName": "Rust", "slug": "rust"},
            "allow": {"channels": [{"id": "777"}]},
            "timeBasedDrops": [
                {
                    "id": "d1",
                    "name": "Crate Skin",
                    "requiredMinutesWatched": 120,
                    "startAt": (now - ChronoDuration::hours(1)).to_rfc3339(),
                    "endAt": (now + ChronoDuration::hours(10)).to_rfc3339(),
                    "benefitEdges": [{"benefit": {"name": "Crate Skin"}}]
                }
            ]
        })
    }

    #[test]
    fn parse_live_campaign() {
        let campaign = parse_campaign(&campaign_payload("c1", -1, 5)).unwrap();
        assert_eq!(campaign.id, "c1");
        assert!(campaign.is_within_time_window);
        assert_eq!(campaign.channels, vec!["777"]);
        assert_eq!(campaign.drops.len(), 1);
        assert_eq!(campaign.drops[0].benefit, "Crate Skin");
        assert_eq!(campaign.drops[0].minutes_required, 120);
        assert!(campaign.drops[0].is_within_time_window);
    }

    #[test]
    fn parse_rejects_missing_id() {
        assert!(parse_campaign(&json!({"name": "x"})).is_none());
    }

    #[test]
    fn expired_campaign_is_flagged() {
        let campaign = parse_campaign(&campaign_payload("c2", -10, -5)).unwrap();
        assert!(!campaign.is_within_time_window);
    }

    #[test]
    fn campaign_streamer_matching() {
        let campaign = parse_campaign(&campaign_payload("c1", -1, 5)).unwrap();

        let mut state = StreamerState {
            stream: Stream::new(),
            ..Default::default()
        };
        state.stream.game = Some(GameInfo {
            id: "g1".into(),
            name: "rust".into(),
            ..Default::default()
        });

        assert!(!campaign_matches_streamer(&campaign, &state), "no campaign id yet");

        state.stream.campaign_ids = vec!["c1".into()];
        assert!(campaign_matches_streamer(&campaign, &state));

        state.stream.game = Some(GameInfo {
            id: "g2".into(),
            name: "other-game".into(),
            ..Default::default()
        });
        assert!(
            !campaign_matches_streamer(&campaign, &state),
            "game mismatch excludes the campaign"
        );
    }
}
