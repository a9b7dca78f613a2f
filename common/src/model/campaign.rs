use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::percentage;

/// A time-based reward within a drop campaign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Drop {
    pub id: String,
    pub name: String,
    pub benefit: String,
    pub minutes_required: u64,

    pub has_preconditions_met: Option<bool>,
    pub current_minutes_watched: u64,
    pub drop_instance_id: String,
    pub is_claimed: bool,
    pub is_claimable: bool,
    /// Progress crossed a quarter boundary since the last sync, worth a log line.
    pub is_printable: bool,
    pub percentage_progress: u64,

    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_within_time_window: bool,
}

impl Drop {
    pub fn new(
        id: String,
        name: String,
        benefits: Vec<String>,
        minutes_required: u64,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Drop {
        let now = Utc::now();
        Drop {
            id,
            name,
            benefit: benefits.join(", "),
            minutes_required,
            start_at,
            end_at,
            is_within_time_window: start_at < now && now < end_at,
            ..Default::default()
        }
    }

    /// Refreshes progress from inventory data.
    pub fn update(
        &mut self,
        has_preconditions_met: bool,
        current_minutes_watched: u64,
        drop_instance_id: String,
        is_claimed: bool,
    ) {
        self.has_preconditions_met = Some(has_preconditions_met);

        let updated_percentage = percentage(current_minutes_watched, self.minutes_required);
        let quarter = (updated_percentage / 25) * 25 == updated_percentage;

        self.is_printable = current_minutes_watched > self.current_minutes_watched
            && ((updated_percentage > self.percentage_progress
                && quarter
                && self.current_minutes_watched != 0)
                || (current_minutes_watched == 1 && self.current_minutes_watched == 0));

        self.current_minutes_watched = current_minutes_watched;
        self.drop_instance_id = drop_instance_id;
        self.is_claimed = is_claimed;
        self.is_claimable = !self.is_claimed && !self.drop_instance_id.is_empty();
        self.percentage_progress = updated_percentage;
    }

    /// Text progress bar for log output.
    pub fn progress_bar(&self) -> String {
        let progress = (self.percentage_progress / 2) as usize;
        let mut remaining = ((100 - self.percentage_progress.min(100)) / 2) as usize;
        if remaining + progress < 50 {
            remaining += 50 - (remaining + progress);
        }
        format!(
            "|{}{}|\t{}% [{}/{}]",
            "█".repeat(progress),
            " ".repeat(remaining),
            self.percentage_progress,
            self.current_minutes_watched,
            self.minutes_required
        )
    }
}

impl std::fmt::Display for Drop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {} min, {}%)",
            self.name, self.benefit, self.minutes_required, self.percentage_progress
        )
    }
}

/// A Twitch drop campaign and its drops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: String,
    pub game: Option<super::stream::GameInfo>,
    pub in_inventory: bool,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub is_within_time_window: bool,
    pub drops: Vec<Drop>,
    pub channels: Vec<String>,
}

impl Campaign {
    pub fn new(
        id: String,
        name: String,
        status: String,
        game: Option<super::stream::GameInfo>,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        channels: Vec<String>,
    ) -> Campaign {
        let now = Utc::now();
        Campaign {
            id,
            name,
            status,
            game,
            start_at,
            end_at,
            is_within_time_window: start_at < now && now < end_at,
            channels,
            ..Default::default()
        }
    }

    /// Drops outside their time window or already claimed are dead weight.
    pub fn clear_drops(&mut self) {
        self.drops
            .retain(|d| d.is_within_time_window && !d.is_claimed);
    }
}

impl std::fmt::Display for Campaign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let game = self
            .game
            .as_ref()
            .map(|g| g.display_name.as_str())
            .unwrap_or("");
        write!(f, "{} ({game}, {} drops)", self.name, self.drops.len())
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;

    fn live_drop(minutes_required: u64) -> Drop {
        let now = Utc::now();
        Drop::new(
            "d1".into(),
            "Shiny Hat".into(),
            vec!["Hat".into(), "Sticker".into()],
            minutes_required,
            now - Duration::hours(1),
            now + Duration::hours(1),
        )
    }

    #[test]
    fn drop_update_tracks_claimability() {
        let mut drop = live_drop(100);
        drop.update(true, 50, "inst-1".into(), false);
        assert_eq!(drop.percentage_progress, 50);
        assert!(drop.is_claimable);

        drop.update(true, 100, "inst-1".into(), true);
        assert!(!drop.is_claimable);
        assert!(drop.is_claimed);
    }

    #[test]
    fn printable_on_quarter_boundaries() {
        let mut drop = live_drop(100);
        drop.update(true, 1, "".into(), false);
        assert!(drop.is_printable, "first minute is always printable");

        drop.update(true, 20, "".into(), false);
        assert!(!drop.is_printable, "20% is not a quarter");

        drop.update(true, 50, "".into(), false);
        assert!(drop.is_printable, "crossed 50%");
    }

    #[test]
    fn clear_drops_removes_claimed_and_expired() {
        let now = Utc::now();
        let mut campaign = Campaign::new(
            "c1".into(),
            "camp".into(),
            "ACTIVE".into(),
            None,
            now - Duration::hours(1),
            now + Duration::hours(1),
            vec![],
        );
        let mut claimed = live_drop(10);
        claimed.is_claimed = true;
        let expired = Drop::new(
            "d2".into(),
            "old".into(),
            vec![],
            10,
            now - Duration::hours(3),
            now - Duration::hours(2),
        );
        campaign.drops = vec![live_drop(10), claimed, expired];
        campaign.clear_drops();
        assert_eq!(campaign.drops.len(), 1);
    }

    #[test]
    fn progress_bar_shape() {
        let mut drop = live_drop(100);
        drop.update(true, 50, "".into(), false);
        let bar = drop.progress_bar();
        assert!(bar.contains("50%"));
        assert!(bar.contains("[50/100]"));
    }
}
