//! Per-account YAML configuration. One file per account in the config
//! directory; the filename stem is the account login. Secrets come from
//! environment variables suffixed with the uppercased username.

use std::path::Path;
use std::time::Duration;

use eyre::{bail, eyre, Context, Result};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::model::prediction::{BetSettings, Condition, DelayMode, FilterCondition, OutcomeKey, Strategy};
use crate::model::streamer::{ChatPresence, StreamerSettings};
use crate::model::{Event, FollowersOrder, Priority};
use crate::twitch::auth::AuthConfig;

pub const DEFAULT_CATEGORY_POLL_INTERVAL: Duration = Duration::from_secs(120);

/// Global feature toggles for an account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub claim_drops_startup: bool,
    pub enable_analytics: bool,
}

/// Category watcher settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryWatcherConfig {
    pub enabled: bool,
    /// Poll interval in seconds; 0 means the default of 120.
    pub poll_interval: u64,
    pub drops_only: bool,
    pub categories: Vec<CategoryConfig>,
}

impl CategoryWatcherConfig {
    pub fn interval(&self) -> Duration {
        if self.poll_interval == 0 {
            DEFAULT_CATEGORY_POLL_INTERVAL
        } else {
            Duration::from_secs(self.poll_interval)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub slug: String,
    #[serde(default)]
    pub drops_only: Option<bool>,
}

/// Follower-expansion settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowersConfig {
    pub enabled: bool,
    pub order: FollowersOrder,
}

/// Webhook notification sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub webhook: Option<WebhookConfig>,
}

/// YAML overlay over [`BetSettings`]; unset fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BetSettingsOverlay {
    pub strategy: Option<Strategy>,
    #[validate(range(min = 1, max = 100))]
    pub percentage: Option<u64>,
    #[validate(range(min = 0, max = 100))]
    pub percentage_gap: Option<u64>,
    pub max_points: Option<u64>,
    pub minimum_points: Option<u64>,
    pub stealth_mode: Option<bool>,
    pub delay: Option<f64>,
    pub delay_mode: Option<DelayMode>,
    pub filter_condition: Option<FilterConditionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConditionConfig {
    pub by: OutcomeKey,
    pub r#where: Condition,
    pub value: f64,
}

impl BetSettingsOverlay {
    pub fn overlay(&self, defaults: &BetSettings) -> BetSettings {
        let mut bet = defaults.clone();
        if let Some(strategy) = self.strategy {
            bet.strategy = strategy;
        }
        if let Some(percentage) = self.percentage {
            bet.percentage = percentage;
        }
        if let Some(gap) = self.percentage_gap {
            bet.percentage_gap = gap;
        }
        if let Some(max_points) = self.max_points {
            bet.max_points = max_points;
        }
        if let Some(minimum_points) = self.minimum_points {
            bet.minimum_points = minimum_points;
        }
        if let Some(stealth_mode) = self.stealth_mode {
            bet.stealth_mode = stealth_mode;
        }
        if let Some(delay) = self.delay {
            bet.delay = delay;
        }
        if let Some(delay_mode) = self.delay_mode {
            bet.delay_mode = delay_mode;
        }
        if let Some(fc) = &self.filter_condition {
            bet.filter_condition = Some(FilterCondition {
                by: fc.by,
                r#where: fc.r#where,
                value: fc.value,
            });
        }
        bet
    }
}

/// YAML overlay over [`StreamerSettings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StreamerSettingsOverlay {
    pub make_predictions: Option<bool>,
    pub follow_raid: Option<bool>,
    pub claim_drops: Option<bool>,
    pub claim_moments: Option<bool>,
    pub watch_streak: Option<bool>,
    pub community_goals: Option<bool>,
    pub chat: Option<ChatPresence>,
    #[validate(nested)]
    pub bet: Option<BetSettingsOverlay>,
}

impl StreamerSettingsOverlay {
    pub fn overlay(&self, defaults: &StreamerSettings) -> StreamerSettings {
        let mut settings = defaults.clone();
        if let Some(v) = self.make_predictions {
            settings.make_predictions = v;
        }
        if let Some(v) = self.follow_raid {
            settings.follow_raid = v;
        }
        if let Some(v) = self.claim_drops {
            settings.claim_drops = v;
        }
        if let Some(v) = self.claim_moments {
            settings.claim_moments = v;
        }
        if let Some(v) = self.watch_streak {
            settings.watch_streak = v;
        }
        if let Some(v) = self.community_goals {
            settings.community_goals = v;
        }
        if let Some(v) = self.chat {
            settings.chat = v;
        }
        if let Some(bet) = &self.bet {
            settings.bet = bet.overlay(&defaults.bet);
        }
        settings
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamerEntry {
    pub username: String,
    #[serde(default)]
    pub settings: Option<StreamerSettingsOverlay>,
}

/// Full configuration for one account.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    #[serde(skip)]
    pub username: String,

    pub enabled: Option<bool>,
    pub auth_token: Option<String>,
    pub password: Option<String>,

    pub features: FeaturesConfig,
    pub priority: Vec<Priority>,
    pub category_watcher: CategoryWatcherConfig,
    pub streamer_defaults: StreamerSettingsOverlay,
    pub streamers: Vec<StreamerEntry>,
    pub blacklist: Vec<String>,
    pub followers: FollowersConfig,
    pub notifications: NotificationsConfig,
}

impl AccountConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Priority chain, defaulting to streak, drops, then config order.
    pub fn priorities(&self) -> Vec<Priority> {
        if self.priority.is_empty() {
            vec![Priority::Streak, Priority::Drops, Priority::Order]
        } else {
            self.priority.clone()
        }
    }

    /// Per-streamer defaults with the account overlay applied.
    pub fn streamer_defaults(&self) -> StreamerSettings {
        self.streamer_defaults.overlay(&StreamerSettings::default())
    }

    /// Credentials for the authenticator, env vars winning over YAML.
    pub fn auth_config(&self) -> AuthConfig {
        let suffix = self.username.to_uppercase().replace('-', "_");
        AuthConfig {
            auth_token: std::env::var(format!("TWITCH_AUTH_TOKEN_{suffix}"))
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| self.auth_token.clone()),
            password: std::env::var(format!("TWITCH_PASSWORD_{suffix}"))
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| self.password.clone()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            bail!("Account config has no username");
        }
        if self.streamers.is_empty()
            && !self.followers.enabled
            && !(self.category_watcher.enabled && !self.category_watcher.categories.is_empty())
        {
            bail!(
                "Account {}: empty streamer list with neither followers nor category watcher enabled",
                self.username
            );
        }
        if self.category_watcher.enabled && self.category_watcher.categories.is_empty() {
            bail!(
                "Account {}: category watcher enabled without categories",
                self.username
            );
        }

        self.streamer_defaults
            .validate()
            .map_err(|err| eyre!("Account {}: invalid streamer defaults: {err}", self.username))?;
        for entry in &self.streamers {
            if let Some(settings) = &entry.settings {
                settings.validate().map_err(|err| {
                    eyre!(
                        "Account {}: invalid settings for {}: {err}",
                        self.username,
                        entry.username
                    )
                })?;
            }
        }
        Ok(())
    }
}

/// Parses a single account file; the login is the filename stem.
pub fn load_account_file(path: &Path) -> Result<AccountConfig> {
    let username = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| eyre!("Config file {} has no usable name", path.display()))?
        .to_lowercase();

    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Reading config file {}", path.display()))?;
    let mut config: AccountConfig = serde_yaml::from_str(&text)
        .wrap_err_with(|| format!("Parsing config file {}", path.display()))?;
    config.username = username;

    config.validate()?;
    Ok(config)
}

/// Loads every `*.yaml`/`*.yml` account file in a directory.
pub fn load_config_dir(dir: &Path) -> Result<Vec<AccountConfig>> {
    let entries = std::fs::read_dir(dir)
        .wrap_err_with(|| format!("Reading config directory {}", dir.display()))?;

    let mut accounts = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }
        accounts.push(load_account_file(&path)?);
    }

    if accounts.is_empty() {
        bail!("No account config files found in {}", dir.display());
    }
    accounts.sort_by(|a, b| a.username.cmp(&b.username));
    Ok(accounts)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::twitch::generate_hex;

    const SAMPLE: &str = r#"
features:
  claim_drops_startup: true
priority: [DROPS, ORDER]
streamer_defaults:
  follow_raid: true
  bet:
    strategy: SMART
    percentage: 5
    delay: 6
    delay_mode: FROM_END
streamers:
  - username: CohhCarnage
  - username: somestreamer
    settings:
      make_predictions: false
      bet:
        max_points: 1234
blacklist: [badguy]
followers:
  enabled: true
  order: DESC
category_watcher:
  enabled: true
  poll_interval: 60
  categories:
    - slug: rust
    - slug: teamfight-tactics
      drops_only: true
notifications:
  webhook:
    enabled: true
    endpoint: https://example.com/hook
    events: [BET_WIN, BET_LOSE]
"#;

    fn write_sample(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("cfg-{}", generate_hex(8)));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parse_sample_config() {
        let path = write_sample("MyAccount.yaml", SAMPLE);
        let config = load_account_file(&path).unwrap();

        assert_eq!(config.username, "myaccount");
        assert!(config.features.claim_drops_startup);
        assert_eq!(config.priorities(), vec![Priority::Drops, Priority::Order]);
        assert_eq!(config.streamers.len(), 2);
        assert_eq!(config.followers.order, FollowersOrder::Desc);
        assert_eq!(config.category_watcher.interval(), Duration::from_secs(60));
        assert_eq!(config.category_watcher.categories[1].drops_only, Some(true));

        let webhook = config.notifications.webhook.as_ref().unwrap();
        assert_eq!(webhook.events, vec![Event::BetWin, Event::BetLose]);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn settings_overlay_chain() {
        let path = write_sample("acc.yaml", SAMPLE);
        let config = load_account_file(&path).unwrap();

        let defaults = config.streamer_defaults();
        assert!(defaults.follow_raid);
        assert_eq!(defaults.bet.percentage, 5);

        let specific = config.streamers[1]
            .settings
            .as_ref()
            .unwrap()
            .overlay(&defaults);
        assert!(!specific.make_predictions);
        assert_eq!(specific.bet.max_points, 1234);
        // Fields the overlay left unset keep the defaults.
        assert_eq!(specific.bet.percentage, 5);
        assert_eq!(specific.bet.delay_mode, DelayMode::FromEnd);

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn empty_streamer_set_requires_a_source() {
        let path = write_sample("lonely.yaml", "streamers: []\n");
        assert!(load_account_file(&path).is_err());

        let path2 = write_sample(
            "followers_ok.yaml",
            "streamers: []\nfollowers:\n  enabled: true\n",
        );
        assert!(load_account_file(&path2).is_ok());

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
        std::fs::remove_dir_all(path2.parent().unwrap()).ok();
    }

    #[test]
    fn invalid_bet_percentage_rejected() {
        let bad = "streamers:\n  - username: a\n    settings:\n      bet:\n        percentage: 150\n";
        let path = write_sample("bad.yaml", bad);
        assert!(load_account_file(&path).is_err());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn env_secrets_override_yaml() {
        let path = write_sample(
            "EnvUser.yaml",
            "auth_token: from-yaml\nstreamers:\n  - username: a\n",
        );
        let config = load_account_file(&path).unwrap();

        std::env::remove_var("TWITCH_AUTH_TOKEN_ENVUSER");
        assert_eq!(config.auth_config().auth_token.as_deref(), Some("from-yaml"));

        std::env::set_var("TWITCH_AUTH_TOKEN_ENVUSER", "from-env");
        assert_eq!(config.auth_config().auth_token.as_deref(), Some("from-env"));
        std::env::remove_var("TWITCH_AUTH_TOKEN_ENVUSER");

        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
