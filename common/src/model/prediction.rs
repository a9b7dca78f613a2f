use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use validator::Validate;

use crate::utils::float_round;

/// Bets below this are never sent; Twitch rejects them anyway.
pub const MIN_BET_AMOUNT: u64 = 10;

/// Which outcome to bet on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    MostVoted,
    HighOdds,
    Percentage,
    SmartMoney,
    #[default]
    Smart,
    #[serde(rename = "NUMBER_1")]
    #[strum(serialize = "NUMBER_1")]
    Number1,
    #[serde(rename = "NUMBER_2")]
    #[strum(serialize = "NUMBER_2")]
    Number2,
    #[serde(rename = "NUMBER_3")]
    #[strum(serialize = "NUMBER_3")]
    Number3,
    #[serde(rename = "NUMBER_4")]
    #[strum(serialize = "NUMBER_4")]
    Number4,
    #[serde(rename = "NUMBER_5")]
    #[strum(serialize = "NUMBER_5")]
    Number5,
    #[serde(rename = "NUMBER_6")]
    #[strum(serialize = "NUMBER_6")]
    Number6,
    #[serde(rename = "NUMBER_7")]
    #[strum(serialize = "NUMBER_7")]
    Number7,
    #[serde(rename = "NUMBER_8")]
    #[strum(serialize = "NUMBER_8")]
    Number8,
}

/// Comparison operator for filter conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    #[default]
    Gt,
    Lt,
    Gte,
    Lte,
}

/// Keys into the per-outcome statistics, plus two virtual aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeKey {
    PercentageUsers,
    OddsPercentage,
    Odds,
    TopPoints,
    TotalUsers,
    TotalPoints,
    /// Virtual: sum of `total_users` over all outcomes.
    DecisionUsers,
    /// Virtual: sum of `total_points` over all outcomes.
    DecisionPoints,
}

/// How the bet placement delay is derived from the prediction window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DelayMode {
    FromStart,
    #[default]
    FromEnd,
    Percentage,
}

/// Optional pre-bet filter; when it does not hold, the bet is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub by: OutcomeKey,
    pub r#where: Condition,
    pub value: f64,
}

impl std::fmt::Display for FilterCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FilterCondition(by={}, where={}, value={:.2})",
            self.by, self.r#where, self.value
        )
    }
}

/// Configuration for automatic prediction betting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BetSettings {
    pub strategy: Strategy,
    #[validate(range(min = 1, max = 100))]
    pub percentage: u64,
    #[validate(range(min = 0, max = 100))]
    pub percentage_gap: u64,
    pub max_points: u64,
    pub minimum_points: u64,
    pub stealth_mode: bool,
    pub filter_condition: Option<FilterCondition>,
    pub delay: f64,
    pub delay_mode: DelayMode,
}

impl Default for BetSettings {
    fn default() -> BetSettings {
        BetSettings {
            strategy: Strategy::Smart,
            percentage: 5,
            percentage_gap: 20,
            max_points: 50_000,
            minimum_points: 0,
            stealth_mode: false,
            filter_condition: None,
            delay: 6.0,
            delay_mode: DelayMode::FromEnd,
        }
    }
}

/// The effective bet window in seconds for the given settings. The timer is
/// scheduled this many seconds after the event's creation.
pub fn bet_window_seconds(settings: &BetSettings, prediction_window_seconds: f64) -> f64 {
    match settings.delay_mode {
        DelayMode::FromStart => settings.delay.min(prediction_window_seconds),
        DelayMode::FromEnd => (prediction_window_seconds - settings.delay).max(0.0),
        // delay > 1.0 is taken literally as a multiplier of the window.
        DelayMode::Percentage => prediction_window_seconds * settings.delay,
    }
}

/// A single prediction outcome with derived statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: String,
    pub title: String,
    pub color: String,
    pub total_users: u64,
    pub total_points: u64,
    pub top_points: u64,
    pub percentage_users: f64,
    pub odds: f64,
    pub odds_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BetDecision {
    pub choice: Option<usize>,
    pub amount: u64,
    pub outcome_id: String,
}

/// State of a bet calculation over live outcome statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub outcomes: Vec<Outcome>,
    pub decision: BetDecision,
    pub total_users: u64,
    pub total_points: u64,
    pub settings: BetSettings,
}

impl Bet {
    pub fn new(outcomes: Vec<Outcome>, settings: BetSettings) -> Bet {
        let mut bet = Bet {
            outcomes: Vec::new(),
            decision: BetDecision::default(),
            total_users: 0,
            total_points: 0,
            settings,
        };
        bet.update_outcomes(outcomes);
        bet
    }

    /// Refreshes outcome statistics and recomputes the derived fields.
    /// Derivations are pure functions of `(total_users_i, total_points_i)`.
    pub fn update_outcomes(&mut self, updates: Vec<Outcome>) {
        if self.outcomes.is_empty() {
            self.outcomes = updates;
        } else {
            for (outcome, update) in self.outcomes.iter_mut().zip(updates) {
                outcome.total_users = update.total_users;
                outcome.total_points = update.total_points;
                if update.top_points > 0 {
                    outcome.top_points = update.top_points;
                }
            }
        }

        self.total_users = self.outcomes.iter().map(|o| o.total_users).sum();
        self.total_points = self.outcomes.iter().map(|o| o.total_points).sum();

        if self.total_users > 0 && self.total_points > 0 {
            for outcome in &mut self.outcomes {
                outcome.percentage_users = float_round(
                    100.0 * outcome.total_users as f64 / self.total_users as f64,
                    2,
                );
                outcome.odds = if outcome.total_points == 0 {
                    0.0
                } else {
                    float_round(self.total_points as f64 / outcome.total_points as f64, 2)
                };
                outcome.odds_percentage = if outcome.odds == 0.0 {
                    0.0
                } else {
                    float_round(100.0 / outcome.odds, 2)
                };
            }
        }
    }

    fn outcome_value(&self, index: usize, key: OutcomeKey) -> f64 {
        let outcome = &self.outcomes[index];
        match key {
            OutcomeKey::TotalUsers => outcome.total_users as f64,
            OutcomeKey::TotalPoints => outcome.total_points as f64,
            OutcomeKey::PercentageUsers => outcome.percentage_users,
            OutcomeKey::Odds => outcome.odds,
            OutcomeKey::OddsPercentage => outcome.odds_percentage,
            OutcomeKey::TopPoints => outcome.top_points as f64,
            OutcomeKey::DecisionUsers | OutcomeKey::DecisionPoints => 0.0,
        }
    }

    fn choice_by_max(&self, key: OutcomeKey) -> Option<usize> {
        if self.outcomes.is_empty() {
            return None;
        }
        let mut largest = 0;
        for i in 1..self.outcomes.len() {
            if self.outcome_value(i, key) > self.outcome_value(largest, key) {
                largest = i;
            }
        }
        Some(largest)
    }

    fn choice_by_number(&self, number: usize) -> Option<usize> {
        if self.outcomes.is_empty() {
            None
        } else if number < self.outcomes.len() {
            Some(number)
        } else {
            Some(0)
        }
    }

    /// Evaluates the filter condition against the current statistics.
    /// Returns `(skip, compared_value)`; the bet proceeds only when the
    /// condition holds. `decision_users`/`decision_points` aggregate over all
    /// outcomes, every other key reads the chosen outcome.
    pub fn skip(&self) -> (bool, f64) {
        let Some(fc) = &self.settings.filter_condition else {
            return (false, 0.0);
        };

        let compared_value = match fc.by {
            OutcomeKey::DecisionUsers => self.total_users as f64,
            OutcomeKey::DecisionPoints => self.total_points as f64,
            key => match self.decision.choice {
                Some(choice) => self.outcome_value(choice, key),
                None => 0.0,
            },
        };

        let holds = match fc.r#where {
            Condition::Gt => compared_value > fc.value,
            Condition::Lt => compared_value < fc.value,
            Condition::Gte => compared_value >= fc.value,
            Condition::Lte => compared_value <= fc.value,
        };

        (!holds, compared_value)
    }

    /// Picks an outcome and an amount for the given balance.
    pub fn calculate(&mut self, balance: u64) -> BetDecision {
        self.decision = BetDecision::default();

        self.decision.choice = match self.settings.strategy {
            Strategy::MostVoted => self.choice_by_max(OutcomeKey::TotalUsers),
            Strategy::HighOdds => self.choice_by_max(OutcomeKey::Odds),
            Strategy::Percentage => self.choice_by_max(OutcomeKey::OddsPercentage),
            Strategy::SmartMoney => self.choice_by_max(OutcomeKey::TopPoints),
            Strategy::Number1 => self.choice_by_number(0),
            Strategy::Number2 => self.choice_by_number(1),
            Strategy::Number3 => self.choice_by_number(2),
            Strategy::Number4 => self.choice_by_number(3),
            Strategy::Number5 => self.choice_by_number(4),
            Strategy::Number6 => self.choice_by_number(5),
            Strategy::Number7 => self.choice_by_number(6),
            Strategy::Number8 => self.choice_by_number(7),
            Strategy::Smart => {
                if self.outcomes.len() >= 2 {
                    let difference =
                        (self.outcomes[0].percentage_users - self.outcomes[1].percentage_users).abs();
                    if difference < self.settings.percentage_gap as f64 {
                        self.choice_by_max(OutcomeKey::Odds)
                    } else {
                        self.choice_by_max(OutcomeKey::TotalUsers)
                    }
                } else {
                    None
                }
            }
        };

        if let Some(choice) = self.decision.choice {
            let chosen = &self.outcomes[choice];
            self.decision.outcome_id = chosen.id.clone();

            let mut amount =
                ((balance as f64 * self.settings.percentage as f64) / 100.0) as u64;
            amount = amount.min(self.settings.max_points);

            // Stealth keeps the bet under the current leader; a result of 0
            // simply falls below the minimum and is skipped.
            if self.settings.stealth_mode && chosen.top_points > 0 && amount >= chosen.top_points
            {
                let reduction = rand::thread_rng().gen_range(1.0..5.0);
                amount = chosen.top_points.saturating_sub(reduction as u64);
            }

            self.decision.amount = amount;
        }

        self.decision.clone()
    }
}

/// Lifecycle of a prediction event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionStatus {
    #[default]
    Active,
    Locked,
    Resolved,
}

impl PredictionStatus {
    pub fn parse(s: &str) -> PredictionStatus {
        match s {
            "ACTIVE" => PredictionStatus::Active,
            "LOCKED" => PredictionStatus::Locked,
            _ => PredictionStatus::Resolved,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub result_type: String,
    pub gained: i64,
    pub description: String,
}

/// Points moved by a resolved prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultPoints {
    pub placed: i64,
    pub won: i64,
    pub gained: i64,
}

/// A live prediction event on a channel. One placement attempt at most;
/// `bet_confirmed` implies `bet_placed`.
#[derive(Debug, Clone)]
pub struct EventPrediction {
    pub channel_id: String,
    pub streamer_login: String,
    pub event_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// The effective bet window derived by [`bet_window_seconds`].
    pub window_seconds: f64,
    pub status: PredictionStatus,
    pub bet_placed: bool,
    pub bet_confirmed: bool,
    pub bet: Bet,
    pub result: Option<PredictionResult>,
}

impl EventPrediction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: String,
        streamer_login: String,
        event_id: String,
        title: String,
        created_at: DateTime<Utc>,
        window_seconds: f64,
        status: PredictionStatus,
        outcomes: Vec<Outcome>,
        settings: BetSettings,
    ) -> EventPrediction {
        EventPrediction {
            channel_id,
            streamer_login,
            event_id,
            title,
            created_at,
            window_seconds,
            status,
            bet_placed: false,
            bet_confirmed: false,
            bet: Bet::new(outcomes, settings),
            result: None,
        }
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        float_round((now - self.created_at).num_milliseconds() as f64 / 1000.0, 2)
    }

    /// Seconds left until the bet should be placed, measured from `now`.
    pub fn closing_bet_after(&self, now: DateTime<Utc>) -> f64 {
        float_round(self.window_seconds - self.elapsed_seconds(now), 2)
    }

    /// Records the server-reported result and returns the points breakdown.
    pub fn parse_result(&mut self, result_type: &str, points_won: i64) -> ResultPoints {
        let mut points = ResultPoints::default();

        if result_type != "REFUND" {
            points.placed = self.bet.decision.amount as i64;
        }
        if points_won > 0 || result_type == "REFUND" {
            points.won = points_won;
        }
        if result_type != "REFUND" {
            points.gained = points.won - points.placed;
        }

        let action = match result_type {
            "LOSE" => "Lost",
            "REFUND" => "Refunded",
            _ => "Gained",
        };
        let prefix = if points.gained >= 0 { "+" } else { "" };

        self.result = Some(PredictionResult {
            result_type: result_type.to_owned(),
            gained: points.gained,
            description: format!("{result_type}, {action}: {prefix}{}", points.gained),
        });

        points
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;
    use rstest::rstest;

    use super::*;

    fn outcome(id: &str, users: u64, points: u64) -> Outcome {
        Outcome {
            id: id.to_owned(),
            title: id.to_owned(),
            color: "BLUE".to_owned(),
            total_users: users,
            total_points: points,
            ..Default::default()
        }
    }

    fn settings(strategy: Strategy) -> BetSettings {
        BetSettings {
            strategy,
            ..Default::default()
        }
    }

    #[test]
    fn outcome_derivations() {
        let mut bet = Bet::new(
            vec![outcome("a", 100, 10_000), outcome("b", 50, 5_000)],
            BetSettings::default(),
        );
        bet.update_outcomes(vec![outcome("a", 100, 10_000), outcome("b", 50, 5_000)]);

        let pct_sum: f64 = bet.outcomes.iter().map(|o| o.percentage_users).sum();
        assert!((pct_sum - 100.0).abs() < 0.01);

        assert_eq!(bet.outcomes[0].odds, 1.5);
        assert_eq!(bet.outcomes[1].odds, 3.0);
        assert_eq!(bet.outcomes[0].odds_percentage, 66.67);
        assert_eq!(bet.outcomes[1].odds_percentage, 33.33);
    }

    #[test]
    fn zero_points_outcome_has_zero_odds() {
        let bet = Bet::new(
            vec![outcome("a", 10, 1_000), outcome("b", 5, 0)],
            BetSettings::default(),
        );
        assert_eq!(bet.outcomes[1].odds, 0.0);
        assert_eq!(bet.outcomes[1].odds_percentage, 0.0);
    }

    #[rstest]
    #[case(DelayMode::FromStart, 120.0, 60.0, 60.0)]
    #[case(DelayMode::FromStart, 30.0, 60.0, 30.0)]
    #[case(DelayMode::FromEnd, 6.0, 60.0, 54.0)]
    #[case(DelayMode::FromEnd, 90.0, 60.0, 0.0)]
    #[case(DelayMode::Percentage, 1.0, 60.0, 60.0)]
    #[case(DelayMode::Percentage, 0.5, 60.0, 30.0)]
    #[case(DelayMode::Percentage, 2.0, 60.0, 120.0)]
    fn delay_computation(
        #[case] mode: DelayMode,
        #[case] delay: f64,
        #[case] window: f64,
        #[case] expected: f64,
    ) {
        let s = BetSettings {
            delay,
            delay_mode: mode,
            ..Default::default()
        };
        assert_eq!(bet_window_seconds(&s, window), expected);
    }

    #[test]
    fn smart_strategy_wide_gap_picks_most_voted() {
        // A 66.67% vs B 33.33%, gap 20 -> most voted, 5% of 10k = 500.
        let mut bet = Bet::new(
            vec![outcome("a", 100, 10_000), outcome("b", 50, 5_000)],
            settings(Strategy::Smart),
        );
        let decision = bet.calculate(10_000);
        assert_eq!(decision.choice, Some(0));
        assert_eq!(decision.outcome_id, "a");
        assert_eq!(decision.amount, 500);
    }

    #[test]
    fn smart_strategy_close_race_picks_odds() {
        let mut bet = Bet::new(
            vec![outcome("a", 52, 9_000), outcome("b", 48, 1_000)],
            settings(Strategy::Smart),
        );
        let decision = bet.calculate(1_000);
        // 52% vs 48% is inside the default gap of 20 -> highest odds wins.
        assert_eq!(decision.choice, Some(1));
    }

    #[rstest]
    #[case(Strategy::MostVoted, 0)]
    #[case(Strategy::HighOdds, 1)]
    #[case(Strategy::SmartMoney, 2)]
    #[case(Strategy::Number2, 1)]
    #[case(Strategy::Number8, 0)] // out of range falls back to first
    fn fixed_strategies(#[case] strategy: Strategy, #[case] expected: usize) {
        let mut outcomes = vec![
            outcome("a", 100, 50_000),
            outcome("b", 10, 1_000),
            outcome("c", 20, 20_000),
        ];
        outcomes[2].top_points = 9_999;
        let mut bet = Bet::new(outcomes, settings(strategy));
        assert_eq!(bet.calculate(1_000).choice, Some(expected));
    }

    #[test]
    fn amount_capped_by_max_points() {
        let mut bet = Bet::new(
            vec![outcome("a", 100, 10_000), outcome("b", 50, 5_000)],
            BetSettings {
                max_points: 300,
                ..settings(Strategy::MostVoted)
            },
        );
        assert_eq!(bet.calculate(1_000_000).amount, 300);
    }

    #[test]
    fn stealth_mode_stays_below_leader() {
        let mut outcomes = vec![outcome("a", 100, 10_000), outcome("b", 50, 5_000)];
        outcomes[0].top_points = 400;
        let mut bet = Bet::new(
            outcomes,
            BetSettings {
                stealth_mode: true,
                ..settings(Strategy::MostVoted)
            },
        );

        for _ in 0..50 {
            let decision = bet.calculate(100_000);
            assert!(decision.amount < 400, "amount {} >= top", decision.amount);
            assert!(decision.amount > 0);
        }
    }

    #[test]
    fn filter_decision_users_aggregates() {
        let mut bet = Bet::new(
            vec![outcome("a", 100, 10_000), outcome("b", 50, 5_000)],
            BetSettings {
                filter_condition: Some(FilterCondition {
                    by: OutcomeKey::DecisionUsers,
                    r#where: Condition::Gt,
                    value: 1_000.0,
                }),
                ..settings(Strategy::Smart)
            },
        );
        bet.calculate(10_000);
        let (skip, compared) = bet.skip();
        assert_eq!(compared, 150.0);
        assert!(skip, "150 users is not > 1000, bet must be skipped");
    }

    #[test]
    fn filter_other_keys_read_chosen_outcome() {
        let mut bet = Bet::new(
            vec![outcome("a", 100, 10_000), outcome("b", 50, 5_000)],
            BetSettings {
                filter_condition: Some(FilterCondition {
                    by: OutcomeKey::TotalUsers,
                    r#where: Condition::Gte,
                    value: 100.0,
                }),
                ..settings(Strategy::MostVoted)
            },
        );
        bet.calculate(10_000);
        let (skip, compared) = bet.skip();
        assert_eq!(compared, 100.0);
        assert!(!skip);
    }

    #[test]
    fn no_filter_never_skips() {
        let mut bet = Bet::new(
            vec![outcome("a", 1, 100), outcome("b", 1, 100)],
            settings(Strategy::MostVoted),
        );
        bet.calculate(10);
        assert_eq!(bet.skip(), (false, 0.0));
    }

    #[test]
    fn closing_bet_after() {
        let created = Utc::now();
        let event = EventPrediction::new(
            "1".into(),
            "a".into(),
            "e1".into(),
            "who wins".into(),
            created,
            54.0,
            PredictionStatus::Active,
            vec![outcome("a", 1, 10)],
            BetSettings::default(),
        );
        let after = event.closing_bet_after(created + Duration::seconds(10));
        assert_eq!(after, 44.0);
    }

    #[test]
    fn parse_result_win() {
        let mut event = EventPrediction::new(
            "1".into(),
            "a".into(),
            "e1".into(),
            "t".into(),
            Utc::now(),
            54.0,
            PredictionStatus::Active,
            vec![outcome("a", 1, 10)],
            BetSettings::default(),
        );
        event.bet.decision.amount = 500;

        let points = event.parse_result("WIN", 1_500);
        assert_eq!(points.placed, 500);
        assert_eq!(points.won, 1_500);
        assert_eq!(points.gained, 1_000);
        assert_eq!(event.result.as_ref().unwrap().result_type, "WIN");
    }

    #[test]
    fn parse_result_refund_moves_nothing() {
        let mut event = EventPrediction::new(
            "1".into(),
            "a".into(),
            "e1".into(),
            "t".into(),
            Utc::now(),
            54.0,
            PredictionStatus::Active,
            vec![outcome("a", 1, 10)],
            BetSettings::default(),
        );
        event.bet.decision.amount = 500;

        let points = event.parse_result("REFUND", 500);
        assert_eq!(points.placed, 0);
        assert_eq!(points.won, 500);
        assert_eq!(points.gained, 0);
    }

    #[test]
    fn status_parsing() {
        assert_eq!(PredictionStatus::parse("ACTIVE"), PredictionStatus::Active);
        assert_eq!(PredictionStatus::parse("LOCKED"), PredictionStatus::Locked);
        assert_eq!(
            PredictionStatus::parse("RESOLVED"),
            PredictionStatus::Resolved
        );
    }
}
