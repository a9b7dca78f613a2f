//! The prediction betting engine: a timed state machine per event that
//! computes a decision from live outcome statistics and places the bet at
//! the configured offset inside the closing window.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::eyre::{eyre, Result};
use common::model::message::Message;
use common::model::prediction::{
    bet_window_seconds, EventPrediction, Outcome, PredictionStatus, MIN_BET_AMOUNT,
};
use common::model::streamer::{Streamer, REASON_PREDICTION, REASON_REFUND};
use common::model::Event;
use common::utils::{int_from_value, millify, string_from_value};
use serde_json::Value;
use tracing::{debug, warn};

use super::Miner;

pub(crate) async fn handle_predictions_channel(
    miner: &Arc<Miner>,
    msg: &Message,
    streamer: Option<Arc<Streamer>>,
) {
    let Some(streamer) = streamer else { return };
    let Some(event_dict) = msg.data_get("event") else {
        return;
    };

    let event_id = string_from_value(event_dict.get("id"));
    let status = string_from_value(event_dict.get("status"));
    if event_id.is_empty() {
        return;
    }

    match msg.msg_type.as_str() {
        "event-created" => {
            handle_prediction_created(miner, &streamer, event_dict, &event_id, &status, msg)
        }
        "event-updated" => handle_prediction_updated(miner, event_dict, &event_id, &status),
        "event-locked" => handle_prediction_locked(miner, &event_id),
        _ => {}
    }
}

/// Materializes a new ACTIVE event and schedules its one-shot bet timer.
fn handle_prediction_created(
    miner: &Arc<Miner>,
    streamer: &Arc<Streamer>,
    event_dict: &Value,
    event_id: &str,
    status: &str,
    msg: &Message,
) {
    if miner.predictions.lock().unwrap().contains_key(event_id) {
        return;
    }
    if status != "ACTIVE" {
        return;
    }

    let (is_online, make_predictions, balance, bet_settings) = {
        let state = streamer.read();
        (
            state.is_online,
            state.settings.make_predictions,
            state.channel_points,
            state.settings.bet.clone(),
        )
    };
    if !make_predictions || !is_online {
        return;
    }

    let window = common::utils::float_from_value(event_dict.get("prediction_window_seconds"));
    let actual_window = bet_window_seconds(&bet_settings, window);
    let outcomes = parse_outcomes(event_dict.get("outcomes"));
    let title = string_from_value(event_dict.get("title"));
    let created_at = string_from_value(event_dict.get("created_at"));
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let event = EventPrediction::new(
        streamer.channel_id.clone(),
        streamer.login.clone(),
        event_id.to_owned(),
        title.clone(),
        created_at,
        actual_window,
        PredictionStatus::Active,
        outcomes,
        bet_settings.clone(),
    );

    let seconds_until_close = event.closing_bet_after(msg.timestamp);
    if seconds_until_close <= 0.0 {
        debug!(
            streamer = %streamer.login,
            event_id,
            "Prediction window already closed"
        );
        return;
    }

    if bet_settings.minimum_points > 0 && balance < bet_settings.minimum_points {
        miner.emit(
            Event::BetFilters,
            format!(
                "{}: insufficient points for bet ({balance} < {})",
                streamer.login, bet_settings.minimum_points
            ),
        );
        return;
    }

    miner
        .predictions
        .lock()
        .unwrap()
        .insert(event_id.to_owned(), Arc::new(Mutex::new(event)));

    miner.emit(
        Event::BetStart,
        format!(
            "{}: placing bet on {title:?} in {seconds_until_close:.0}s",
            streamer.login
        ),
    );

    let timer = {
        let miner = Arc::clone(miner);
        let streamer = Arc::clone(streamer);
        let event_id = event_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(seconds_until_close)).await;

            miner.pending_timers.lock().unwrap().remove(&event_id);

            let event = miner.predictions.lock().unwrap().get(&event_id).cloned();
            let Some(event) = event else { return };

            if let Err(err) = miner.place_bet(&streamer, &event).await {
                warn!(
                    streamer = %streamer.login,
                    event_id,
                    "Failed to place prediction: {err:#}"
                );
                miner.emit(
                    Event::BetFailed,
                    format!("{}: bet failed ({err:#})", streamer.login),
                );
            }
        })
    };

    miner
        .pending_timers
        .lock()
        .unwrap()
        .insert(event_id.to_owned(), timer);
}

/// Outcome statistics only move while no bet has been placed and no choice
/// has been made.
fn handle_prediction_updated(miner: &Miner, event_dict: &Value, event_id: &str, status: &str) {
    let Some(event) = miner.predictions.lock().unwrap().get(event_id).cloned() else {
        return;
    };

    let mut event = event.lock().unwrap();
    event.status = PredictionStatus::parse(status);

    if !event.bet_placed && event.bet.decision.choice.is_none() {
        let outcomes = parse_outcomes(event_dict.get("outcomes"));
        event.bet.update_outcomes(outcomes);
    }
}

fn handle_prediction_locked(miner: &Miner, event_id: &str) {
    let Some(event) = miner.predictions.lock().unwrap().get(event_id).cloned() else {
        return;
    };
    event.lock().unwrap().status = PredictionStatus::Locked;
    debug!(event_id, "Prediction locked");
}

/// User-channel echoes: the placement confirmation ("prediction-made") and
/// the final result. Results for events the engine never saw are discarded.
pub(crate) async fn handle_predictions_user(
    miner: &Miner,
    msg: &Message,
    streamer: Option<Arc<Streamer>>,
) {
    let Some(prediction) = msg.data_get("prediction") else {
        return;
    };
    let event_id = string_from_value(prediction.get("event_id"));

    let Some(event) = miner.predictions.lock().unwrap().get(&event_id).cloned() else {
        debug!(event_id, "Message for unknown prediction event, discarding");
        return;
    };

    match msg.msg_type.as_str() {
        "prediction-made" => {
            event.lock().unwrap().bet_confirmed = true;
            debug!(event_id, "Prediction confirmed");
        }
        "prediction-result" => {
            handle_prediction_result(miner, &event_id, &event, prediction, streamer)
        }
        _ => {}
    }
}

fn handle_prediction_result(
    miner: &Miner,
    event_id: &str,
    event: &Arc<Mutex<EventPrediction>>,
    prediction: &Value,
    streamer: Option<Arc<Streamer>>,
) {
    if !event.lock().unwrap().bet_confirmed {
        return;
    }

    let Some(result) = prediction.get("result") else {
        return;
    };
    let result_type = string_from_value(result.get("type"));
    let points_won = int_from_value(result.get("points_won")) as i64;

    let (points, title, choice_str, description) = {
        let mut event = event.lock().unwrap();
        event.status = PredictionStatus::Resolved;
        let points = event.parse_result(&result_type, points_won);

        let choice_str = match event.bet.decision.choice {
            Some(choice) if choice < event.bet.outcomes.len() => {
                let chosen = &event.bet.outcomes[choice];
                format!("{} ({})", chosen.title, chosen.color)
            }
            _ => "unknown".to_owned(),
        };
        let description = event
            .result
            .as_ref()
            .map(|r| r.description.clone())
            .unwrap_or_default();
        (points, event.title.clone(), choice_str, description)
    };

    // Stop the timer before deleting the event so a pending fire can never
    // dereference a removed id.
    if let Some(timer) = miner.pending_timers.lock().unwrap().remove(event_id) {
        timer.abort();
    }

    let notify_event = match result_type.as_str() {
        "WIN" => Event::BetWin,
        "LOSE" => Event::BetLose,
        "REFUND" => Event::BetRefund,
        _ => Event::BetGeneral,
    };

    let streamer_name = streamer
        .as_ref()
        .map(|s| s.login.as_str())
        .unwrap_or("unknown");
    miner.emit(
        notify_event,
        format!("{streamer_name}: {title:?} [{choice_str}] {description}"),
    );

    if let Some(streamer) = streamer {
        let mut state = streamer.write();
        match result_type.as_str() {
            "WIN" => state.update_history(REASON_PREDICTION, points.won, 1),
            "LOSE" => state.update_history(REASON_PREDICTION, points.gained, 1),
            "REFUND" => state.update_history(REASON_REFUND, points.won, 1),
            _ => {}
        }
    }

    // Resolved events leave the live map immediately.
    miner.predictions.lock().unwrap().remove(event_id);
}

impl Miner {
    /// Computes the decision and places the bet. At most one placement
    /// attempt per event; failures are reported and never retried.
    pub(crate) async fn place_bet(
        &self,
        streamer: &Arc<Streamer>,
        event: &Arc<Mutex<EventPrediction>>,
    ) -> Result<()> {
        let balance = streamer.read().channel_points;

        let (event_id, title, decision, skip, compared_value, filter) = {
            let mut event = event.lock().unwrap();

            if event.status != PredictionStatus::Active {
                debug!(
                    streamer = %streamer.login,
                    event_id = %event.event_id,
                    status = %event.status,
                    "Event is no longer active"
                );
                return Err(eyre!("Event {} is not active anymore", event.event_id));
            }

            let decision = event.bet.calculate(balance);
            let (skip, compared_value) = event.bet.skip();
            (
                event.event_id.clone(),
                event.title.clone(),
                decision,
                skip,
                compared_value,
                event.bet.settings.filter_condition.clone(),
            )
        };

        if skip {
            self.emit(
                Event::BetFilters,
                match filter {
                    Some(filter) => format!(
                        "{}: skipping bet on {title:?} ({filter}, current {compared_value:.2})",
                        streamer.login
                    ),
                    None => format!("{}: skipping bet on {title:?}", streamer.login),
                },
            );
            return Ok(());
        }

        if decision.amount < MIN_BET_AMOUNT {
            debug!(
                streamer = %streamer.login,
                amount = decision.amount,
                "Bet amount below minimum, skipping"
            );
            return Ok(());
        }

        self.emit(
            Event::BetGeneral,
            format!(
                "{}: betting {} on {title:?}",
                streamer.login,
                millify(decision.amount as i64, 2)
            ),
        );

        if !self.simulate {
            self.api
                .gql()
                .make_prediction(&event_id, &decision.outcome_id, decision.amount)
                .await?;
        }

        event.lock().unwrap().bet_placed = true;
        debug!(
            streamer = %streamer.login,
            event_id,
            outcome = decision.outcome_id,
            amount = decision.amount,
            "Prediction placed"
        );
        Ok(())
    }
}

/// Parses the outcome list of a prediction payload. `top_points` falls back
/// to the first top-predictor entry when absent.
fn parse_outcomes(raw: Option<&Value>) -> Vec<Outcome> {
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|item| {
            if !item.is_object() {
                return None;
            }
            let mut outcome = Outcome {
                id: string_from_value(item.get("id")),
                title: string_from_value(item.get("title")),
                color: string_from_value(item.get("color")),
                total_users: int_from_value(item.get("total_users")),
                total_points: int_from_value(item.get("total_points")),
                top_points: int_from_value(item.get("top_points")),
                ..Default::default()
            };

            if outcome.top_points == 0 {
                if let Some(predictors) = item.get("top_predictors").and_then(|v| v.as_array()) {
                    if let Some(first) = predictors.first() {
                        outcome.top_points = int_from_value(first.get("points"));
                    }
                }
            }

            Some(outcome)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use common::model::prediction::{BetSettings, DelayMode, Strategy};
    use common::model::streamer::StreamerSettings;

    use super::super::test_support::{add_test_streamer, offline_miner};
    use super::*;

    fn betting_streamer(miner: &Arc<Miner>, balance: u64) -> Arc<Streamer> {
        let streamer = add_test_streamer(miner, "caster", "42");
        {
            let mut state = streamer.write();
            state.settings = StreamerSettings {
                make_predictions: true,
                bet: BetSettings {
                    strategy: Strategy::Smart,
                    percentage: 5,
                    delay: 6.0,
                    delay_mode: DelayMode::FromEnd,
                    ..Default::default()
                },
                ..Default::default()
            };
            state.set_online();
            state.channel_points = balance;
        }
        streamer
    }

    fn created_message(created_at: DateTime<Utc>, window: u64) -> Message {
        let inner = serde_json::json!({
            "type": "event-created",
            "data": {
                "timestamp": created_at.to_rfc3339(),
                "event": {
                    "id": "event-1",
                    "channel_id": "42",
                    "title": "Who wins?",
                    "status": "ACTIVE",
                    "created_at": created_at.to_rfc3339(),
                    "prediction_window_seconds": window,
                    "outcomes": [
                        {"id": "a", "title": "A", "color": "BLUE",
                         "total_users": 100, "total_points": 10000, "top_predictors": []},
                        {"id": "b", "title": "B", "color": "PINK",
                         "total_users": 50, "total_points": 5000, "top_predictors": []}
                    ]
                }
            }
        });
        Message::parse("predictions-channel-v1.42", &inner.to_string()).unwrap()
    }

    fn result_message(result_type: &str, points_won: u64) -> Message {
        let inner = serde_json::json!({
            "type": "prediction-result",
            "data": {
                "timestamp": Utc::now().to_rfc3339(),
                "prediction": {
                    "event_id": "event-1",
                    "channel_id": "42",
                    "result": {"type": result_type, "points_won": points_won}
                }
            }
        });
        Message::parse("predictions-user-v1.9", &inner.to_string()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn bet_placed_at_end_of_window() {
        let miner = offline_miner();
        betting_streamer(&miner, 10_000);

        miner
            .clone()
            .handle_message(created_message(Utc::now(), 60))
            .await;

        assert!(miner.predictions.lock().unwrap().contains_key("event-1"));
        assert!(miner.pending_timers.lock().unwrap().contains_key("event-1"));

        // window 60, delay 6 FROM_END: the single placement happens at 54s.
        tokio::time::sleep(Duration::from_secs(53)).await;
        {
            let events = miner.predictions.lock().unwrap();
            assert!(!events["event-1"].lock().unwrap().bet_placed);
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        {
            let events = miner.predictions.lock().unwrap();
            let event = events["event-1"].lock().unwrap();
            assert!(event.bet_placed);
            assert_eq!(event.bet.decision.outcome_id, "a");
            assert_eq!(event.bet.decision.amount, 500);
        }
        assert!(
            !miner.pending_timers.lock().unwrap().contains_key("event-1"),
            "fired timer removed its slot"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skip_by_filter_places_nothing() {
        use common::model::prediction::{Condition, FilterCondition, OutcomeKey};

        let miner = offline_miner();
        let streamer = betting_streamer(&miner, 10_000);
        streamer.write().settings.bet.filter_condition = Some(FilterCondition {
            by: OutcomeKey::DecisionUsers,
            r#where: Condition::Gt,
            value: 1000.0,
        });

        miner
            .clone()
            .handle_message(created_message(Utc::now(), 60))
            .await;
        tokio::time::sleep(Duration::from_secs(55)).await;

        let events = miner.predictions.lock().unwrap();
        let event = events["event-1"].lock().unwrap();
        assert!(!event.bet_placed, "150 users <= 1000 means the bet is skipped");
    }

    #[tokio::test]
    async fn closed_window_is_discarded() {
        let miner = offline_miner();
        betting_streamer(&miner, 10_000);

        let stale = Utc::now() - chrono::Duration::seconds(120);
        miner.clone().handle_message(created_message(stale, 60)).await;

        assert!(miner.predictions.lock().unwrap().is_empty());
        assert!(miner.pending_timers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn below_minimum_points_is_discarded() {
        let miner = offline_miner();
        let streamer = betting_streamer(&miner, 100);
        streamer.write().settings.bet.minimum_points = 1_000;

        miner
            .clone()
            .handle_message(created_message(Utc::now(), 60))
            .await;
        assert!(miner.predictions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_streamer_is_ignored() {
        let miner = offline_miner();
        let streamer = betting_streamer(&miner, 10_000);
        streamer.write().set_offline();

        miner
            .clone()
            .handle_message(created_message(Utc::now(), 60))
            .await;
        assert!(miner.predictions.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn updates_mutate_outcomes_until_choice_is_made() {
        let miner = offline_miner();
        betting_streamer(&miner, 10_000);
        miner
            .clone()
            .handle_message(created_message(Utc::now(), 600))
            .await;

        let updated = serde_json::json!({
            "type": "event-updated",
            "data": {
                "timestamp": Utc::now().to_rfc3339(),
                "event": {
                    "id": "event-1",
                    "channel_id": "42",
                    "status": "ACTIVE",
                    "outcomes": [
                        {"id": "a", "title": "A", "color": "BLUE",
                         "total_users": 300, "total_points": 30000, "top_predictors": []},
                        {"id": "b", "title": "B", "color": "PINK",
                         "total_users": 60, "total_points": 6000, "top_predictors": []}
                    ]
                }
            }
        });
        miner
            .clone()
            .handle_message(
                Message::parse("predictions-channel-v1.42", &updated.to_string()).unwrap(),
            )
            .await;

        {
            let events = miner.predictions.lock().unwrap();
            let event = events["event-1"].lock().unwrap();
            assert_eq!(event.bet.outcomes[0].total_users, 300);
            assert_eq!(event.bet.total_points, 36_000);
        }

        // Once a choice exists, updates stop mutating the statistics.
        {
            let events = miner.predictions.lock().unwrap();
            let mut event = events["event-1"].lock().unwrap();
            event.bet.calculate(1_000);
        }
        let frozen = serde_json::json!({
            "type": "event-updated",
            "data": {
                "timestamp": Utc::now().to_rfc3339(),
                "event": {
                    "id": "event-1", "channel_id": "42", "status": "LOCKED",
                    "outcomes": [
                        {"id": "a", "title": "A", "color": "BLUE",
                         "total_users": 9999, "total_points": 1, "top_predictors": []},
                        {"id": "b", "title": "B", "color": "PINK",
                         "total_users": 1, "total_points": 1, "top_predictors": []}
                    ]
                }
            }
        });
        miner
            .clone()
            .handle_message(
                Message::parse("predictions-channel-v1.42", &frozen.to_string()).unwrap(),
            )
            .await;

        let events = miner.predictions.lock().unwrap();
        let event = events["event-1"].lock().unwrap();
        assert_eq!(event.bet.outcomes[0].total_users, 300);
        assert_eq!(event.status, PredictionStatus::Locked);
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_cleans_up_event_and_timer() {
        let miner = offline_miner();
        let streamer = betting_streamer(&miner, 10_000);

        miner
            .clone()
            .handle_message(created_message(Utc::now(), 600))
            .await;

        // Confirm the placement through the user-channel echo.
        let made = serde_json::json!({
            "type": "prediction-made",
            "data": {
                "timestamp": Utc::now().to_rfc3339(),
                "prediction": {"event_id": "event-1", "channel_id": "42"}
            }
        });
        miner
            .clone()
            .handle_message(Message::parse("predictions-user-v1.9", &made.to_string()).unwrap())
            .await;
        {
            let events = miner.predictions.lock().unwrap();
            let mut event = events["event-1"].lock().unwrap();
            assert!(event.bet_confirmed);
            event.bet.decision.amount = 500;
        }

        miner.clone().handle_message(result_message("WIN", 1500)).await;

        assert!(miner.predictions.lock().unwrap().is_empty());
        assert!(miner.pending_timers.lock().unwrap().is_empty());
        assert_eq!(streamer.read().history[REASON_PREDICTION].amount, 1500);
    }

    #[tokio::test]
    async fn unconfirmed_result_is_ignored() {
        let miner = offline_miner();
        betting_streamer(&miner, 10_000);
        miner
            .clone()
            .handle_message(created_message(Utc::now(), 600))
            .await;

        miner.clone().handle_message(result_message("WIN", 1500)).await;
        assert!(
            miner.predictions.lock().unwrap().contains_key("event-1"),
            "result without confirmation leaves the event in place"
        );
    }

    #[tokio::test]
    async fn result_for_unknown_event_is_discarded() {
        let miner = offline_miner();
        betting_streamer(&miner, 10_000);
        miner.clone().handle_message(result_message("WIN", 100)).await;
        assert!(miner.predictions.lock().unwrap().is_empty());
    }

    #[test]
    fn outcome_parsing_with_top_predictor_fallback() {
        let raw = serde_json::json!([
            {"id": "a", "title": "A", "color": "BLUE",
             "total_users": "10", "total_points": 1000.0,
             "top_predictors": [{"points": 250}]},
            {"id": "b", "title": "B", "color": "PINK",
             "total_users": 5, "total_points": 500, "top_points": 100,
             "top_predictors": []}
        ]);
        let outcomes = parse_outcomes(Some(&raw));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].total_users, 10, "quoted number coerces");
        assert_eq!(outcomes[0].top_points, 250, "falls back to top predictor");
        assert_eq!(outcomes[1].top_points, 100);
    }
}
