use serde_json::Value;

use crate::utils::{bool_from_value, int_from_value, string_from_value};

/// A channel community goal viewers can contribute points to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunityGoal {
    pub goal_id: String,
    pub title: String,
    pub is_in_stock: bool,
    pub points_contributed: u64,
    pub amount_needed: u64,
    pub per_stream_user_max_contribution: u64,
    pub status: String,
}

impl CommunityGoal {
    /// Builds a goal from a GQL `communityPointsSettings.goals` entry.
    pub fn from_gql(data: &Value) -> CommunityGoal {
        CommunityGoal {
            goal_id: string_from_value(data.get("id")),
            title: string_from_value(data.get("title")),
            is_in_stock: bool_from_value(data.get("isInStock")),
            points_contributed: int_from_value(data.get("pointsContributed")),
            amount_needed: int_from_value(data.get("amountNeeded")),
            per_stream_user_max_contribution: int_from_value(
                data.get("perStreamUserMaximumContribution"),
            ),
            status: string_from_value(data.get("status")),
        }
    }

    /// Builds a goal from a PubSub `community_goal` payload, which uses
    /// snake_case keys and slightly different names.
    pub fn from_pubsub(data: &Value) -> CommunityGoal {
        CommunityGoal {
            goal_id: string_from_value(data.get("id")),
            title: string_from_value(data.get("title")),
            is_in_stock: bool_from_value(data.get("is_in_stock")),
            points_contributed: int_from_value(data.get("points_contributed")),
            amount_needed: int_from_value(data.get("goal_amount")),
            per_stream_user_max_contribution: int_from_value(
                data.get("per_stream_maximum_user_contribution"),
            ),
            status: string_from_value(data.get("status")),
        }
    }

    pub fn amount_left(&self) -> u64 {
        self.amount_needed.saturating_sub(self.points_contributed)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn from_pubsub_payload() {
        let data = json!({
            "id": "g1",
            "title": "Emote slot",
            "is_in_stock": true,
            "points_contributed": 4000,
            "goal_amount": 10000,
            "per_stream_maximum_user_contribution": 2000,
            "status": "STARTED"
        });
        let goal = CommunityGoal::from_pubsub(&data);
        assert_eq!(goal.goal_id, "g1");
        assert_eq!(goal.amount_left(), 6000);
        assert_eq!(goal.per_stream_user_max_contribution, 2000);
    }

    #[test]
    fn amount_left_saturates() {
        let goal = CommunityGoal {
            points_contributed: 12_000,
            amount_needed: 10_000,
            ..Default::default()
        };
        assert_eq!(goal.amount_left(), 0);
    }
}
