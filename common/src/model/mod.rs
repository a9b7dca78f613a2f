pub mod campaign;
pub mod events;
pub mod goal;
pub mod message;
pub mod prediction;
pub mod registry;
pub mod stream;
pub mod streamer;
pub mod topic;

pub use campaign::{Campaign, Drop};
pub use events::{Event, FollowersOrder, Priority};
pub use goal::CommunityGoal;
pub use message::Message;
pub use prediction::{
    bet_window_seconds, Bet, BetDecision, BetSettings, Condition, DelayMode, EventPrediction,
    FilterCondition, Outcome, OutcomeKey, PredictionStatus, Strategy, MIN_BET_AMOUNT,
};
pub use stream::{GameInfo, Stream, Tag};
pub use streamer::{
    should_join_chat, ChatPresence, HistoryEntry, PointsMultiplier, Raid, Streamer,
    StreamerSettings, StreamerState,
};
pub use topic::{PubSubTopic, TopicKind, TopicTarget};
