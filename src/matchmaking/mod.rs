//! Matchmaking over the shared queue and match collections

pub mod coordinator;
pub mod creation;
pub mod discovery;
pub mod janitor;
pub mod listener;
pub mod model;
pub mod queue;
pub mod state;

pub use coordinator::{MatchmakingCoordinator, MatchmakingError};
pub use janitor::{StaleSweeper, SweepReport, SweepScope};
pub use model::{security_rules, Match, MatchStatus, PlayerInfo, QueueEntry, MATCHES_COLLECTION, QUEUE_COLLECTION};
pub use state::SessionState;
