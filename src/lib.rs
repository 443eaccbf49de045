//! Arena matchmaker - pairs two browser clients through a shared realtime
//! document store
//!
//! Each client runs a [`MatchmakingCoordinator`] that:
//! - publishes a heartbeated presence entry in `matchmaking_queue`
//! - discovers fresh opponents by scan and by live subscription
//! - commits exactly one `matches` document per pair in a transaction
//! - listens for matches created by the opponent

pub mod config;
pub mod identity;
pub mod matchmaking;
pub mod store;
pub mod util;

pub use config::MatchmakingConfig;
pub use identity::{IdentityProvider, LocalIdentity, Principal};
pub use matchmaking::{Match, MatchmakingCoordinator, MatchmakingError, SessionState};
pub use store::{DocumentStore, MemoryStore};
