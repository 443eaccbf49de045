//! Queue and match documents as stored in the shared collections

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Principal;
use crate::store::{Document, DocumentId, OwnershipRule, StoreError};
use crate::util::time::format_millis;

/// Shared collection of searching clients
pub const QUEUE_COLLECTION: &str = "matchmaking_queue";
/// Shared collection of committed pairings
pub const MATCHES_COLLECTION: &str = "matches";

/// Rating assumed when a stored entry carries none
pub const DEFAULT_RATING: f64 = 1000.0;

fn default_rating() -> f64 {
    DEFAULT_RATING
}

/// Ownership rules the hosted store enforces for these collections
pub fn security_rules() -> Vec<OwnershipRule> {
    vec![
        OwnershipRule::new(QUEUE_COLLECTION, "userId", &["userId"]),
        OwnershipRule::new(
            MATCHES_COLLECTION,
            "player1.userId",
            &["player1.userId", "player2.userId"],
        ),
    ]
}

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Searching,
    /// Any status this client does not act on
    #[serde(other)]
    Other,
}

/// One principal's presence in the searching queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub user_id: String,
    pub username: String,
    #[serde(default = "default_rating")]
    pub rating: f64,
    pub timestamp: u64,
    #[serde(default)]
    pub last_heartbeat: u64,
    pub status: QueueStatus,
    #[serde(default)]
    pub session_id: String,
}

impl QueueEntry {
    pub fn searching(principal: &Principal, rating: f64, now: u64) -> Self {
        Self {
            user_id: principal.user_id.clone(),
            username: principal.display_name.clone(),
            rating,
            timestamp: now,
            last_heartbeat: now,
            status: QueueStatus::Searching,
            session_id: session_id(&principal.user_id, now),
        }
    }

    /// Most recent proof of life
    pub fn last_seen(&self) -> u64 {
        self.last_heartbeat.max(self.timestamp)
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_seen())
    }

    pub fn is_stale(&self, now: u64, threshold_ms: u64) -> bool {
        self.age(now) > threshold_ms
    }

    pub fn is_searching(&self) -> bool {
        self.status == QueueStatus::Searching
    }

    pub fn player_info(&self) -> PlayerInfo {
        PlayerInfo {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            rating: self.rating,
            timestamp: self.timestamp,
        }
    }
}

/// Freshness token distinguishing reused entries across reconnects
pub fn session_id(user_id: &str, timestamp: u64) -> String {
    format!("{}_{}", user_id, timestamp)
}

/// Queue entry together with its document id
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDoc {
    pub id: DocumentId,
    pub entry: QueueEntry,
}

impl QueueDoc {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        Ok(Self {
            id: doc.id.clone(),
            entry: doc.decode()?,
        })
    }
}

/// A participant as recorded in a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub user_id: String,
    pub username: String,
    #[serde(default = "default_rating")]
    pub rating: f64,
    pub timestamp: u64,
}

/// Match status; matchmaking only ever writes `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStatus {
    Waiting,
    Ready,
    InProgress,
    Completed,
}

/// A committed pairing of two principals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Store-assigned; not part of the stored body
    #[serde(skip)]
    pub id: DocumentId,
    /// Always the principal whose transaction created the match
    pub player1: PlayerInfo,
    pub player2: PlayerInfo,
    pub status: MatchStatus,
    pub created_at: u64,
}

impl Match {
    pub fn ready(player1: PlayerInfo, player2: PlayerInfo, created_at: u64) -> Self {
        Self {
            id: DocumentId::default(),
            player1,
            player2,
            status: MatchStatus::Ready,
            created_at,
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let mut record: Match = doc.decode()?;
        record.id = doc.id.clone();
        Ok(record)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.player1.user_id == user_id || self.player2.user_id == user_id
    }

    pub fn opponent_of(&self, user_id: &str) -> Option<&PlayerInfo> {
        if self.player1.user_id == user_id {
            Some(&self.player2)
        } else if self.player2.user_id == user_id {
            Some(&self.player1)
        } else {
            None
        }
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "match {}: {} ({}) vs {} ({}) created {}",
            self.id,
            self.player1.username,
            self.player1.rating,
            self.player2.username,
            self.player2.rating,
            format_millis(self.created_at)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_uses_camel_case_fields() {
        let entry = QueueEntry::searching(&Principal::new("u1", "Ada"), 1200.0, 5_000);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["lastHeartbeat"], 5_000);
        assert_eq!(value["status"], "searching");
        assert_eq!(value["sessionId"], "u1_5000");
    }

    #[test]
    fn missing_rating_defaults() {
        let entry: QueueEntry = serde_json::from_value(json!({
            "userId": "u1",
            "username": "Ada",
            "timestamp": 1,
            "status": "searching"
        }))
        .unwrap();
        assert_eq!(entry.rating, DEFAULT_RATING);
        assert_eq!(entry.last_heartbeat, 0);
    }

    #[test]
    fn fractional_rating_is_kept() {
        let entry: QueueEntry = serde_json::from_value(json!({
            "userId": "u1",
            "username": "Ada",
            "rating": 1234.5,
            "timestamp": 1,
            "status": "searching"
        }))
        .unwrap();
        assert_eq!(entry.rating, 1234.5);
        assert_eq!(entry.player_info().rating, 1234.5);
    }

    #[test]
    fn unknown_status_is_not_searching() {
        let entry: QueueEntry = serde_json::from_value(json!({
            "userId": "u1",
            "username": "Ada",
            "timestamp": 1,
            "status": "matched"
        }))
        .unwrap();
        assert!(!entry.is_searching());
    }

    #[test]
    fn staleness_uses_latest_liveness_signal() {
        let mut entry = QueueEntry::searching(&Principal::new("u1", "Ada"), 1000.0, 10_000);
        entry.last_heartbeat = 40_000;
        assert!(!entry.is_stale(70_000, 30_000));
        assert!(entry.is_stale(70_001, 30_000));
    }

    #[test]
    fn match_status_is_kebab_case() {
        let value = serde_json::to_value(MatchStatus::InProgress).unwrap();
        assert_eq!(value, "in-progress");
    }

    #[test]
    fn opponent_is_the_other_player() {
        let a = QueueEntry::searching(&Principal::new("a", "A"), 1000.0, 1).player_info();
        let b = QueueEntry::searching(&Principal::new("b", "B"), 1000.0, 1).player_info();
        let record = Match::ready(a, b, 2);
        assert_eq!(record.opponent_of("a").unwrap().user_id, "b");
        assert!(record.opponent_of("c").is_none());
        assert!(!serde_json::to_value(&record).unwrap().as_object().unwrap().contains_key("id"));
    }
}
