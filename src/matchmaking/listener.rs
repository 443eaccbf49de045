//! Notification of matches addressed to this client

use futures::stream::{self, Select, StreamExt};
use tracing::warn;

use super::model::{Match, MATCHES_COLLECTION};
use crate::store::{ChangeKind, DocumentStore, Filter, StoreError, Subscription};

/// Participant slots a match can name this client in
const PLAYER_SLOTS: [&str; 2] = ["player1.userId", "player2.userId"];

fn addressed_to(slot: &str, user_id: &str) -> Vec<Filter> {
    vec![Filter::eq(slot, user_id), Filter::eq("status", "ready")]
}

/// Merged feed of the two per-slot subscriptions (the store has no OR query)
pub struct MatchFeed {
    inner: Select<Subscription, Subscription>,
}

impl MatchFeed {
    /// Subscribe to ready matches naming `user_id` in either slot
    pub async fn attach(store: &dyn DocumentStore, user_id: &str) -> Result<Self, StoreError> {
        let as_player1 = store
            .subscribe(MATCHES_COLLECTION, addressed_to(PLAYER_SLOTS[0], user_id))
            .await?;
        let as_player2 = store
            .subscribe(MATCHES_COLLECTION, addressed_to(PLAYER_SLOTS[1], user_id))
            .await?;

        Ok(Self {
            inner: stream::select(as_player1, as_player2),
        })
    }

    /// Next newly added match; `None` once both subscriptions closed
    pub async fn next_match(&mut self) -> Option<Match> {
        while let Some(change) = self.inner.next().await {
            if change.kind != ChangeKind::Added {
                continue;
            }
            match Match::from_document(&change.document) {
                Ok(record) => return Some(record),
                Err(e) => {
                    warn!(match_id = %change.document.id, error = %e, "Skipping malformed match")
                }
            }
        }
        None
    }
}

/// One-shot read of ready matches naming `user_id`, oldest first
pub async fn poll_matches(store: &dyn DocumentStore, user_id: &str) -> Result<Vec<Match>, StoreError> {
    let mut found = Vec::new();
    for slot in PLAYER_SLOTS {
        for doc in store
            .query(MATCHES_COLLECTION, &addressed_to(slot, user_id))
            .await?
        {
            match Match::from_document(&doc) {
                Ok(record) => found.push(record),
                Err(e) => warn!(match_id = %doc.id, error = %e, "Skipping malformed match"),
            }
        }
    }
    found.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    Ok(found)
}

/// A match belongs to the current session only if created after it began
pub fn is_current_session(record: &Match, joined_at: u64) -> bool {
    record.created_at > joined_at
}
