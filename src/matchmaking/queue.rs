//! Lifecycle of this client's own queue entry

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::model::{session_id, QueueDoc, QueueEntry, QUEUE_COLLECTION};
use crate::config::MatchmakingConfig;
use crate::identity::Principal;
use crate::store::{DocumentId, DocumentStore, Filter, StoreError};
use crate::util::time::Clock;

/// Creates, refreshes, classifies and removes queue entries.
/// Every write here targets documents owned by the principal passed in.
#[derive(Clone)]
pub struct QueueEntries {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: Arc<MatchmakingConfig>,
}

impl QueueEntries {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: Arc<MatchmakingConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Ensure exactly one fresh searching entry exists for `principal`.
    ///
    /// A fresh entry is refreshed in place and every other entry of the same
    /// principal is deleted. Otherwise a new entry is created; if another
    /// client of the same principal raced us, both converge on the newest.
    pub async fn upsert(&self, principal: &Principal) -> Result<DocumentId, StoreError> {
        let now = self.clock.now_millis();
        let own = self.own_entries(&principal.user_id).await?;

        if let Some(keep) = newest_fresh(&own, now, self.config.discovery_staleness_millis()) {
            let keep_id = keep.id.clone();
            self.store
                .update(
                    QUEUE_COLLECTION,
                    &keep_id,
                    json!({
                        "username": principal.display_name,
                        "timestamp": now,
                        "lastHeartbeat": now,
                        "status": "searching",
                        "sessionId": session_id(&principal.user_id, now),
                    }),
                )
                .await?;
            self.remove_all_except(&own, &keep_id).await;

            info!(user_id = %principal.user_id, entry_id = %keep_id, "Refreshed existing queue entry");
            return Ok(keep_id);
        }

        for stale in &own {
            self.remove(&stale.id).await;
        }

        let entry = QueueEntry::searching(principal, self.config.default_rating, now);
        let created = self
            .store
            .create(QUEUE_COLLECTION, serde_json::to_value(&entry)?)
            .await?;

        // Another tab of the same principal may have created one concurrently
        let own = self.own_entries(&principal.user_id).await?;
        let winner = newest_fresh(&own, now, self.config.discovery_staleness_millis())
            .map(|doc| doc.id.clone())
            .unwrap_or_else(|| created.clone());
        self.remove_all_except(&own, &winner).await;

        if winner != created {
            debug!(user_id = %principal.user_id, entry_id = %winner, "Converged on concurrent queue entry");
        }
        info!(user_id = %principal.user_id, entry_id = %winner, "Joined matchmaking queue");
        Ok(winner)
    }

    /// Refresh liveness of an owned entry
    pub async fn heartbeat(&self, entry_id: &DocumentId) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        self.store
            .update(QUEUE_COLLECTION, entry_id, json!({ "lastHeartbeat": now }))
            .await?;
        debug!(entry_id = %entry_id, "Heartbeat");
        Ok(())
    }

    /// Best-effort delete; the entry may already be gone
    pub async fn remove(&self, entry_id: &DocumentId) {
        match self.store.delete(QUEUE_COLLECTION, entry_id).await {
            Ok(()) => debug!(entry_id = %entry_id, "Removed queue entry"),
            Err(e) if e.is_permission_denied() => {
                debug!(entry_id = %entry_id, error = %e, "Queue entry not removable by this client")
            }
            Err(e) => warn!(entry_id = %entry_id, error = %e, "Failed to remove queue entry"),
        }
    }

    pub async fn fetch(&self, entry_id: &DocumentId) -> Result<Option<QueueDoc>, StoreError> {
        match self.store.get(QUEUE_COLLECTION, entry_id).await? {
            Some(doc) => QueueDoc::from_document(&doc).map(Some),
            None => Ok(None),
        }
    }

    pub async fn own_entries(&self, user_id: &str) -> Result<Vec<QueueDoc>, StoreError> {
        let docs = self
            .store
            .query(QUEUE_COLLECTION, &[Filter::eq("userId", user_id)])
            .await?;
        Ok(decode_all(&docs))
    }

    /// Every entry currently marked searching
    pub async fn searching(&self) -> Result<Vec<QueueDoc>, StoreError> {
        let docs = self
            .store
            .query(QUEUE_COLLECTION, &[Filter::eq("status", "searching")])
            .await?;
        Ok(decode_all(&docs))
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    async fn remove_all_except(&self, own: &[QueueDoc], keep: &DocumentId) {
        for duplicate in own.iter().filter(|doc| &doc.id != keep) {
            debug!(entry_id = %duplicate.id, "Removing duplicate queue entry");
            self.remove(&duplicate.id).await;
        }
    }
}

pub(crate) fn decode_all(docs: &[crate::store::Document]) -> Vec<QueueDoc> {
    docs.iter()
        .filter_map(|doc| match QueueDoc::from_document(doc) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(entry_id = %doc.id, error = %e, "Skipping malformed queue entry");
                None
            }
        })
        .collect()
}

fn newest_fresh(entries: &[QueueDoc], now: u64, staleness_ms: u64) -> Option<&QueueDoc> {
    entries
        .iter()
        .filter(|doc| doc.entry.is_searching() && !doc.entry.is_stale(now, staleness_ms))
        .max_by(|a, b| {
            (a.entry.timestamp, &a.id).cmp(&(b.entry.timestamp, &b.id))
        })
}
