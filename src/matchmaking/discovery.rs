//! Finding and validating an opponent in the shared queue

use std::sync::Arc;

use tracing::debug;

use super::model::{QueueDoc, QUEUE_COLLECTION};
use super::queue::QueueEntries;
use crate::store::{Change, ChangeKind, DocumentId, DocumentStore, Filter, StoreError, Subscription};

/// Why a candidate was not taken
#[derive(Debug)]
pub enum Rejection {
    OwnEntry,
    SamePrincipal,
    Missing,
    Stale { age_ms: u64 },
    NotSearching,
    Unreadable(StoreError),
}

pub struct OpponentDiscovery {
    store: Arc<dyn DocumentStore>,
    queue: QueueEntries,
    staleness_ms: u64,
}

impl OpponentDiscovery {
    pub fn new(store: Arc<dyn DocumentStore>, queue: QueueEntries, staleness_ms: u64) -> Self {
        Self {
            store,
            queue,
            staleness_ms,
        }
    }

    /// Searching entries of other principals that look fresh, oldest first
    pub async fn candidates(
        &self,
        own_entry: &DocumentId,
        user_id: &str,
    ) -> Result<Vec<QueueDoc>, StoreError> {
        let now = self.queue.now();
        let mut candidates: Vec<QueueDoc> = self
            .queue
            .searching()
            .await?
            .into_iter()
            .filter(|doc| &doc.id != own_entry && doc.entry.user_id != user_id)
            .filter(|doc| !doc.entry.is_stale(now, self.staleness_ms))
            .collect();
        candidates.sort_by(|a, b| (a.entry.timestamp, &a.id).cmp(&(b.entry.timestamp, &b.id)));
        Ok(candidates)
    }

    /// Re-read the candidate and accept it only if it still exists, is
    /// searching, belongs to someone else, and is within the staleness bound
    pub async fn validate(
        &self,
        own_entry: &DocumentId,
        user_id: &str,
        candidate: &DocumentId,
    ) -> Result<QueueDoc, Rejection> {
        if candidate == own_entry {
            return Err(Rejection::OwnEntry);
        }

        let doc = match self.queue.fetch(candidate).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Err(Rejection::Missing),
            Err(e) => return Err(Rejection::Unreadable(e)),
        };

        if doc.entry.user_id == user_id {
            return Err(Rejection::SamePrincipal);
        }

        let age_ms = doc.entry.age(self.queue.now());
        if age_ms > self.staleness_ms {
            return Err(Rejection::Stale { age_ms });
        }

        if !doc.entry.is_searching() {
            return Err(Rejection::NotSearching);
        }

        Ok(doc)
    }

    /// Live feed of searching entries
    pub async fn watch(&self) -> Result<Subscription, StoreError> {
        self.store
            .subscribe(QUEUE_COLLECTION, vec![Filter::eq("status", "searching")])
            .await
    }

    /// Candidate id carried by a live change, if it is worth a look
    pub fn candidate_from_change(
        change: &Change,
        own_entry: &DocumentId,
        user_id: &str,
    ) -> Option<DocumentId> {
        if change.kind != ChangeKind::Added || &change.document.id == own_entry {
            return None;
        }

        let owner = change.document.field("userId").and_then(|v| v.as_str());
        if owner == Some(user_id) {
            debug!(entry_id = %change.document.id, "Ignoring own duplicate entry");
            return None;
        }

        Some(change.document.id.clone())
    }
}
