//! Transactional match creation

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::model::{Match, QueueEntry, MATCHES_COLLECTION, QUEUE_COLLECTION};
use crate::store::{DocumentId, DocumentStore, StoreError, Transaction};
use crate::util::time::Clock;

#[derive(Debug)]
pub enum CreationOutcome {
    Created(Match),
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    OwnEntryMissing,
    CandidateMissing,
    OwnEntryNotSearching,
    CandidateNotSearching,
    OwnEntryStale,
    CandidateStale,
    SamePrincipal,
    /// Every attempt lost to a concurrent writer
    Contended,
    Denied(String),
    Failed(String),
}

/// Turns a validated candidate into a match.
///
/// One transaction reads both queue entries, checks them against the tight
/// staleness bound, writes the match and deletes only the initiator's entry.
/// Whichever participant commits first invalidates the other's reads, so
/// at most one match exists per pair of entries.
pub struct MatchCreator {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    staleness_ms: u64,
    max_attempts: usize,
}

impl MatchCreator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        staleness_ms: u64,
        max_attempts: usize,
    ) -> Self {
        Self {
            store,
            clock,
            staleness_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Never fails: every store error becomes an abort reason
    pub async fn create_match(&self, own_entry: &DocumentId, candidate: &DocumentId) -> CreationOutcome {
        for attempt in 1..=self.max_attempts {
            match self.attempt(own_entry, candidate).await {
                Ok(CreationOutcome::Created(record)) => {
                    info!(
                        match_id = %record.id,
                        player1 = %record.player1.user_id,
                        player2 = %record.player2.user_id,
                        "Match created"
                    );
                    return CreationOutcome::Created(record);
                }
                Ok(CreationOutcome::Aborted(reason)) => {
                    debug!(candidate = %candidate, ?reason, "Match transaction aborted");
                    return CreationOutcome::Aborted(reason);
                }
                Err(e) if e.is_conflict() => {
                    debug!(candidate = %candidate, attempt, "Match transaction conflicted, retrying");
                }
                Err(e) if e.is_permission_denied() => {
                    return CreationOutcome::Aborted(AbortReason::Denied(e.to_string()));
                }
                Err(e) => {
                    warn!(candidate = %candidate, error = %e, "Match transaction failed");
                    return CreationOutcome::Aborted(AbortReason::Failed(e.to_string()));
                }
            }
        }

        CreationOutcome::Aborted(AbortReason::Contended)
    }

    async fn attempt(
        &self,
        own_entry: &DocumentId,
        candidate: &DocumentId,
    ) -> Result<CreationOutcome, StoreError> {
        let mut tx = Transaction::begin(self.store.as_ref());

        let Some(own_doc) = tx.get(QUEUE_COLLECTION, own_entry).await? else {
            return Ok(CreationOutcome::Aborted(AbortReason::OwnEntryMissing));
        };
        let Some(candidate_doc) = tx.get(QUEUE_COLLECTION, candidate).await? else {
            return Ok(CreationOutcome::Aborted(AbortReason::CandidateMissing));
        };

        let mine: QueueEntry = own_doc.decode()?;
        let theirs: QueueEntry = candidate_doc.decode()?;
        let now = self.clock.now_millis();

        if let Some(reason) = self.precondition_failure(&mine, &theirs, now) {
            return Ok(CreationOutcome::Aborted(reason));
        }

        // Opponent details come from the snapshot read inside this transaction
        let mut record = Match::ready(mine.player_info(), theirs.player_info(), now);
        record.id = tx.create(MATCHES_COLLECTION, serde_json::to_value(&record)?);
        tx.delete(QUEUE_COLLECTION, own_entry);
        tx.commit().await?;

        Ok(CreationOutcome::Created(record))
    }

    fn precondition_failure(
        &self,
        mine: &QueueEntry,
        theirs: &QueueEntry,
        now: u64,
    ) -> Option<AbortReason> {
        if mine.user_id == theirs.user_id {
            return Some(AbortReason::SamePrincipal);
        }
        if !mine.is_searching() {
            return Some(AbortReason::OwnEntryNotSearching);
        }
        if !theirs.is_searching() {
            return Some(AbortReason::CandidateNotSearching);
        }
        if mine.is_stale(now, self.staleness_ms) {
            return Some(AbortReason::OwnEntryStale);
        }
        if theirs.is_stale(now, self.staleness_ms) {
            return Some(AbortReason::CandidateStale);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchmakingConfig;
    use crate::identity::{LocalIdentity, Principal};
    use crate::matchmaking::model::{security_rules, MatchStatus};
    use crate::matchmaking::queue::QueueEntries;
    use crate::store::MemoryStore;
    use crate::util::time::TokioClock;
    use std::time::Duration;

    struct Player {
        queue: QueueEntries,
        creator: MatchCreator,
        principal: Principal,
    }

    fn player(store: &MemoryStore, clock: &Arc<TokioClock>, user: &str) -> Player {
        let principal = Principal::new(user, user.to_uppercase());
        let client: Arc<dyn DocumentStore> =
            Arc::new(store.connect(Arc::new(LocalIdentity::signed_in(principal.clone()))));
        let clock: Arc<dyn Clock> = clock.clone();
        Player {
            queue: QueueEntries::new(
                client.clone(),
                clock.clone(),
                Arc::new(MatchmakingConfig::default()),
            ),
            creator: MatchCreator::new(client, clock, 10_000, 5),
            principal,
        }
    }

    fn setup() -> (MemoryStore, Player, Player) {
        let store = MemoryStore::with_rules(security_rules());
        let clock = Arc::new(TokioClock::starting_at(1_000_000));
        let x = player(&store, &clock, "x");
        let y = player(&store, &clock, "y");
        (store, x, y)
    }

    #[tokio::test(start_paused = true)]
    async fn creates_ready_match_and_deletes_only_initiator_entry() {
        let (store, x, y) = setup();
        let x_entry = x.queue.upsert(&x.principal).await.unwrap();
        let y_entry = y.queue.upsert(&y.principal).await.unwrap();

        let outcome = x.creator.create_match(&x_entry, &y_entry).await;
        let record = match outcome {
            CreationOutcome::Created(record) => record,
            other => panic!("expected a match, got {:?}", other),
        };

        assert_eq!(record.player1.user_id, "x");
        assert_eq!(record.player2.user_id, "y");
        assert_eq!(record.player2.username, "Y");
        assert_eq!(record.status, MatchStatus::Ready);

        let queue: Vec<DocumentId> = store
            .documents(QUEUE_COLLECTION)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(queue, vec![y_entry]);
        assert_eq!(store.documents(MATCHES_COLLECTION).len(), 1);
        assert_eq!(store.foreign_delete_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_past_tight_bound_aborts() {
        let (store, x, y) = setup();
        let y_entry = y.queue.upsert(&y.principal).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let x_entry = x.queue.upsert(&x.principal).await.unwrap();

        let outcome = x.creator.create_match(&x_entry, &y_entry).await;
        assert!(matches!(
            outcome,
            CreationOutcome::Aborted(AbortReason::CandidateStale)
        ));
        assert!(store.documents(MATCHES_COLLECTION).is_empty());
        assert_eq!(store.documents(QUEUE_COLLECTION).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_attempts_create_one_match() {
        let (store, x, y) = setup();
        let x_entry = x.queue.upsert(&x.principal).await.unwrap();
        let y_entry = y.queue.upsert(&y.principal).await.unwrap();

        let (a, b) = tokio::join!(
            x.creator.create_match(&x_entry, &y_entry),
            y.creator.create_match(&y_entry, &x_entry),
        );

        let created = [&a, &b]
            .iter()
            .filter(|o| matches!(o, CreationOutcome::Created(_)))
            .count();
        assert_eq!(created, 1);
        assert_eq!(store.documents(MATCHES_COLLECTION).len(), 1);
        assert_eq!(store.documents(QUEUE_COLLECTION).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_candidate_aborts_without_writes() {
        let (store, x, y) = setup();
        let x_entry = x.queue.upsert(&x.principal).await.unwrap();
        let y_entry = y.queue.upsert(&y.principal).await.unwrap();
        y.queue.remove(&y_entry).await;

        let outcome = x.creator.create_match(&x_entry, &y_entry).await;
        assert!(matches!(
            outcome,
            CreationOutcome::Aborted(AbortReason::CandidateMissing)
        ));
        assert_eq!(store.documents(QUEUE_COLLECTION).len(), 1);
    }
}
