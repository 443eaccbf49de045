//! Shared fixtures: several simulated clients over one in-memory store

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use arena_matchmaker::identity::{LocalIdentity, Principal};
use arena_matchmaker::matchmaking::{
    security_rules, Match, MatchmakingCoordinator, MatchmakingError, QueueEntry, MATCHES_COLLECTION,
    QUEUE_COLLECTION,
};
use arena_matchmaker::store::{DocumentId, DocumentStore, MemoryStore};
use arena_matchmaker::util::time::{Clock, TokioClock};
use arena_matchmaker::MatchmakingConfig;

/// Virtual epoch every world starts at
pub const START: u64 = 1_700_000_000_000;

pub struct World {
    pub store: MemoryStore,
    pub clock: Arc<TokioClock>,
}

impl World {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::with_rules(security_rules()),
            clock: Arc::new(TokioClock::starting_at(START)),
        }
    }

    pub fn config(seed: u64) -> MatchmakingConfig {
        MatchmakingConfig {
            jitter_seed: Some(seed),
            ..MatchmakingConfig::default()
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// A signed-in client for `user_id`
    pub fn client(&self, user_id: &str, seed: u64) -> TestClient {
        let identity = Arc::new(LocalIdentity::signed_in(Principal::new(
            user_id,
            user_id.to_uppercase(),
        )));
        self.client_with(identity, seed)
    }

    pub fn client_with(&self, identity: Arc<LocalIdentity>, seed: u64) -> TestClient {
        let coordinator = MatchmakingCoordinator::new(
            Arc::new(self.store.connect(identity.clone())),
            identity.clone(),
            self.clock.clone(),
            Self::config(seed),
        );
        TestClient {
            identity,
            coordinator,
            found: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn matches(&self) -> Vec<Match> {
        self.store
            .documents(MATCHES_COLLECTION)
            .iter()
            .map(|doc| Match::from_document(doc).unwrap())
            .collect()
    }

    pub fn queue(&self) -> Vec<(DocumentId, QueueEntry)> {
        self.store
            .documents(QUEUE_COLLECTION)
            .into_iter()
            .map(|doc| {
                let entry: QueueEntry = doc.decode().unwrap();
                (doc.id, entry)
            })
            .collect()
    }

    pub fn queue_owners(&self) -> Vec<String> {
        self.queue().into_iter().map(|(_, e)| e.user_id).collect()
    }

    /// Write a ready match straight into the store
    pub async fn seed_match(&self, player1: &str, player2: &str, created_at: u64) -> DocumentId {
        let info = |user: &str| {
            QueueEntry::searching(&Principal::new(user, user.to_uppercase()), 1000.0, created_at)
                .player_info()
        };
        let record = Match::ready(info(player1), info(player2), created_at);
        self.store
            .privileged()
            .create(MATCHES_COLLECTION, serde_json::to_value(record).unwrap())
            .await
            .unwrap()
    }

    /// Write a searching queue entry straight into the store
    pub async fn seed_entry(&self, user_id: &str, at: u64) -> DocumentId {
        let entry = QueueEntry::searching(&Principal::new(user_id, user_id.to_uppercase()), 1000.0, at);
        self.store
            .privileged()
            .create(QUEUE_COLLECTION, serde_json::to_value(entry).unwrap())
            .await
            .unwrap()
    }
}

pub struct TestClient {
    pub identity: Arc<LocalIdentity>,
    pub coordinator: MatchmakingCoordinator,
    pub found: Arc<Mutex<Vec<Match>>>,
    pub errors: Arc<Mutex<Vec<MatchmakingError>>>,
}

impl TestClient {
    pub async fn join(&self) {
        let found = self.found.clone();
        let errors = self.errors.clone();
        self.coordinator
            .join_queue(
                move |record| found.lock().push(record),
                move |e| errors.lock().push(e),
            )
            .await;
    }

    pub fn found_ids(&self) -> Vec<DocumentId> {
        self.found.lock().iter().map(|m| m.id.clone()).collect()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }
}
