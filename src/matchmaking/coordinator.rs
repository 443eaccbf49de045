//! Matchmaking coordinator - the public join/leave surface of one client

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::creation::{CreationOutcome, MatchCreator};
use super::discovery::OpponentDiscovery;
use super::janitor::{StaleSweeper, SweepScope};
use super::listener::{is_current_session, poll_matches, MatchFeed};
use super::model::Match;
use super::queue::QueueEntries;
use super::state::SessionState;
use crate::config::MatchmakingConfig;
use crate::identity::{wait_for_principal, IdentityProvider, Principal};
use crate::store::{DocumentId, DocumentStore, StoreError, Subscription};
use crate::util::rate_limit::JoinRateLimiter;
use crate::util::time::{format_millis, Clock};

/// Errors surfaced to the `on_error` callback of [`MatchmakingCoordinator::join_queue`]
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("too many join attempts, slow down")]
    RateLimited,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

type FoundCallback = Box<dyn FnOnce(Match) + Send>;

/// Background tasks of one session, aborted together on drop
#[derive(Default)]
struct SessionTasks(Vec<JoinHandle<()>>);

impl Drop for SessionTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Session {
    state: SessionState,
    /// Bumped whenever a session starts or ends; stale work compares against it
    generation: u64,
    principal: Option<Principal>,
    entry_id: Option<DocumentId>,
    joined_at: Option<u64>,
    on_found: Option<FoundCallback>,
    tasks: SessionTasks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchSource {
    /// Committed by this client's own transaction
    Created,
    /// Seen through the listener or the reconciliation poll
    Observed,
}

enum JoinAbort {
    /// The session ended underneath the join sequence
    Cancelled,
    Failed(MatchmakingError),
}

impl From<StoreError> for JoinAbort {
    fn from(e: StoreError) -> Self {
        JoinAbort::Failed(e.into())
    }
}

enum Attempt {
    Matched,
    Rejected,
    /// Another attempt is in flight or the session moved on
    Busy,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    config: Arc<MatchmakingConfig>,
    queue: QueueEntries,
    discovery: OpponentDiscovery,
    creator: MatchCreator,
    sweeper: StaleSweeper,
    limiter: JoinRateLimiter,
    rng: Mutex<ChaCha8Rng>,
    session: Mutex<Session>,
}

/// One matchmaking session per client context.
///
/// Cheap to clone; clones share the session. Construct one per client and
/// hand it to whatever drives the UI.
#[derive(Clone)]
pub struct MatchmakingCoordinator {
    inner: Arc<Inner>,
}

impl MatchmakingCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        config: MatchmakingConfig,
    ) -> Self {
        let config = Arc::new(config);
        let queue = QueueEntries::new(store.clone(), clock.clone(), config.clone());
        let discovery = OpponentDiscovery::new(
            store.clone(),
            queue.clone(),
            config.discovery_staleness_millis(),
        );
        let creator = MatchCreator::new(
            store.clone(),
            clock.clone(),
            config.transaction_staleness_millis(),
            config.max_transaction_attempts,
        );
        let sweeper = StaleSweeper::new(store.clone(), clock.clone(), config.clone());
        let rng = match config.jitter_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        Self {
            inner: Arc::new(Inner {
                limiter: JoinRateLimiter::new(config.join_rate_limit),
                store,
                identity,
                clock,
                config,
                queue,
                discovery,
                creator,
                sweeper,
                rng: Mutex::new(rng),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.lock().state
    }

    /// Queue entry this client currently tracks as its own
    pub fn current_entry(&self) -> Option<DocumentId> {
        self.inner.session.lock().entry_id.clone()
    }

    /// Start of the current queueing session in epoch millis
    pub fn joined_at(&self) -> Option<u64> {
        self.inner.session.lock().joined_at
    }

    /// Enter the queue and search until matched or left.
    ///
    /// Returns once the join sequence has finished; searching continues in
    /// the background. `on_found` fires at most once with the accepted match,
    /// `on_error` only when the join itself cannot proceed. Calls made while a
    /// session is already joining or searching are ignored.
    pub async fn join_queue<F, E>(&self, on_found: F, on_error: E)
    where
        F: FnOnce(Match) + Send + 'static,
        E: FnOnce(MatchmakingError) + Send + 'static,
    {
        let generation = {
            let mut session = self.inner.session.lock();
            if !session.state.can_transition(SessionState::Joining) {
                debug!(state = ?session.state, "Join already in progress, ignoring");
                return;
            }
            if !self.inner.limiter.check_join() {
                None
            } else {
                if let Err(e) = session.state.transition(SessionState::Joining) {
                    warn!(error = %e, "Join refused");
                    return;
                }
                session.generation += 1;
                session.principal = None;
                session.entry_id = None;
                session.joined_at = None;
                session.on_found = Some(Box::new(on_found));
                Some(session.generation)
            }
        };

        let Some(generation) = generation else {
            warn!("Join rate limit exceeded");
            on_error(MatchmakingError::RateLimited);
            return;
        };

        match self.inner.run_join(generation).await {
            Ok(()) => {}
            Err(JoinAbort::Cancelled) => debug!(generation, "Join sequence cancelled"),
            Err(JoinAbort::Failed(error)) => {
                if self.inner.halt(generation) {
                    warn!(error = %error, "Join failed");
                    on_error(error);
                }
            }
        }
    }

    /// Leave the queue, whatever the session is doing.
    ///
    /// Stops every background task, drops both listeners and deletes the
    /// tracked queue entry.
    pub async fn leave_queue(&self) {
        let (entry_id, principal, tasks) = {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            session.state = SessionState::Idle;
            session.on_found = None;
            session.joined_at = None;
            (
                session.entry_id.take(),
                session.principal.take(),
                std::mem::take(&mut session.tasks),
            )
        };
        drop(tasks);

        if let Some(entry_id) = entry_id {
            let owner = principal.map(|p| p.user_id);
            self.inner.release_entry(&entry_id, owner.as_deref()).await;
        }
        info!("Left matchmaking queue");
    }
}

impl Inner {
    async fn run_join(self: &Arc<Self>, generation: u64) -> Result<(), JoinAbort> {
        let principal = wait_for_principal(self.identity.as_ref(), self.config.auth_timeout)
            .await
            .ok_or(JoinAbort::Failed(MatchmakingError::NotAuthenticated))?;
        let user_id = principal.user_id.clone();

        let joined_at = self.clock.now_millis();
        {
            let mut session = self.session.lock();
            if session.generation != generation {
                return Err(JoinAbort::Cancelled);
            }
            session.principal = Some(principal.clone());
            session.joined_at = Some(joined_at);
        }
        info!(user_id = %user_id, joined_at = %format_millis(joined_at), "Joining matchmaking queue");

        self.track(
            generation,
            tokio::spawn(watch_auth(self.clone(), generation, user_id.clone())),
        );

        let report = self.sweeper.sweep(&SweepScope::Owner(user_id.clone())).await;
        debug!(
            user_id = %user_id,
            queue_removed = report.queue_removed,
            matches_removed = report.matches_removed,
            "Pre-join cleanup finished"
        );
        tokio::time::sleep(self.config.settle_delay).await;
        if !self.checkpoint(generation)? {
            return Ok(());
        }

        // Listen before writing presence so a match made right after the write is not missed
        let feed = MatchFeed::attach(self.store.as_ref(), &user_id).await?;
        self.track(generation, tokio::spawn(listen(self.clone(), generation, feed)));

        let entry_id = self.queue.upsert(&principal).await?;
        match self.adopt_entry(generation, &entry_id) {
            Some(SessionState::Searching) => {}
            Some(_) => {
                // Matched while the entry was being written
                self.release_entry(&entry_id, Some(user_id.as_str())).await;
                return Ok(());
            }
            None => {
                self.release_entry(&entry_id, Some(user_id.as_str())).await;
                return Err(JoinAbort::Cancelled);
            }
        }

        tokio::time::sleep(self.jitter()).await;
        if !self.checkpoint(generation)? {
            return Ok(());
        }

        match self.discovery.watch().await {
            Ok(changes) => self.track(
                generation,
                tokio::spawn(discover_live(
                    self.clone(),
                    generation,
                    changes,
                    entry_id.clone(),
                    user_id.clone(),
                )),
            ),
            Err(e) if e.is_permission_denied() => {
                warn!(user_id = %user_id, error = %e, "Live discovery not permitted, relying on scans")
            }
            Err(e) => return Err(e.into()),
        }

        self.scan(generation, &entry_id, &user_id).await?;
        if !self.checkpoint(generation)? {
            return Ok(());
        }

        self.track(
            generation,
            tokio::spawn(heartbeat(
                self.clone(),
                generation,
                entry_id.clone(),
                user_id.clone(),
            )),
        );
        self.track(
            generation,
            tokio::spawn(reconcile(self.clone(), generation, user_id.clone())),
        );

        info!(user_id = %user_id, entry_id = %entry_id, "Searching for an opponent");
        Ok(())
    }

    /// `Ok(false)` once matched, `Cancelled` once the session is gone
    fn checkpoint(&self, generation: u64) -> Result<bool, JoinAbort> {
        let session = self.session.lock();
        if session.generation != generation || session.state == SessionState::Idle {
            return Err(JoinAbort::Cancelled);
        }
        Ok(session.state != SessionState::Matched)
    }

    fn is_live(&self, generation: u64) -> bool {
        let session = self.session.lock();
        session.generation == generation && session.state.is_searching()
    }

    /// Record the upserted entry; returns the resulting state, `None` if the
    /// session ended meanwhile
    fn adopt_entry(&self, generation: u64, entry_id: &DocumentId) -> Option<SessionState> {
        let mut session = self.session.lock();
        if session.generation != generation {
            return None;
        }
        match session.state {
            SessionState::Joining => match session.state.transition(SessionState::Searching) {
                Ok(()) => {
                    session.entry_id = Some(entry_id.clone());
                    Some(SessionState::Searching)
                }
                Err(e) => {
                    warn!(entry_id = %entry_id, error = %e, "Queue entry not adopted");
                    None
                }
            },
            SessionState::Idle => None,
            other => Some(other),
        }
    }

    fn track(&self, generation: u64, handle: JoinHandle<()>) {
        let mut session = self.session.lock();
        if session.generation == generation {
            session.tasks.0.push(handle);
        } else {
            handle.abort();
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.lock().gen_range(0..=max))
    }

    /// Try candidates from a fresh query, oldest first, up to the attempt bound
    async fn scan(
        self: &Arc<Self>,
        generation: u64,
        entry_id: &DocumentId,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let candidates = self.discovery.candidates(entry_id, user_id).await?;
        debug!(user_id, found = candidates.len(), "Scanned queue");

        for candidate in candidates
            .into_iter()
            .take(self.config.max_discovery_attempts)
        {
            match self.try_create(generation, entry_id, user_id, &candidate.id).await {
                Attempt::Rejected => continue,
                Attempt::Matched | Attempt::Busy => break,
            }
        }
        Ok(())
    }

    async fn try_create(
        self: &Arc<Self>,
        generation: u64,
        entry_id: &DocumentId,
        user_id: &str,
        candidate: &DocumentId,
    ) -> Attempt {
        if !self.begin_creation(generation) {
            return Attempt::Busy;
        }

        if let Err(rejection) = self.discovery.validate(entry_id, user_id, candidate).await {
            debug!(candidate = %candidate, ?rejection, "Candidate rejected");
            self.end_creation(generation);
            return Attempt::Rejected;
        }

        match self.creator.create_match(entry_id, candidate).await {
            CreationOutcome::Created(record) => {
                self.complete_match(generation, record, MatchSource::Created);
                Attempt::Matched
            }
            CreationOutcome::Aborted(reason) => {
                debug!(candidate = %candidate, ?reason, "Resuming search");
                self.end_creation(generation);
                Attempt::Rejected
            }
        }
    }

    fn begin_creation(&self, generation: u64) -> bool {
        let mut session = self.session.lock();
        session.generation == generation
            && session.state == SessionState::Searching
            && session.state.transition(SessionState::CreatingMatch).is_ok()
    }

    fn end_creation(&self, generation: u64) {
        let mut session = self.session.lock();
        if session.generation == generation && session.state == SessionState::CreatingMatch {
            if let Err(e) = session.state.transition(SessionState::Searching) {
                warn!(error = %e, "Could not resume searching after creation");
            }
        }
    }

    /// Accept `record` for this session; false if it was ignored
    fn complete_match(self: &Arc<Self>, generation: u64, record: Match, source: MatchSource) -> bool {
        let (callback, entry_id, tasks, user_id) = {
            let mut session = self.session.lock();
            if session.generation != generation {
                debug!(match_id = %record.id, "Match arrived after the session ended");
                return false;
            }
            let Some(user_id) = session.principal.as_ref().map(|p| p.user_id.clone()) else {
                return false;
            };
            if !record.involves(&user_id) {
                return false;
            }
            if source == MatchSource::Observed {
                let joined_at = session.joined_at.unwrap_or(u64::MAX);
                if !is_current_session(&record, joined_at) {
                    debug!(match_id = %record.id, "Ignoring match from an earlier session");
                    return false;
                }
            }
            if let Err(e) = session.state.transition(SessionState::Matched) {
                debug!(match_id = %record.id, error = %e, "Match not accepted");
                return false;
            }
            (
                session.on_found.take(),
                session.entry_id.take(),
                std::mem::take(&mut session.tasks),
                user_id,
            )
        };

        info!(
            match_id = %record.id,
            user_id = %user_id,
            opponent = ?record.opponent_of(&user_id).map(|p| &p.user_id),
            ?source,
            "Match accepted"
        );

        // The initiator's entry went away inside its transaction
        if let (MatchSource::Observed, Some(entry_id)) = (source, entry_id) {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.release_entry(&entry_id, Some(user_id.as_str())).await;
            });
        }

        if let Some(callback) = callback {
            callback(record);
        }
        drop(tasks);
        true
    }

    /// End the session after an auth change or a failure; false if it was
    /// already superseded
    fn halt(self: &Arc<Self>, generation: u64) -> bool {
        let (entry_id, principal, tasks) = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return false;
            }
            session.generation += 1;
            session.state = SessionState::Idle;
            session.on_found = None;
            session.joined_at = None;
            (
                session.entry_id.take(),
                session.principal.take(),
                std::mem::take(&mut session.tasks),
            )
        };

        if let Some(entry_id) = entry_id {
            let inner = self.clone();
            tokio::spawn(async move {
                let owner = principal.map(|p| p.user_id);
                inner.release_entry(&entry_id, owner.as_deref()).await;
            });
        }
        drop(tasks);
        true
    }

    /// Delete an entry owned by `owner` unless someone else is signed in now
    async fn release_entry(&self, entry_id: &DocumentId, owner: Option<&str>) {
        if let (Some(current), Some(owner)) = (self.identity.current(), owner) {
            if current.user_id != owner {
                debug!(entry_id = %entry_id, owner, "Entry belongs to a previous principal, leaving it to expire");
                return;
            }
        }
        self.queue.remove(entry_id).await;
    }
}

async fn watch_auth(inner: Arc<Inner>, generation: u64, user_id: String) {
    let mut rx = inner.identity.subscribe();
    loop {
        let still_signed_in = rx
            .borrow_and_update()
            .as_ref()
            .map_or(false, |p| p.user_id == user_id);
        if !still_signed_in {
            info!(user_id = %user_id, "Principal changed, halting matchmaking");
            inner.halt(generation);
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn listen(inner: Arc<Inner>, generation: u64, mut feed: MatchFeed) {
    while let Some(record) = feed.next_match().await {
        if inner.complete_match(generation, record, MatchSource::Observed) {
            return;
        }
    }
    if inner.is_live(generation) {
        warn!("Match feed closed, falling back to reconciliation polls");
    }
}

async fn discover_live(
    inner: Arc<Inner>,
    generation: u64,
    mut changes: Subscription,
    entry_id: DocumentId,
    user_id: String,
) {
    while let Some(change) = changes.next_change().await {
        let Some(candidate) =
            OpponentDiscovery::candidate_from_change(&change, &entry_id, &user_id)
        else {
            continue;
        };
        if let Attempt::Matched = inner.try_create(generation, &entry_id, &user_id, &candidate).await {
            return;
        }
        if !inner.is_live(generation) {
            return;
        }
    }
}

/// Keeps the entry fresh and rescans for candidates the live feed skipped
async fn heartbeat(inner: Arc<Inner>, generation: u64, entry_id: DocumentId, user_id: String) {
    let every = inner.config.heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !inner.is_live(generation) {
            return;
        }

        if let Err(e) = inner.queue.heartbeat(&entry_id).await {
            warn!(entry_id = %entry_id, error = %e, "Heartbeat failed, leaving queue");
            inner.halt(generation);
            return;
        }

        if let Err(e) = inner.scan(generation, &entry_id, &user_id).await {
            debug!(user_id = %user_id, error = %e, "Rescan failed");
        }
    }
}

/// Fallback for matches whose notification never arrived
async fn reconcile(inner: Arc<Inner>, generation: u64, user_id: String) {
    let every = inner.config.reconcile_interval;
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !inner.is_live(generation) {
            return;
        }

        match poll_matches(inner.store.as_ref(), &user_id).await {
            Ok(found) => {
                for record in found {
                    if inner.complete_match(generation, record, MatchSource::Observed) {
                        return;
                    }
                }
            }
            Err(e) => debug!(user_id = %user_id, error = %e, "Reconciliation poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use crate::matchmaking::model::{security_rules, QUEUE_COLLECTION};
    use crate::store::MemoryStore;
    use crate::util::time::TokioClock;

    fn coordinator(store: &MemoryStore, identity: Arc<LocalIdentity>) -> MatchmakingCoordinator {
        MatchmakingCoordinator::new(
            Arc::new(store.connect(identity.clone())),
            identity,
            Arc::new(TokioClock::starting_at(1_000_000)),
            MatchmakingConfig {
                jitter_seed: Some(7),
                ..MatchmakingConfig::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lone_client_keeps_searching() {
        let store = MemoryStore::with_rules(security_rules());
        let me = Arc::new(LocalIdentity::signed_in(Principal::new("me", "Me")));
        let client = coordinator(&store, me);

        client.join_queue(|_| panic!("no opponent exists"), |e| panic!("{e}")).await;
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(client.state(), SessionState::Searching);
        assert!(client.current_entry().is_some());
        assert_eq!(store.documents(QUEUE_COLLECTION).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reentrant_join_is_ignored() {
        let store = MemoryStore::with_rules(security_rules());
        let me = Arc::new(LocalIdentity::signed_in(Principal::new("me", "Me")));
        let client = coordinator(&store, me);

        let first = client.join_queue(|_| {}, |e| panic!("{e}"));
        let second = client.join_queue(|_| {}, |e| panic!("{e}"));
        tokio::join!(first, second);

        assert_eq!(client.state(), SessionState::Searching);
        assert_eq!(store.documents(QUEUE_COLLECTION).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_clears_entry_and_session() {
        let store = MemoryStore::with_rules(security_rules());
        let me = Arc::new(LocalIdentity::signed_in(Principal::new("me", "Me")));
        let client = coordinator(&store, me);

        client.join_queue(|_| {}, |e| panic!("{e}")).await;
        client.leave_queue().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.state(), SessionState::Idle);
        assert_eq!(client.current_entry(), None);
        assert_eq!(client.joined_at(), None);
        assert!(store.documents(QUEUE_COLLECTION).is_empty());
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_window_opens_and_closes_once() {
        let store = MemoryStore::with_rules(security_rules());
        let me = Arc::new(LocalIdentity::signed_in(Principal::new("me", "Me")));
        let client = coordinator(&store, me);

        client.join_queue(|_| {}, |e| panic!("{e}")).await;
        let inner = &client.inner;
        let generation = inner.session.lock().generation;

        assert!(inner.begin_creation(generation));
        assert!(!inner.begin_creation(generation));
        assert_eq!(client.state(), SessionState::CreatingMatch);

        inner.end_creation(generation);
        inner.end_creation(generation);
        assert_eq!(client.state(), SessionState::Searching);

        // A stale session can neither adopt an entry nor reopen the window
        let entry = client.current_entry().unwrap();
        assert_eq!(inner.adopt_entry(generation + 1, &entry), None);
        assert_eq!(inner.adopt_entry(generation, &entry), Some(SessionState::Searching));
        assert!(!inner.begin_creation(generation + 1));
        assert_eq!(client.state(), SessionState::Searching);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_when_idle_is_harmless() {
        let store = MemoryStore::with_rules(security_rules());
        let client = coordinator(&store, Arc::new(LocalIdentity::signed_out()));

        client.leave_queue().await;
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_rejoins_are_rate_limited() {
        let store = MemoryStore::with_rules(security_rules());
        let client = MatchmakingCoordinator::new(
            Arc::new(store.privileged()),
            Arc::new(LocalIdentity::signed_out()),
            Arc::new(TokioClock::starting_at(1_000_000)),
            MatchmakingConfig {
                join_rate_limit: 1,
                auth_timeout: Duration::from_millis(100),
                ..MatchmakingConfig::default()
            },
        );

        let errors = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let sink = errors.clone();
            client.join_queue(|_| {}, move |e| sink.lock().push(e)).await;
        }

        let errors = errors.lock();
        assert!(matches!(errors[0], MatchmakingError::NotAuthenticated));
        assert!(matches!(errors[1], MatchmakingError::RateLimited));
        assert_eq!(client.state(), SessionState::Idle);
    }
}
