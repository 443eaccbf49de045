//! Removal of abandoned queue entries and expired matches

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::model::{MATCHES_COLLECTION, QUEUE_COLLECTION};
use super::queue::decode_all;
use crate::config::MatchmakingConfig;
use crate::store::{Document, DocumentId, DocumentStore, Filter, StoreError};
use crate::util::time::Clock;

/// Whose documents a sweep may touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepScope {
    /// Only documents owned by this principal (ordinary clients)
    Owner(String),
    /// Everything (privileged cleanup routine)
    Global,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub queue_removed: usize,
    pub matches_removed: usize,
    pub denied: usize,
}

pub struct StaleSweeper {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: Arc<MatchmakingConfig>,
}

impl StaleSweeper {
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

    /// Best-effort: query or delete failures only shrink the report
    pub async fn sweep(&self, scope: &SweepScope) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.clock.now_millis();

        match self.stale_entries(scope, now).await {
            Ok(ids) => {
                for id in ids {
                    self.delete(QUEUE_COLLECTION, &id, &mut report, |r| r.queue_removed += 1)
                        .await;
                }
            }
            Err(e) => log_query_failure(QUEUE_COLLECTION, &e),
        }

        match self.expired_matches(scope, now).await {
            Ok(ids) => {
                for id in ids {
                    self.delete(MATCHES_COLLECTION, &id, &mut report, |r| r.matches_removed += 1)
                        .await;
                }
            }
            Err(e) => log_query_failure(MATCHES_COLLECTION, &e),
        }

        if report.queue_removed + report.matches_removed > 0 {
            info!(
                queue_removed = report.queue_removed,
                matches_removed = report.matches_removed,
                "Swept stale matchmaking documents"
            );
        }
        report
    }

    /// Sweep globally forever; run with a privileged store client
    pub async fn run(self, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            self.sweep(&SweepScope::Global).await;
        }
    }

    async fn stale_entries(&self, scope: &SweepScope, now: u64) -> Result<Vec<DocumentId>, StoreError> {
        let filters = match scope {
            SweepScope::Owner(user_id) => vec![Filter::eq("userId", user_id.as_str())],
            SweepScope::Global => Vec::new(),
        };
        let docs = self.store.query(QUEUE_COLLECTION, &filters).await?;
        let threshold = self.config.discovery_staleness_millis();

        Ok(decode_all(&docs)
            .into_iter()
            .filter(|doc| doc.entry.is_stale(now, threshold))
            .map(|doc| doc.id)
            .collect())
    }

    async fn expired_matches(&self, scope: &SweepScope, now: u64) -> Result<Vec<DocumentId>, StoreError> {
        let cutoff = now.saturating_sub(self.config.match_retention.as_millis() as u64);
        let expired = |slot: Option<(&str, &str)>| {
            let mut filters = vec![Filter::eq("status", "ready"), Filter::lt("createdAt", cutoff)];
            if let Some((field, user_id)) = slot {
                filters.push(Filter::eq(field, user_id));
            }
            filters
        };

        let mut docs: Vec<Document> = Vec::new();
        match scope {
            SweepScope::Owner(user_id) => {
                for slot in ["player1.userId", "player2.userId"] {
                    docs.extend(
                        self.store
                            .query(MATCHES_COLLECTION, &expired(Some((slot, user_id.as_str()))))
                            .await?,
                    );
                }
            }
            SweepScope::Global => {
                docs = self.store.query(MATCHES_COLLECTION, &expired(None)).await?;
            }
        }

        let mut ids: Vec<DocumentId> = docs.into_iter().map(|d| d.id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn delete<F>(&self, collection: &str, id: &DocumentId, report: &mut SweepReport, count: F)
    where
        F: FnOnce(&mut SweepReport),
    {
        match self.store.delete(collection, id).await {
            Ok(()) => count(report),
            Err(e) if e.is_permission_denied() => {
                report.denied += 1;
                debug!(collection, id = %id, "Not permitted to sweep document");
            }
            Err(e) => warn!(collection, id = %id, error = %e, "Failed to sweep document"),
        }
    }
}

fn log_query_failure(collection: &str, error: &StoreError) {
    if error.is_permission_denied() {
        debug!(collection, error = %error, "Cleanup query not permitted");
    } else {
        warn!(collection, error = %error, "Cleanup query failed");
    }
}
