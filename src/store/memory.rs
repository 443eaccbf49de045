//! In-process document store with realtime listeners and ownership rules

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    field_at, matches_all, Change, ChangeKind, Document, DocumentId, DocumentStore, Filter,
    StoreError, Subscription, Write, WriteBatch,
};
use crate::identity::IdentityProvider;

/// Which principal may write a collection's documents.
///
/// `creator_field` must name the acting principal on create; updates and
/// deletes require the principal to appear in one of `owner_fields`.
#[derive(Debug, Clone)]
pub struct OwnershipRule {
    pub collection: String,
    pub creator_field: String,
    pub owner_fields: Vec<String>,
}

impl OwnershipRule {
    pub fn new(collection: &str, creator_field: &str, owner_fields: &[&str]) -> Self {
        Self {
            collection: collection.to_string(),
            creator_field: creator_field.to_string(),
            owner_fields: owner_fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn owned_by(&self, data: &Value, user_id: &str) -> bool {
        self.owner_fields
            .iter()
            .any(|field| field_at(data, field).and_then(Value::as_str) == Some(user_id))
    }
}

struct Stored {
    version: u64,
    data: Value,
}

struct Listener {
    collection: String,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<Change>,
}

struct Backend {
    collections: RwLock<HashMap<String, HashMap<DocumentId, Stored>>>,
    listeners: DashMap<u64, Listener>,
    rules: Vec<OwnershipRule>,
    next_listener: AtomicU64,
    next_version: AtomicU64,
    foreign_delete_attempts: AtomicU64,
    offline: AtomicBool,
    latency: Option<Duration>,
}

/// Shared in-memory store. Clients obtained from it see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<Backend>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(Vec::new(), None)
    }

    pub fn with_rules(rules: Vec<OwnershipRule>) -> Self {
        Self::build(rules, None)
    }

    /// Every operation sleeps `latency` before touching data
    pub fn with_rules_and_latency(rules: Vec<OwnershipRule>, latency: Duration) -> Self {
        Self::build(rules, Some(latency))
    }

    fn build(rules: Vec<OwnershipRule>, latency: Option<Duration>) -> Self {
        Self {
            backend: Arc::new(Backend {
                collections: RwLock::new(HashMap::new()),
                listeners: DashMap::new(),
                rules,
                next_listener: AtomicU64::new(1),
                next_version: AtomicU64::new(1),
                foreign_delete_attempts: AtomicU64::new(0),
                offline: AtomicBool::new(false),
                latency,
            }),
        }
    }

    /// Client acting as whichever principal `identity` currently reports
    pub fn connect(&self, identity: Arc<dyn IdentityProvider>) -> MemoryClient {
        MemoryClient {
            backend: self.backend.clone(),
            actor: Actor::User(identity),
        }
    }

    /// Client that bypasses ownership rules
    pub fn privileged(&self) -> MemoryClient {
        MemoryClient {
            backend: self.backend.clone(),
            actor: Actor::Privileged,
        }
    }

    /// Fail every operation with `Unavailable` while set
    pub fn set_offline(&self, offline: bool) {
        self.backend.offline.store(offline, Ordering::SeqCst);
    }

    /// Deletes refused because the document belonged to another principal
    pub fn foreign_delete_attempts(&self) -> u64 {
        self.backend.foreign_delete_attempts.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.backend.listeners.len()
    }

    /// Drop every live listener on `collection`, as a revoked or lost
    /// connection would. Their subscriptions end after draining.
    pub fn close_listeners(&self, collection: &str) -> usize {
        let mut closed = 0;
        self.backend.listeners.retain(|_, listener| {
            let keep = listener.collection != collection;
            if !keep {
                closed += 1;
            }
            keep
        });
        closed
    }

    /// Snapshot of a collection, ordered by id, ignoring rules
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        let collections = self.backend.collections.read();
        let mut docs: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, stored)| to_document(id, stored))
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_document(id: &DocumentId, stored: &Stored) -> Document {
    Document {
        id: id.clone(),
        version: stored.version,
        data: stored.data.clone(),
    }
}

#[derive(Clone)]
enum Actor {
    Privileged,
    User(Arc<dyn IdentityProvider>),
}

enum Access {
    Privileged,
    User(String),
    Anonymous,
}

/// Handle onto a [`MemoryStore`] acting as one party
#[derive(Clone)]
pub struct MemoryClient {
    backend: Arc<Backend>,
    actor: Actor,
}

impl MemoryClient {
    fn access(&self) -> Access {
        match &self.actor {
            Actor::Privileged => Access::Privileged,
            Actor::User(identity) => match identity.current() {
                Some(principal) => Access::User(principal.user_id),
                None => Access::Anonymous,
            },
        }
    }

    async fn round_trip(&self) -> Result<Access, StoreError> {
        match self.backend.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }

        if self.backend.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }

        Ok(self.access())
    }

    fn authorize_read(access: &Access) -> Result<(), StoreError> {
        match access {
            Access::Anonymous => Err(StoreError::PermissionDenied(
                "unauthenticated read".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn authorize_write(
        &self,
        access: &Access,
        write: &Write,
        before: Option<&Value>,
        after: Option<&Value>,
    ) -> Result<(), StoreError> {
        let user_id = match access {
            Access::Privileged => return Ok(()),
            Access::Anonymous => {
                return Err(StoreError::PermissionDenied(
                    "unauthenticated write".to_string(),
                ))
            }
            Access::User(user_id) => user_id,
        };

        let Some(rule) = self
            .backend
            .rules
            .iter()
            .find(|r| r.collection == write.collection())
        else {
            return Ok(());
        };

        let denied = || {
            StoreError::PermissionDenied(format!(
                "{} may not modify {}/{}",
                user_id,
                write.collection(),
                write.id()
            ))
        };

        match write {
            Write::Create { data, .. } => {
                if field_at(data, &rule.creator_field).and_then(Value::as_str)
                    != Some(user_id.as_str())
                {
                    return Err(denied());
                }
            }
            Write::Update { .. } => {
                let owned_before = before.is_some_and(|d| rule.owned_by(d, user_id));
                let owned_after = after.is_some_and(|d| rule.owned_by(d, user_id));
                if !owned_before || !owned_after {
                    return Err(denied());
                }
            }
            Write::Delete { .. } => {
                if let Some(existing) = before {
                    if !rule.owned_by(existing, user_id) {
                        self.backend
                            .foreign_delete_attempts
                            .fetch_add(1, Ordering::SeqCst);
                        debug!(
                            user_id = %user_id,
                            collection = write.collection(),
                            id = %write.id(),
                            "Refused delete of foreign document"
                        );
                        return Err(denied());
                    }
                }
            }
        }

        Ok(())
    }

    fn apply(&self, access: &Access, batch: WriteBatch) -> Result<Vec<DocumentId>, StoreError> {
        let (preconditions, writes) = batch.into_parts();
        let mut collections = self.backend.collections.write();

        for precondition in &preconditions {
            let current = collections
                .get(&precondition.collection)
                .and_then(|docs| docs.get(&precondition.id))
                .map(|stored| stored.version);
            if current != precondition.version {
                return Err(StoreError::Conflict(format!(
                    "{}/{} changed since read",
                    precondition.collection, precondition.id
                )));
            }
        }

        // Stage every write against an overlay first so nothing lands unless all pass
        let mut order: Vec<(String, DocumentId)> = Vec::new();
        let mut overlay: HashMap<(String, DocumentId), Option<Value>> = HashMap::new();
        let mut created = Vec::new();

        for write in &writes {
            let key = (write.collection().to_string(), write.id().clone());
            let before = match overlay.get(&key) {
                Some(staged) => staged.clone(),
                None => collections
                    .get(&key.0)
                    .and_then(|docs| docs.get(&key.1))
                    .map(|stored| stored.data.clone()),
            };

            let after = match write {
                Write::Create { data, id, .. } => {
                    if before.is_some() {
                        return Err(StoreError::InvalidDocument(format!(
                            "{}/{} already exists",
                            key.0, id
                        )));
                    }
                    if !data.is_object() {
                        return Err(StoreError::InvalidDocument(
                            "document must be a JSON object".to_string(),
                        ));
                    }
                    created.push(id.clone());
                    Some(data.clone())
                }
                Write::Update { fields, .. } => {
                    let mut merged = before.clone().ok_or_else(|| StoreError::NotFound {
                        collection: key.0.clone(),
                        id: key.1.clone(),
                    })?;
                    let (Some(target), Some(source)) = (merged.as_object_mut(), fields.as_object())
                    else {
                        return Err(StoreError::InvalidDocument(
                            "update fields must be a JSON object".to_string(),
                        ));
                    };
                    for (field, value) in source {
                        target.insert(field.clone(), value.clone());
                    }
                    Some(merged)
                }
                Write::Delete { .. } => None,
            };

            self.authorize_write(access, write, before.as_ref(), after.as_ref())?;

            if !overlay.contains_key(&key) {
                order.push(key.clone());
            }
            overlay.insert(key, after);
        }

        for key in order {
            let Some(after) = overlay.remove(&key) else {
                continue;
            };
            let (collection, id) = key;
            let docs = collections.entry(collection.clone()).or_default();

            let previous = match after {
                Some(data) => {
                    let version = self.backend.next_version.fetch_add(1, Ordering::SeqCst);
                    docs.insert(id.clone(), Stored { version, data })
                }
                None => docs.remove(&id),
            };

            let before = previous.map(|stored| to_document(&id, &stored));
            let current = docs.get(&id).map(|stored| to_document(&id, stored));
            if before.is_some() || current.is_some() {
                self.notify(&collection, before, current);
            }
        }

        Ok(created)
    }

    fn notify(&self, collection: &str, before: Option<Document>, after: Option<Document>) {
        for listener in self.backend.listeners.iter() {
            if listener.collection != collection {
                continue;
            }

            let was = before
                .as_ref()
                .is_some_and(|d| matches_all(&listener.filters, &d.data));
            let is = after
                .as_ref()
                .is_some_and(|d| matches_all(&listener.filters, &d.data));

            let change = match (was, is, &before, &after) {
                (false, true, _, Some(doc)) => Change {
                    kind: ChangeKind::Added,
                    document: doc.clone(),
                },
                (true, true, _, Some(doc)) => Change {
                    kind: ChangeKind::Modified,
                    document: doc.clone(),
                },
                (true, false, Some(doc), _) => Change {
                    kind: ChangeKind::Removed,
                    document: doc.clone(),
                },
                _ => continue,
            };

            // Receiver may already be gone while its guard has not run yet
            let _ = listener.tx.send(change);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryClient {
    async fn get(
        &self,
        collection: &str,
        id: &DocumentId,
    ) -> Result<Option<Document>, StoreError> {
        let access = self.round_trip().await?;
        Self::authorize_read(&access)?;

        let collections = self.backend.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|stored| to_document(id, stored)))
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<Document>, StoreError> {
        let access = self.round_trip().await?;
        Self::authorize_read(&access)?;

        let collections = self.backend.collections.read();
        let mut docs: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, stored)| matches_all(filters, &stored.data))
                    .map(|(id, stored)| to_document(id, stored))
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn subscribe(
        &self,
        collection: &str,
        filters: Vec<Filter>,
    ) -> Result<Subscription, StoreError> {
        let access = self.round_trip().await?;
        Self::authorize_read(&access)?;

        // Holding the read lock keeps writers out between snapshot and registration
        let collections = self.backend.collections.read();
        let listener_id = self.backend.next_listener.fetch_add(1, Ordering::SeqCst);

        let backend = self.backend.clone();
        let (tx, subscription) = Subscription::channel(move || {
            backend.listeners.remove(&listener_id);
        });

        let mut initial: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, stored)| matches_all(&filters, &stored.data))
                    .map(|(id, stored)| to_document(id, stored))
                    .collect()
            })
            .unwrap_or_default();
        initial.sort_by(|a, b| a.id.cmp(&b.id));

        for document in initial {
            let _ = tx.send(Change {
                kind: ChangeKind::Added,
                document,
            });
        }

        self.backend.listeners.insert(
            listener_id,
            Listener {
                collection: collection.to_string(),
                filters,
                tx,
            },
        );

        Ok(subscription)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<Vec<DocumentId>, StoreError> {
        let access = self.round_trip().await?;
        self.apply(&access, batch)
    }
}
