//! Document store collaborator: shared collections with realtime change feeds

pub mod memory;
pub mod subscription;
pub mod transaction;

use std::fmt;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use memory::{MemoryClient, MemoryStore, OwnershipRule};
pub use subscription::Subscription;
pub use transaction::Transaction;

/// Opaque document identifier, unique within a collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh client-side identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored document as read from the store
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: DocumentId,
    /// Bumped by every write; transactions use it as their precondition
    pub version: u64,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone()).map_err(StoreError::Decode)
    }

    pub fn field(&self, path: &str) -> Option<&Value> {
        field_at(&self.data, path)
    }
}

/// Look up a dotted field path such as `player1.userId`
pub fn field_at<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |value, key| value.get(key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Gt,
}

/// Single-field query predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Lt,
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Gt,
            value: value.into(),
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        let Some(actual) = field_at(data, &self.field) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            FilterOp::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

pub fn matches_all(filters: &[Filter], data: &Value) -> bool {
    filters.iter().all(|f| f.matches(data))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One realtime notification for a subscribed query
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub document: Document,
}

#[derive(Debug, Clone)]
pub enum Write {
    Create {
        collection: String,
        id: DocumentId,
        data: Value,
    },
    /// Shallow merge of top-level fields
    Update {
        collection: String,
        id: DocumentId,
        fields: Value,
    },
    Delete {
        collection: String,
        id: DocumentId,
    },
}

impl Write {
    pub fn collection(&self) -> &str {
        match self {
            Write::Create { collection, .. }
            | Write::Update { collection, .. }
            | Write::Delete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &DocumentId {
        match self {
            Write::Create { id, .. } | Write::Update { id, .. } | Write::Delete { id, .. } => id,
        }
    }
}

/// Commit only if the document is still at `version` (`None`: still absent)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub collection: String,
    pub id: DocumentId,
    pub version: Option<u64>,
}

/// Writes applied all-or-nothing, guarded by preconditions
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    preconditions: Vec<Precondition>,
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&mut self, collection: &str, id: &DocumentId, version: Option<u64>) {
        self.preconditions.push(Precondition {
            collection: collection.to_string(),
            id: id.clone(),
            version,
        });
    }

    pub fn create(&mut self, collection: &str, data: Value) -> DocumentId {
        let id = DocumentId::generate();
        self.writes.push(Write::Create {
            collection: collection.to_string(),
            id: id.clone(),
            data,
        });
        id
    }

    pub fn update(&mut self, collection: &str, id: &DocumentId, fields: Value) {
        self.writes.push(Write::Update {
            collection: collection.to_string(),
            id: id.clone(),
            fields,
        });
    }

    pub fn delete(&mut self, collection: &str, id: &DocumentId) {
        self.writes.push(Write::Delete {
            collection: collection.to_string(),
            id: id.clone(),
        });
    }

    pub fn into_parts(self) -> (Vec<Precondition>, Vec<Write>) {
        (self.preconditions, self.writes)
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document {collection}/{id} not found")]
    NotFound { collection: String, id: DocumentId },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StoreError::PermissionDenied(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Remote, shared, replicated collection store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &DocumentId)
        -> Result<Option<Document>, StoreError>;

    async fn query(&self, collection: &str, filters: &[Filter])
        -> Result<Vec<Document>, StoreError>;

    /// Realtime feed: an `Added` per existing match, then live changes
    async fn subscribe(
        &self,
        collection: &str,
        filters: Vec<Filter>,
    ) -> Result<Subscription, StoreError>;

    /// Apply a batch atomically; returns the ids of created documents
    async fn commit(&self, batch: WriteBatch) -> Result<Vec<DocumentId>, StoreError>;

    async fn create(&self, collection: &str, data: Value) -> Result<DocumentId, StoreError> {
        let mut batch = WriteBatch::new();
        let id = batch.create(collection, data);
        self.commit(batch).await?;
        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        id: &DocumentId,
        fields: Value,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.update(collection, id, fields);
        self.commit(batch).await.map(|_| ())
    }

    /// Deleting an absent document succeeds
    async fn delete(&self, collection: &str, id: &DocumentId) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(collection, id);
        self.commit(batch).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_follow_dotted_paths() {
        let doc = json!({ "player1": { "userId": "a" }, "createdAt": 10 });
        assert!(Filter::eq("player1.userId", "a").matches(&doc));
        assert!(!Filter::eq("player2.userId", "a").matches(&doc));
        assert!(Filter::lt("createdAt", 11).matches(&doc));
        assert!(Filter::gt("createdAt", 9).matches(&doc));
        assert!(!Filter::gt("createdAt", 10).matches(&doc));
    }

    #[test]
    fn mismatched_types_never_compare() {
        let doc = json!({ "createdAt": "yesterday" });
        assert!(!Filter::lt("createdAt", 11).matches(&doc));
    }
}
