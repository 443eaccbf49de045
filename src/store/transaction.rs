//! Optimistic read-then-conditionally-write transactions

use serde_json::Value;

use super::{Document, DocumentId, DocumentStore, StoreError, WriteBatch};

/// Every document read through the transaction becomes a commit precondition:
/// if any of them changed (or appeared, or vanished) before commit, the whole
/// commit fails with [`StoreError::Conflict`] and nothing is written.
pub struct Transaction<'a> {
    store: &'a dyn DocumentStore,
    batch: WriteBatch,
}

impl<'a> Transaction<'a> {
    pub fn begin(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
        }
    }

    /// Fresh read, pinned for commit
    pub async fn get(
        &mut self,
        collection: &str,
        id: &DocumentId,
    ) -> Result<Option<Document>, StoreError> {
        let doc = self.store.get(collection, id).await?;
        self.batch
            .expect(collection, id, doc.as_ref().map(|d| d.version));
        Ok(doc)
    }

    pub fn create(&mut self, collection: &str, data: Value) -> DocumentId {
        self.batch.create(collection, data)
    }

    pub fn update(&mut self, collection: &str, id: &DocumentId, fields: Value) {
        self.batch.update(collection, id, fields);
    }

    pub fn delete(&mut self, collection: &str, id: &DocumentId) {
        self.batch.delete(collection, id);
    }

    pub async fn commit(self) -> Result<Vec<DocumentId>, StoreError> {
        self.store.commit(self.batch).await
    }
}
