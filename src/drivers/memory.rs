//! In-memory reference driver: no external process, used by the test suite
//! and by `reconciler-cli`'s dry-run smoke mode (§4.3).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use reconciler_core::document::Document;
use reconciler_core::key::ForeignKey;

use crate::error::ReconcileError;

/// A driver backed by an in-process map, keyed by the foreign key's id.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    records: Arc<RwLock<HashMap<String, Document>>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing `create`/`update` — used by tests
    /// to set up a source's starting state.
    pub async fn seed(&self, fk: &ForeignKey, doc: Document) {
        self.records.write().await.insert(fk.id().to_owned(), doc);
    }

    pub async fn read(&self, fk: &ForeignKey) -> Result<Option<Document>, ReconcileError> {
        Ok(self.records.read().await.get(fk.id()).cloned())
    }

    pub async fn create(&self, fk: &ForeignKey, doc: &Document) -> Result<(), ReconcileError> {
        self.records.write().await.insert(fk.id().to_owned(), doc.clone());
        Ok(())
    }

    pub async fn update(&self, fk: &ForeignKey, doc: &Document) -> Result<(), ReconcileError> {
        self.records.write().await.insert(fk.id().to_owned(), doc.clone());
        Ok(())
    }

    pub async fn delete(&self, fk: &ForeignKey) -> Result<(), ReconcileError> {
        self.records.write().await.remove(fk.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fk(id: &str) -> ForeignKey {
        ForeignKey::new("customer", "crm", id).unwrap()
    }

    #[tokio::test]
    async fn read_missing_record_is_none() {
        let driver = MemoryDriver::new();
        assert_eq!(driver.read(&fk("1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let driver = MemoryDriver::new();
        let doc = Document::from_json(&json!({"tier": "gold"})).unwrap();
        driver.create(&fk("1"), &doc).await.unwrap();
        assert_eq!(driver.read(&fk("1")).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn update_overwrites_existing_record() {
        let driver = MemoryDriver::new();
        let a = Document::from_json(&json!({"tier": "silver"})).unwrap();
        let b = Document::from_json(&json!({"tier": "gold"})).unwrap();
        driver.create(&fk("1"), &a).await.unwrap();
        driver.update(&fk("1"), &b).await.unwrap();
        assert_eq!(driver.read(&fk("1")).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let driver = MemoryDriver::new();
        let doc = Document::from_json(&json!({"tier": "gold"})).unwrap();
        driver.create(&fk("1"), &doc).await.unwrap();
        driver.delete(&fk("1")).await.unwrap();
        assert_eq!(driver.read(&fk("1")).await.unwrap(), None);
    }
}
