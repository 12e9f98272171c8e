//! In-memory provider for tests and single-process nodes

use crate::cursor::{Cursor, MemorySource, Source};
use crate::{
    check_new, DeleteTarget, IndexDefinition, ProviderError, ProviderKind, Result,
    StorageProvider,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shardstore_core::{Query, Record};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

/// A provider keeping every record in a concurrent map
#[derive(Clone, Default)]
pub struct MemoryProvider {
    records: Arc<DashMap<u64, Record>>,
    counter: Arc<AtomicU64>,
}

impl MemoryProvider {
    /// Create a new empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record; the id counter keeps running
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn generate_id(&self) -> Result<u64> {
        Ok(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[instrument(skip(self, record))]
    async fn create(&self, mut record: Record) -> Result<u64> {
        check_new(&record)?;
        let id = self.generate_id().await?;
        record.set_id(id);
        self.records.insert(id, record);
        debug!(id, "created record");
        Ok(id)
    }

    #[instrument(skip(self, record))]
    async fn insert(&self, record: Record) -> Result<u64> {
        let id = record.require_id("insert")?;
        match self.records.entry(id) {
            Entry::Occupied(_) => Err(ProviderError::DuplicateKey(format!("id {}", id))),
            Entry::Vacant(slot) => {
                slot.insert(record);
                debug!(id, "inserted record");
                Ok(id)
            }
        }
    }

    async fn get(&self, id: u64) -> Result<Record> {
        self.records
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ProviderError::NotFound(id))
    }

    #[instrument(skip(self, record))]
    async fn update(&self, record: Record) -> Result<()> {
        let id = record.require_id("update")?;
        match self.records.get_mut(&id) {
            Some(mut entry) => {
                *entry = record;
                Ok(())
            }
            None => Err(ProviderError::NotFound(id)),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, target: DeleteTarget) -> Result<usize> {
        match target {
            DeleteTarget::Id(id) => Ok(usize::from(self.records.remove(&id).is_some())),
            DeleteTarget::Query(query) => {
                let predicate = query.predicate()?;
                let doomed: Vec<u64> = self
                    .records
                    .iter()
                    .filter(|entry| predicate.matches(entry.value()))
                    .map(|entry| *entry.key())
                    .collect();
                Ok(doomed
                    .into_iter()
                    .filter(|id| self.records.remove(id).is_some())
                    .count())
            }
        }
    }

    fn cursor(&self, query: Query) -> Result<Cursor> {
        Ok(Cursor::filtered(
            Source::Memory(MemorySource::Table(Arc::clone(&self.records))),
            query,
        ))
    }

    async fn index(&self, definition: IndexDefinition) -> Result<()> {
        debug!(fields = ?definition.fields, "memory provider ignores index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SelectOptions;
    use serde_json::json;

    async fn seeded() -> MemoryProvider {
        let provider = MemoryProvider::new();
        for (name, born) in [
            ("Leonardo", 1452),
            ("Newton", 1643),
            ("Dante", 1265),
            ("Al-Khwarizmi", 780),
            ("Curie", 1867),
        ] {
            provider
                .create(Record::new().with("name", name).with("born", born).with("category", "people"))
                .await
                .unwrap();
        }
        provider
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let provider = MemoryProvider::new();
        let id = provider.create(Record::new().with("name", "x")).await.unwrap();
        assert_eq!(id, 1);

        let record = provider.get(id).await.unwrap();
        assert_eq!(record.get("name"), Some(&json!("x")));
        assert_eq!(record.id(), Some(id));
    }

    #[tokio::test]
    async fn test_create_rejects_preset_id() {
        let provider = MemoryProvider::new();
        let result = provider.create(Record::new().with("id", 9)).await;
        assert!(matches!(result, Err(ProviderError::Validation(_))));
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_insert_keeps_carried_id() {
        let provider = MemoryProvider::new();
        assert_eq!(provider.insert(Record::new().with("id", 42).with("n", 1)).await.unwrap(), 42);
        assert_eq!(provider.get(42).await.unwrap().get("n"), Some(&json!(1)));
        assert!(matches!(
            provider.insert(Record::new().with("id", 42)).await,
            Err(ProviderError::DuplicateKey(_))
        ));
        assert!(matches!(
            provider.insert(Record::new()).await,
            Err(ProviderError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_semantics() {
        let provider = MemoryProvider::new();
        let id = provider.create(Record::new().with("name", "x").with("extra", 1)).await.unwrap();

        provider.update(Record::new().with("id", id).with("name", "y")).await.unwrap();
        let record = provider.get(id).await.unwrap();
        assert_eq!(record.get("name"), Some(&json!("y")));
        assert!(!record.contains_key("extra"));

        assert_eq!(
            provider.update(Record::new().with("id", 99)).await,
            Err(ProviderError::NotFound(99))
        );
        assert!(matches!(
            provider.update(Record::new().with("name", "z")).await,
            Err(ProviderError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_by_id_and_query() {
        let provider = seeded().await;
        assert_eq!(provider.delete(DeleteTarget::Id(1)).await.unwrap(), 1);
        assert_eq!(provider.delete(DeleteTarget::Id(1)).await.unwrap(), 0);
        assert_eq!(provider.get(1).await, Err(ProviderError::NotFound(1)));

        let removed = provider
            .delete(Query::new().with("category", "people").with("born", "<1500").into())
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(provider.len(), 2);
    }

    #[tokio::test]
    async fn test_select_with_options() {
        let provider = seeded().await;
        let options = SelectOptions {
            order: vec!["born".into()],
            descending: true,
            limit: Some(2),
        };
        let records = provider.select(Query::new(), options).await.unwrap();
        let born: Vec<_> = records.iter().map(|r| r.get("born").cloned().unwrap()).collect();
        assert_eq!(born, [json!(1867), json!(1643)]);
    }

    #[tokio::test]
    async fn test_cursor_sees_later_writes() {
        let provider = seeded().await;
        let mut cursor = provider.cursor(Query::new().with("born", ">1800")).unwrap();
        provider
            .create(Record::new().with("name", "Turing").with("born", 1912))
            .await
            .unwrap();
        assert_eq!(cursor.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_unique() {
        let provider = MemoryProvider::new();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.generate_id().await.unwrap() })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(ids.first(), Some(&1));
    }
}
