//! Key-value backed providers
//!
//! Two browser-style stores share one provider implementation:
//! - [`ObjectStore`]: IndexedDB-like, typed keys, structured values
//! - [`WebStorageArea`]: a prefix of a flat string -> string storage area
//!
//! Each keeps one value per record id plus a reserved counter key.

use crate::cursor::Cursor;
use crate::{
    check_new, DeleteTarget, IndexDefinition, ProviderError, ProviderKind, Result,
    StorageProvider,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use shardstore_core::{Query, Record};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

/// Key of a stored value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    Id(u64),
    /// Reserved key holding the running id counter
    Counter,
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::Counter => f.write_str("#counter"),
        }
    }
}

/// Minimal async key-value contract the provider is written against
#[async_trait]
pub trait KeyValueStore: Clone + Send + Sync + 'static {
    /// Backend variant this store represents
    fn kind(&self) -> ProviderKind;

    /// Check the backend is usable
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: StoreKey) -> Result<Option<Value>>;

    async fn put(&self, key: StoreKey, value: Value) -> Result<()>;

    /// Store `value` unless `key` is taken; returns whether it was stored
    async fn put_new(&self, key: StoreKey, value: Value) -> Result<bool>;

    /// Increment the counter key and return the new value, atomically with
    /// respect to every handle on the same store
    async fn next_counter(&self) -> Result<u64>;

    /// Returns whether a value was present
    async fn remove(&self, key: StoreKey) -> Result<bool>;

    /// Ids of every stored record, ascending
    async fn ids(&self) -> Result<Vec<u64>>;
}

/// IndexedDB-like environment: named databases of named object stores
#[derive(Clone, Default)]
pub struct IndexedDbFactory {
    databases: Arc<DashMap<String, Arc<DashMap<String, ObjectStore>>>>,
}

impl IndexedDbFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (creating on first use) `database`/`store`
    pub fn open(&self, database: &str, store: &str) -> ObjectStore {
        let stores = self
            .databases
            .entry(database.to_string())
            .or_default()
            .clone();
        let handle = stores
            .entry(store.to_string())
            .or_insert_with(|| ObjectStore::new(store))
            .clone();
        handle
    }

    /// Delete a whole database
    pub fn delete_database(&self, database: &str) -> bool {
        self.databases.remove(database).is_some()
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// One object store: ordered typed keys, JSON values
#[derive(Clone)]
pub struct ObjectStore {
    name: String,
    entries: Arc<RwLock<BTreeMap<StoreKey, Value>>>,
}

impl ObjectStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for ObjectStore {
    fn kind(&self) -> ProviderKind {
        ProviderKind::IndexedDb
    }

    async fn get(&self, key: StoreKey) -> Result<Option<Value>> {
        Ok(self.entries.read().get(&key).cloned())
    }

    async fn put(&self, key: StoreKey, value: Value) -> Result<()> {
        self.entries.write().insert(key, value);
        Ok(())
    }

    async fn put_new(&self, key: StoreKey, value: Value) -> Result<bool> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(key, value);
        Ok(true)
    }

    async fn next_counter(&self) -> Result<u64> {
        let mut entries = self.entries.write();
        let next = counter_value(entries.get(&StoreKey::Counter))? + 1;
        entries.insert(StoreKey::Counter, Value::from(next));
        Ok(next)
    }

    async fn remove(&self, key: StoreKey) -> Result<bool> {
        Ok(self.entries.write().remove(&key).is_some())
    }

    async fn ids(&self) -> Result<Vec<u64>> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter_map(|key| match key {
                StoreKey::Id(id) => Some(*id),
                StoreKey::Counter => None,
            })
            .collect())
    }
}

/// A flat string -> string storage area shared by every store name
#[derive(Clone, Default)]
pub struct WebStorage {
    items: Arc<RwLock<BTreeMap<String, String>>>,
}

impl WebStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    pub fn set_item(&self, key: impl Into<String>, value: impl Into<String>) {
        self.items.write().insert(key.into(), value.into());
    }

    pub fn remove_item(&self, key: &str) -> Option<String> {
        self.items.write().remove(key)
    }

    /// Replace the item at `key` with `f(current)` under one write lock;
    /// `None` from `f` leaves the item unchanged
    pub fn update_item<T, E>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&str>) -> std::result::Result<(Option<String>, T), E>,
    ) -> std::result::Result<T, E> {
        let mut items = self.items.write();
        let (value, out) = f(items.get(key).map(String::as_str))?;
        if let Some(value) = value {
            items.insert(key.to_string(), value);
        }
        Ok(out)
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// View of the keys under `"{store}/"`
    pub fn area(&self, store: &str) -> WebStorageArea {
        WebStorageArea {
            storage: self.clone(),
            prefix: format!("{}/", store),
        }
    }
}

/// One store name inside a [`WebStorage`]: keys `"{store}/{id}"` and
/// `"{store}/#counter"`, values JSON text
#[derive(Clone)]
pub struct WebStorageArea {
    storage: WebStorage,
    prefix: String,
}

impl WebStorageArea {
    fn item_key(&self, key: StoreKey) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl KeyValueStore for WebStorageArea {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WebStorage
    }

    async fn get(&self, key: StoreKey) -> Result<Option<Value>> {
        self.storage
            .get_item(&self.item_key(key))
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(ProviderError::from)
    }

    async fn put(&self, key: StoreKey, value: Value) -> Result<()> {
        self.storage
            .set_item(self.item_key(key), serde_json::to_string(&value)?);
        Ok(())
    }

    async fn put_new(&self, key: StoreKey, value: Value) -> Result<bool> {
        let text = serde_json::to_string(&value)?;
        self.storage.update_item(&self.item_key(key), |current| {
            Ok(match current {
                Some(_) => (None, false),
                None => (Some(text), true),
            })
        })
    }

    async fn next_counter(&self) -> Result<u64> {
        self.storage
            .update_item(&self.item_key(StoreKey::Counter), |current| -> Result<_> {
                let current = current.map(serde_json::from_str::<Value>).transpose()?;
                let next = counter_value(current.as_ref())? + 1;
                Ok((Some(next.to_string()), next))
            })
    }

    async fn remove(&self, key: StoreKey) -> Result<bool> {
        Ok(self.storage.remove_item(&self.item_key(key)).is_some())
    }

    async fn ids(&self) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .storage
            .keys()
            .iter()
            .filter_map(|key| key.strip_prefix(&self.prefix))
            .filter_map(|rest| rest.parse::<u64>().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Provider over any [`KeyValueStore`]
pub struct KeyValueProvider<S: KeyValueStore> {
    store: S,
    opened: OnceCell<()>,
}

/// IndexedDB-like provider
pub type IndexedDbProvider = KeyValueProvider<ObjectStore>;

/// WebStorage provider
pub type WebStorageProvider = KeyValueProvider<WebStorageArea>;

impl<S: KeyValueStore> KeyValueProvider<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            opened: OnceCell::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn ensure_open(&self) -> Result<()> {
        self.opened
            .get_or_try_init(|| async {
                self.store.ping().await?;
                info!(kind = %self.store.kind(), "opened key-value provider");
                Ok::<(), ProviderError>(())
            })
            .await
            .map(|_| ())
    }

    async fn put_record(&self, id: u64, record: Record) -> Result<()> {
        self.store.put(StoreKey::Id(id), Value::from(record)).await
    }
}

fn counter_value(value: Option<&Value>) -> Result<u64> {
    match value {
        Some(value) => value.as_u64().ok_or_else(|| {
            ProviderError::Serialization(format!("corrupt counter value {}", value))
        }),
        None => Ok(0),
    }
}

async fn load_record<S: KeyValueStore>(store: &S, id: u64) -> Result<Option<Record>> {
    match store.get(StoreKey::Id(id)).await? {
        Some(value) => Ok(Some(Record::try_from(value)?)),
        None => Ok(None),
    }
}

async fn load_all<S: KeyValueStore>(store: S) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for id in store.ids().await? {
        if let Some(record) = load_record(&store, id).await? {
            records.push(record);
        }
    }
    Ok(records)
}

#[async_trait]
impl<S: KeyValueStore> StorageProvider for KeyValueProvider<S> {
    fn kind(&self) -> ProviderKind {
        self.store.kind()
    }

    async fn open(&self) -> Result<()> {
        self.ensure_open().await
    }

    async fn generate_id(&self) -> Result<u64> {
        self.ensure_open().await?;
        self.store.next_counter().await
    }

    #[instrument(skip(self, record), fields(kind = %self.store.kind()))]
    async fn create(&self, mut record: Record) -> Result<u64> {
        check_new(&record)?;
        let id = self.generate_id().await?;
        record.set_id(id);
        self.put_record(id, record).await?;
        debug!(id, "created record");
        Ok(id)
    }

    #[instrument(skip(self, record), fields(kind = %self.store.kind()))]
    async fn insert(&self, record: Record) -> Result<u64> {
        self.ensure_open().await?;
        let id = record.require_id("insert")?;
        if !self.store.put_new(StoreKey::Id(id), Value::from(record)).await? {
            return Err(ProviderError::DuplicateKey(format!("id {}", id)));
        }
        debug!(id, "inserted record");
        Ok(id)
    }

    async fn get(&self, id: u64) -> Result<Record> {
        self.ensure_open().await?;
        load_record(&self.store, id).await?.ok_or(ProviderError::NotFound(id))
    }

    #[instrument(skip(self, record), fields(kind = %self.store.kind()))]
    async fn update(&self, record: Record) -> Result<()> {
        self.ensure_open().await?;
        let id = record.require_id("update")?;
        if self.store.get(StoreKey::Id(id)).await?.is_none() {
            return Err(ProviderError::NotFound(id));
        }
        self.put_record(id, record).await
    }

    #[instrument(skip(self), fields(kind = %self.store.kind()))]
    async fn delete(&self, target: DeleteTarget) -> Result<usize> {
        self.ensure_open().await?;
        match target {
            DeleteTarget::Id(id) => Ok(usize::from(self.store.remove(StoreKey::Id(id)).await?)),
            DeleteTarget::Query(query) => {
                let predicate = query.predicate()?;
                let mut removed = 0;
                for record in load_all(self.store.clone()).await? {
                    if let (true, Some(id)) = (predicate.matches(&record), record.id()) {
                        removed += usize::from(self.store.remove(StoreKey::Id(id)).await?);
                    }
                }
                Ok(removed)
            }
        }
    }

    fn cursor(&self, query: Query) -> Result<Cursor> {
        let store = self.store.clone();
        Ok(Cursor::postponed(move || Box::pin(load_all(store.clone()))).matching(query))
    }

    async fn index(&self, definition: IndexDefinition) -> Result<()> {
        debug!(fields = ?definition.fields, "key-value provider ignores index");
        Ok(())
    }
}
