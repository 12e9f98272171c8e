//! Document-database provider
//!
//! Records are split by category into collections of a [`Database`]:
//!
//! ```text
//! system.counters  { _id: "objects", seq: 7 }          running id counter
//! system.objects   { _id: 7, category: "people" }      id -> category routing
//! people           { <idLabel>: 7, name: "Ada", ... }  the record itself
//! default          records without a category
//! ```
//!
//! Categories starting with `system.` are rejected so records never land in
//! the internal collections.
//!
//! The routing collection doubles as the id reservation table: its `_id` is
//! unique, so a colliding id is detected and a fresh one is drawn.

use crate::cursor::{Cursor, Source};
use crate::{
    check_new, DeleteTarget, IndexDefinition, ProviderError, ProviderKind, Result,
    StorageProvider,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use shardstore_core::ops::sort_key;
use shardstore_core::{Predicate, Query, Record, CATEGORY_FIELD, ID_FIELD};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Collection for records without a category
pub const DEFAULT_CATEGORY: &str = "default";

/// Prefix of internal collection names
pub const RESERVED_PREFIX: &str = "system.";

/// id -> category routing collection
pub const ROUTING_COLLECTION: &str = "system.objects";

/// Collection holding counter documents
pub const COUNTER_COLLECTION: &str = "system.counters";

/// Primary key field of internal collections
pub const PRIMARY_KEY: &str = "_id";

const COUNTER_KEY: &str = "objects";
const SEQUENCE_FIELD: &str = "seq";
const MAX_ID_ATTEMPTS: usize = 16;

/// A stored document
pub type Document = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum DocKey {
    Int(u64),
    Text(String),
}

impl DocKey {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(Self::Int)
                .ok_or_else(|| ProviderError::Validation(format!("invalid primary key {}", n))),
            Value::String(s) => Ok(Self::Text(s.clone())),
            other => Err(ProviderError::Validation(format!(
                "invalid primary key {}",
                other
            ))),
        }
    }
}

#[derive(Default)]
struct ClientState {
    databases: DashMap<String, Database>,
    closed: AtomicBool,
}

impl ClientState {
    fn ensure_connected(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ProviderError::BackendUnavailable(
                "document client is shut down".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Handle on an in-process document database server
#[derive(Clone, Default)]
pub struct DocumentClient {
    state: Arc<ClientState>,
}

impl DocumentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database by name, created on first use
    pub fn database(&self, name: &str) -> Result<Database> {
        self.state.ensure_connected()?;
        let database = self
            .state
            .databases
            .entry(name.to_string())
            .or_insert_with(|| Database {
                name: name.to_string(),
                collections: Arc::new(DashMap::new()),
                client: Arc::clone(&self.state),
            })
            .clone();
        Ok(database)
    }

    /// Every later operation through this client fails as unavailable
    pub fn shutdown(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

/// Named set of collections
#[derive(Clone)]
pub struct Database {
    name: String,
    collections: Arc<DashMap<String, Collection>>,
    client: Arc<ClientState>,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection keyed by `_id`
    pub fn collection(&self, name: &str) -> Collection {
        self.collection_keyed(name, PRIMARY_KEY)
    }

    /// Collection keyed by `key_field`; an existing collection keeps its key
    pub fn collection_keyed(&self, name: &str, key_field: &str) -> Collection {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Collection {
                name: name.to_string(),
                key_field: key_field.to_string(),
                state: Arc::new(RwLock::new(CollectionState::default())),
                client: Arc::clone(&self.client),
            })
            .clone()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Make writes to a collection fail with `BackendUnavailable`
    pub fn freeze(&self, name: &str) {
        self.collection(name).state.write().frozen = true;
    }

    pub fn thaw(&self, name: &str) {
        self.collection(name).state.write().frozen = false;
    }
}

#[derive(Clone, Debug)]
struct IndexSpec {
    fields: Vec<String>,
    unique: bool,
}

#[derive(Default)]
struct CollectionState {
    documents: BTreeMap<DocKey, Document>,
    indexes: Vec<IndexSpec>,
    frozen: bool,
}

impl CollectionState {
    /// Reject `document` if it collides with another document on a unique
    /// index. Indexes are sparse: documents lacking every indexed field are
    /// not indexed.
    fn check_unique(&self, key: &DocKey, document: &Document) -> Result<()> {
        for index in self.indexes.iter().filter(|index| index.unique) {
            if !index.fields.iter().any(|field| document.contains_key(field)) {
                continue;
            }
            let wanted = sort_key(&Record::from(document.clone()), &index.fields);
            let clash = self.documents.iter().any(|(other_key, other)| {
                other_key != key
                    && index.fields.iter().any(|field| other.contains_key(field))
                    && sort_key(&Record::from(other.clone()), &index.fields) == wanted
            });
            if clash {
                return Err(ProviderError::DuplicateKey(format!(
                    "unique index on {:?}",
                    index.fields
                )));
            }
        }
        Ok(())
    }
}

/// A collection of documents with a unique primary key
#[derive(Clone)]
pub struct Collection {
    name: String,
    key_field: String,
    state: Arc<RwLock<CollectionState>>,
    client: Arc<ClientState>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    fn writable(&self, state: &CollectionState) -> Result<()> {
        self.client.ensure_connected()?;
        if state.frozen {
            return Err(ProviderError::BackendUnavailable(format!(
                "collection {} rejects writes",
                self.name
            )));
        }
        Ok(())
    }

    fn key_of(&self, document: &Document) -> Result<DocKey> {
        let value = document.get(&self.key_field).ok_or_else(|| {
            ProviderError::Validation(format!("document lacks key field {}", self.key_field))
        })?;
        DocKey::from_value(value)
    }

    pub fn insert_one(&self, document: Document) -> Result<()> {
        let key = self.key_of(&document)?;
        let mut state = self.state.write();
        self.writable(&state)?;
        if state.documents.contains_key(&key) {
            return Err(ProviderError::DuplicateKey(format!(
                "{}.{} = {:?}",
                self.name, self.key_field, key
            )));
        }
        state.check_unique(&key, &document)?;
        state.documents.insert(key, document);
        Ok(())
    }

    pub fn find_one(&self, key: &Value) -> Result<Option<Document>> {
        self.client.ensure_connected()?;
        let key = DocKey::from_value(key)?;
        Ok(self.state.read().documents.get(&key).cloned())
    }

    /// Documents in key order, optionally filtered
    pub fn find(&self, filter: Option<&Predicate>) -> Result<Vec<Document>> {
        self.client.ensure_connected()?;
        let state = self.state.read();
        Ok(state
            .documents
            .values()
            .filter(|document| {
                filter.map_or(true, |predicate| {
                    predicate.matches(&Record::from((*document).clone()))
                })
            })
            .cloned()
            .collect())
    }

    /// Replace the document with this key; false if there is none
    pub fn replace_one(&self, key: &Value, document: Document) -> Result<bool> {
        let key = DocKey::from_value(key)?;
        let mut state = self.state.write();
        self.writable(&state)?;
        if !state.documents.contains_key(&key) {
            return Ok(false);
        }
        state.check_unique(&key, &document)?;
        state.documents.insert(key, document);
        Ok(true)
    }

    pub fn delete_one(&self, key: &Value) -> Result<bool> {
        let key = DocKey::from_value(key)?;
        let mut state = self.state.write();
        self.writable(&state)?;
        Ok(state.documents.remove(&key).is_some())
    }

    pub fn delete_many(&self, keys: &[Value]) -> Result<usize> {
        let keys = keys
            .iter()
            .map(DocKey::from_value)
            .collect::<Result<Vec<_>>>()?;
        let mut state = self.state.write();
        self.writable(&state)?;
        Ok(keys
            .iter()
            .filter(|key| state.documents.remove(key).is_some())
            .count())
    }

    /// Atomically add one to a numeric field; `None` if the document is missing
    pub fn increment(&self, key: &Value, field: &str) -> Result<Option<u64>> {
        let key = DocKey::from_value(key)?;
        let mut state = self.state.write();
        self.writable(&state)?;
        let Some(document) = state.documents.get_mut(&key) else {
            return Ok(None);
        };
        let next = document.get(field).and_then(Value::as_u64).unwrap_or(0) + 1;
        document.insert(field.to_string(), Value::from(next));
        Ok(Some(next))
    }

    pub fn count(&self) -> Result<usize> {
        self.client.ensure_connected()?;
        Ok(self.state.read().documents.len())
    }

    /// Add an index; building a unique index over clashing documents fails
    pub fn create_index(&self, fields: Vec<String>, unique: bool) -> Result<()> {
        if fields.is_empty() {
            return Err(ProviderError::Validation(
                "index needs at least one field".to_string(),
            ));
        }
        let mut state = self.state.write();
        self.writable(&state)?;
        if state
            .indexes
            .iter()
            .any(|index| index.fields == fields && index.unique == unique)
        {
            return Ok(());
        }
        let spec = IndexSpec { fields, unique };
        if unique {
            let mut seen = BTreeSet::new();
            for document in state.documents.values() {
                if !spec.fields.iter().any(|field| document.contains_key(field)) {
                    continue;
                }
                if !seen.insert(sort_key(&Record::from(document.clone()), &spec.fields)) {
                    return Err(ProviderError::DuplicateKey(format!(
                        "existing documents violate unique index on {:?}",
                        spec.fields
                    )));
                }
            }
        }
        state.indexes.push(spec);
        Ok(())
    }

    pub fn index_count(&self) -> usize {
        self.state.read().indexes.len()
    }
}

/// Deferred scan of a document database, resolved at fetch time
#[derive(Clone)]
pub struct DocumentScan {
    client: DocumentClient,
    database: String,
    id_label: String,
    category: Option<String>,
}

impl DocumentScan {
    pub(crate) async fn load(&self) -> Result<Vec<Record>> {
        let database = self.client.database(&self.database)?;
        let categories = match &self.category {
            Some(category) => vec![category.clone()],
            None => categories(&database)?,
        };
        let mut records = Vec::new();
        for category in categories {
            for document in database.collection_keyed(&category, &self.id_label).find(None)? {
                records.push(from_document(document, &self.id_label));
            }
        }
        records.sort_by_key(Record::id);
        Ok(records)
    }
}

/// Categories that currently own at least one record
fn categories(database: &Database) -> Result<Vec<String>> {
    let names: BTreeSet<String> = database
        .collection(ROUTING_COLLECTION)
        .find(None)?
        .iter()
        .map(|entry| routed_category(entry).to_string())
        .collect();
    Ok(names.into_iter().collect())
}

/// Collection holding records of `category`
fn category_collection(category: Option<&str>) -> Result<String> {
    match category {
        Some(name) if name.starts_with(RESERVED_PREFIX) => Err(ProviderError::Validation(format!(
            "category {} uses the reserved prefix {}",
            name, RESERVED_PREFIX
        ))),
        Some(name) => Ok(name.to_string()),
        None => Ok(DEFAULT_CATEGORY.to_string()),
    }
}

fn routed_category(entry: &Document) -> &str {
    entry
        .get(CATEGORY_FIELD)
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CATEGORY)
}

fn routing_entry(id: u64, category: &str) -> Document {
    let mut entry = Map::new();
    entry.insert(PRIMARY_KEY.to_string(), Value::from(id));
    entry.insert(CATEGORY_FIELD.to_string(), Value::from(category));
    entry
}

fn to_document(record: Record, id: u64, id_label: &str) -> Document {
    let mut document = record.into_map();
    document.remove(ID_FIELD);
    document.insert(id_label.to_string(), Value::from(id));
    document
}

fn from_document(mut document: Document, id_label: &str) -> Record {
    let id = document.remove(id_label);
    let mut record = Record::from(document);
    if let Some(id) = id {
        record.insert(ID_FIELD, id);
    }
    record
}

/// Provider storing records in a [`DocumentClient`] database
pub struct DocumentProvider {
    client: DocumentClient,
    database_name: String,
    id_label: String,
    database: OnceCell<Database>,
}

impl DocumentProvider {
    pub fn new(client: DocumentClient, database_name: impl Into<String>) -> Self {
        Self {
            client,
            database_name: database_name.into(),
            id_label: PRIMARY_KEY.to_string(),
            database: OnceCell::new(),
        }
    }

    /// Field the record id is stored under (default `_id`)
    pub fn with_id_label(mut self, id_label: impl Into<String>) -> Self {
        self.id_label = id_label.into();
        self
    }

    pub fn id_label(&self) -> &str {
        &self.id_label
    }

    async fn db(&self) -> Result<&Database> {
        self.database
            .get_or_try_init(|| async {
                let database = self.client.database(&self.database_name)?;
                info!(database = %self.database_name, "opened document provider");
                Ok::<Database, ProviderError>(database)
            })
            .await
    }

    fn records(&self, database: &Database, category: &str) -> Collection {
        database.collection_keyed(category, &self.id_label)
    }

    /// Draw ids until one can be reserved in the routing collection
    async fn reserve_id(&self, database: &Database, category: &str) -> Result<u64> {
        let routing = database.collection(ROUTING_COLLECTION);
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = self.generate_id().await?;
            match routing.insert_one(routing_entry(id, category)) {
                Ok(()) => return Ok(id),
                Err(ProviderError::DuplicateKey(_)) => {
                    debug!(id, attempt, "id already reserved, drawing another");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProviderError::BackendUnavailable(format!(
            "no free id after {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    /// Write a record whose routing entry is already in place; a failed
    /// write releases the entry again
    fn store_routed(&self, database: &Database, id: u64, category: &str, record: Record) -> Result<()> {
        let document = to_document(record, id, &self.id_label);
        if let Err(e) = self.records(database, category).insert_one(document) {
            if let Err(undo) = database
                .collection(ROUTING_COLLECTION)
                .delete_one(&Value::from(id))
            {
                warn!(id, error = %undo, "could not release id after failed insert");
            }
            return Err(e);
        }
        Ok(())
    }

    fn route(&self, database: &Database, id: u64) -> Result<Option<String>> {
        Ok(database
            .collection(ROUTING_COLLECTION)
            .find_one(&Value::from(id))?
            .map(|entry| routed_category(&entry).to_string()))
    }
}

#[async_trait]
impl StorageProvider for DocumentProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Document
    }

    async fn open(&self) -> Result<()> {
        self.db().await.map(|_| ())
    }

    /// Counter document incremented in place; the first caller creates it.
    /// Losing the creation race shows up as `DuplicateKey` and is retried.
    async fn generate_id(&self) -> Result<u64> {
        let counters = self.db().await?.collection(COUNTER_COLLECTION);
        let key = Value::from(COUNTER_KEY);
        for attempt in 1..=MAX_ID_ATTEMPTS {
            if let Some(id) = counters.increment(&key, SEQUENCE_FIELD)? {
                return Ok(id);
            }
            tokio::task::yield_now().await;
            let mut counter = Map::new();
            counter.insert(PRIMARY_KEY.to_string(), key.clone());
            counter.insert(SEQUENCE_FIELD.to_string(), Value::from(1u64));
            match counters.insert_one(counter) {
                Ok(()) => return Ok(1),
                Err(ProviderError::DuplicateKey(_)) => {
                    debug!(attempt, "counter created concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProviderError::BackendUnavailable(
            "id counter kept changing under contention".to_string(),
        ))
    }

    #[instrument(skip(self, record), fields(database = %self.database_name))]
    async fn create(&self, record: Record) -> Result<u64> {
        check_new(&record)?;
        let database = self.db().await?;
        let category = category_collection(record.category())?;
        let id = self.reserve_id(database, &category).await?;
        self.store_routed(database, id, &category, record)?;
        debug!(id, category = %category, "created record");
        Ok(id)
    }

    #[instrument(skip(self, record), fields(database = %self.database_name))]
    async fn insert(&self, record: Record) -> Result<u64> {
        let id = record.require_id("insert")?;
        let database = self.db().await?;
        let category = category_collection(record.category())?;
        database
            .collection(ROUTING_COLLECTION)
            .insert_one(routing_entry(id, &category))?;
        self.store_routed(database, id, &category, record)?;
        debug!(id, category = %category, "inserted record");
        Ok(id)
    }

    async fn get(&self, id: u64) -> Result<Record> {
        let database = self.db().await?;
        let category = self.route(database, id)?.ok_or(ProviderError::NotFound(id))?;
        self.records(database, &category)
            .find_one(&Value::from(id))?
            .map(|document| from_document(document, &self.id_label))
            .ok_or(ProviderError::NotFound(id))
    }

    #[instrument(skip(self, record), fields(database = %self.database_name))]
    async fn update(&self, record: Record) -> Result<()> {
        let id = record.require_id("update")?;
        let database = self.db().await?;
        let current = self.route(database, id)?.ok_or(ProviderError::NotFound(id))?;
        let category = category_collection(record.category())?;
        let key = Value::from(id);
        let document = to_document(record, id, &self.id_label);

        if category == current {
            return if self.records(database, &category).replace_one(&key, document)? {
                Ok(())
            } else {
                Err(ProviderError::NotFound(id))
            };
        }

        // category changed: move the record, then repoint the routing entry
        self.records(database, &category).insert_one(document)?;
        self.records(database, &current).delete_one(&key)?;
        database
            .collection(ROUTING_COLLECTION)
            .replace_one(&key, routing_entry(id, &category))?;
        debug!(id, from = %current, to = %category, "moved record");
        Ok(())
    }

    /// Query deletes remove routing entries first, then the records. If the
    /// second step fails the routing entries stay deleted and the error is
    /// returned: the records become unreachable but are not removed.
    #[instrument(skip(self), fields(database = %self.database_name))]
    async fn delete(&self, target: DeleteTarget) -> Result<usize> {
        let database = self.db().await?;
        let routing = database.collection(ROUTING_COLLECTION);
        match target {
            DeleteTarget::Id(id) => {
                let Some(category) = self.route(database, id)? else {
                    return Ok(0);
                };
                let key = Value::from(id);
                routing.delete_one(&key)?;
                self.records(database, &category).delete_one(&key)?;
                Ok(1)
            }
            DeleteTarget::Query(query) => {
                let predicate = query.predicate()?;
                let categories = match query.category() {
                    Some(category) => vec![category_collection(Some(&category))?],
                    None => categories(database)?,
                };

                let mut doomed: Vec<(String, Vec<Value>)> = Vec::new();
                for category in categories {
                    let ids: Vec<Value> = self
                        .records(database, &category)
                        .find(None)?
                        .into_iter()
                        .map(|document| from_document(document, &self.id_label))
                        .filter(|record| predicate.matches(record))
                        .filter_map(|record| record.id().map(Value::from))
                        .collect();
                    if !ids.is_empty() {
                        doomed.push((category, ids));
                    }
                }

                let all: Vec<Value> = doomed.iter().flat_map(|(_, ids)| ids.clone()).collect();
                routing.delete_many(&all)?;

                let mut removed = 0;
                for (category, ids) in &doomed {
                    match self.records(database, category).delete_many(ids) {
                        Ok(n) => removed += n,
                        Err(e) => {
                            warn!(
                                category = %category,
                                unrouted = all.len(),
                                error = %e,
                                "routing entries removed but records were not"
                            );
                            return Err(e);
                        }
                    }
                }
                Ok(removed)
            }
        }
    }

    fn cursor(&self, query: Query) -> Result<Cursor> {
        let category = match query.category() {
            Some(category) => Some(category_collection(Some(&category))?),
            None => None,
        };
        let scan = DocumentScan {
            client: self.client.clone(),
            database: self.database_name.clone(),
            id_label: self.id_label.clone(),
            category,
        };
        Ok(Cursor::filtered(Source::Document(scan), query))
    }

    #[instrument(skip(self), fields(database = %self.database_name))]
    async fn index(&self, definition: IndexDefinition) -> Result<()> {
        let database = self.db().await?;
        let category = category_collection(definition.category.as_deref())?;
        if definition.background {
            debug!("background index builds complete synchronously");
        }
        self.records(database, &category)
            .create_index(definition.fields, definition.unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> (DocumentClient, DocumentProvider) {
        let client = DocumentClient::new();
        let provider = DocumentProvider::new(client.clone(), "app");
        (client, provider)
    }

    #[tokio::test]
    async fn test_layout_splits_by_category() {
        let (client, provider) = provider();
        let ada = provider
            .create(Record::new().with("name", "Ada").with("category", "people"))
            .await
            .unwrap();
        let misc = provider.create(Record::new().with("name", "box")).await.unwrap();

        let database = client.database("app").unwrap();
        assert_eq!(
            database.collection_names(),
            ["default", "people", "system.counters", "system.objects"]
        );
        let stored = database.collection("people").find_one(&json!(ada)).unwrap().unwrap();
        assert_eq!(stored.get("_id"), Some(&json!(ada)));
        assert!(!stored.contains_key("id"));

        let record = provider.get(misc).await.unwrap();
        assert_eq!(record.id(), Some(misc));
        assert_eq!(record.get("name"), Some(&json!("box")));
    }

    #[rstest::rstest]
    #[case("system.objects")]
    #[case("system.counters")]
    #[case("system.indexes")]
    #[tokio::test]
    async fn test_reserved_categories_are_rejected(#[case] category: &str) {
        let (_, provider) = provider();
        provider.create(Record::new().with("name", "x")).await.unwrap();

        let err = provider
            .create(Record::new().with("category", category))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)), "{:?}", err);
        assert!(matches!(
            provider.cursor(Query::new().with("category", category)),
            Err(ProviderError::Validation(_))
        ));
        assert!(matches!(
            provider.update(Record::new().with("id", 1).with("category", category)).await,
            Err(ProviderError::Validation(_))
        ));

        // the internal documents never show up as records
        let all = provider.cursor(Query::new()).unwrap().fetch().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id(), Some(1));
    }

    #[tokio::test]
    async fn test_internal_names_are_plain_categories_without_the_prefix() {
        let (_, provider) = provider();
        let objects = provider.create(Record::new().with("category", "objects")).await.unwrap();
        let counters = provider.create(Record::new().with("category", "counters")).await.unwrap();
        assert_eq!((objects, counters), (1, 2));

        let all = provider.cursor(Query::new()).unwrap().fetch().await.unwrap();
        let categories: Vec<_> = all.iter().map(|r| r.category()).collect();
        assert_eq!(categories, [Some("objects"), Some("counters")]);
        assert_eq!(provider.generate_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_insert_uses_carried_id() {
        let (_, provider) = provider();
        let id = provider
            .insert(Record::new().with("id", 9).with("category", "people"))
            .await
            .unwrap();
        assert_eq!(id, 9);
        assert_eq!(provider.get(9).await.unwrap().category(), Some("people"));
        assert!(matches!(
            provider.insert(Record::new().with("id", 9)).await,
            Err(ProviderError::DuplicateKey(_))
        ));
        // the counter is untouched
        assert_eq!(provider.create(Record::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_custom_id_label() {
        let client = DocumentClient::new();
        let provider = DocumentProvider::new(client.clone(), "app").with_id_label("uid");
        let id = provider.create(Record::new().with("category", "c")).await.unwrap();

        let stored = client
            .database("app")
            .unwrap()
            .collection("c")
            .find_one(&json!(id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("uid"), Some(&json!(id)));
        assert_eq!(provider.get(id).await.unwrap().id(), Some(id));
    }

    #[tokio::test]
    async fn test_concurrent_id_generation() {
        let (_, provider) = provider();
        let provider = Arc::new(provider);
        let handles: Vec<_> = (0..24)
            .map(|_| {
                let provider = Arc::clone(&provider);
                tokio::spawn(async move { provider.generate_id().await })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=24).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_reserved_ids_are_skipped() {
        let (client, provider) = provider();
        // an id claimed outside the counter, e.g. by an imported record
        client
            .database("app")
            .unwrap()
            .collection(ROUTING_COLLECTION)
            .insert_one(routing_entry(1, "people"))
            .unwrap();

        let id = provider.create(Record::new().with("name", "x")).await.unwrap();
        assert_eq!(id, 2);
    }

    #[tokio::test]
    async fn test_update_moves_between_categories() {
        let (client, provider) = provider();
        let id = provider
            .create(Record::new().with("name", "Tom").with("category", "people"))
            .await
            .unwrap();
        provider
            .update(Record::new().with("id", id).with("name", "Tom").with("category", "cats"))
            .await
            .unwrap();

        let database = client.database("app").unwrap();
        assert_eq!(database.collection("people").count().unwrap(), 0);
        assert_eq!(provider.get(id).await.unwrap().category(), Some("cats"));
        assert_eq!(
            provider.update(Record::new().with("id", 77)).await,
            Err(ProviderError::NotFound(77))
        );
    }

    #[tokio::test]
    async fn test_unique_index_surfaces_duplicates() {
        let (_, provider) = provider();
        provider
            .index(IndexDefinition::new(["email"]).in_category("people").unique())
            .await
            .unwrap();
        provider
            .create(Record::new().with("email", "a@x").with("category", "people"))
            .await
            .unwrap();

        let clash = provider
            .create(Record::new().with("email", "a@x").with("category", "people"))
            .await;
        assert!(matches!(clash, Err(ProviderError::DuplicateKey(_))));

        // the failed create released its id reservation
        let next = provider
            .create(Record::new().with("email", "b@x").with("category", "people"))
            .await
            .unwrap();
        assert_eq!(provider.get(next).await.unwrap().get("email"), Some(&json!("b@x")));
        assert_eq!(provider.get(2).await, Err(ProviderError::NotFound(2)));
    }

    #[tokio::test]
    async fn test_delete_by_query_partial_failure() {
        let (client, provider) = provider();
        for name in ["Tom", "Felix"] {
            provider
                .create(Record::new().with("name", name).with("category", "cats"))
                .await
                .unwrap();
        }
        let database = client.database("app").unwrap();
        database.freeze("cats");

        let result = provider
            .delete(DeleteTarget::Query(Query::new().with("category", "cats")))
            .await;
        assert!(matches!(result, Err(ProviderError::BackendUnavailable(_))));

        // routing is gone, the records are stranded
        assert_eq!(database.collection(ROUTING_COLLECTION).count().unwrap(), 0);
        assert_eq!(database.collection("cats").count().unwrap(), 2);
        assert_eq!(provider.get(1).await, Err(ProviderError::NotFound(1)));
    }

    #[tokio::test]
    async fn test_delete_by_query_across_categories() {
        let (_, provider) = provider();
        provider.create(Record::new().with("born", 1452).with("category", "people")).await.unwrap();
        provider.create(Record::new().with("born", 1867).with("category", "people")).await.unwrap();
        provider.create(Record::new().with("born", 1000)).await.unwrap();

        let removed = provider
            .delete(DeleteTarget::Query(Query::new().with("born", "<1500")))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(provider.delete(DeleteTarget::Id(1)).await.unwrap(), 0);
        assert_eq!(provider.get(2).await.unwrap().get("born"), Some(&json!(1867)));
    }

    #[tokio::test]
    async fn test_cursor_count_and_unsupported_sum() {
        let (_, provider) = provider();
        for born in [1452, 1643, 1265] {
            provider
                .create(Record::new().with("born", born).with("category", "people"))
                .await
                .unwrap();
        }
        let mut cursor = provider
            .cursor(Query::new().with("category", "people").with("born", ">1300"))
            .unwrap();
        assert_eq!(cursor.count().await.unwrap(), 2);

        let mut cursor = provider.cursor(Query::new()).unwrap();
        assert!(matches!(
            cursor.sum("born").await,
            Err(ProviderError::NotImplemented(_))
        ));
        let all = provider.cursor(Query::new()).unwrap().order(["born"]).fetch().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].get("born"), Some(&json!(1265)));
    }

    #[tokio::test]
    async fn test_shutdown_makes_backend_unavailable() {
        let (client, provider) = provider();
        client.shutdown();
        assert!(matches!(
            provider.open().await,
            Err(ProviderError::BackendUnavailable(_))
        ));

        let (client, provider) = self::provider();
        provider.open().await.unwrap();
        client.shutdown();
        assert!(matches!(
            provider.create(Record::new()).await,
            Err(ProviderError::BackendUnavailable(_))
        ));
    }
}
