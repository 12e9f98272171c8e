//! # Shardstore Provider
//!
//! Storage backends for the shardstore document engine.
//!
//! This crate provides:
//! - **StorageProvider**: the uniform CRUD + select + index capability
//! - **Cursor**: a lazy JSQL program folded over a provider's dataset
//! - **Backends**: memory, filesystem, IndexedDB-like and WebStorage
//!   key-value stores, a document database and remote nodes over HTTP
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 AnyProvider (enum)                  │
//! ├─────────────────────────────────────────────────────┤
//! │                StorageProvider Trait                │
//! ├────────┬──────┬──────────┬────────────┬─────────────┤
//! │ Memory │  Fs  │ KeyValue │  Document  │   Remote    │
//! ├────────┴──────┴──────────┴────────────┴─────────────┤
//! │            Cursor (program over a Source)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use shardstore_provider::{MemoryProvider, StorageProvider};
//!
//! let provider = MemoryProvider::new();
//! let id = provider.create(Record::new().with("name", "x")).await?;
//! let people = provider
//!     .cursor(Query::new().with("born", "<1500"))?
//!     .order(["born"])
//!     .fetch()
//!     .await?;
//! ```

pub mod any;
pub mod cursor;
pub mod document;
pub mod error;
pub mod fs;
pub mod kv;
pub mod memory;
pub mod options;
pub mod remote;
pub mod wire;

pub use any::{AnyProvider, Backends};
pub use cursor::{Cursor, MemorySource, Operation, Source};
pub use document::{Collection, Database, DocumentClient, DocumentProvider, DEFAULT_CATEGORY};
pub use error::{ErrorBody, ErrorKind, ProviderError, Result};
pub use fs::FileSystemProvider;
pub use kv::{
    IndexedDbFactory, IndexedDbProvider, KeyValueProvider, KeyValueStore, ObjectStore, StoreKey,
    WebStorage, WebStorageArea, WebStorageProvider,
};
pub use memory::MemoryProvider;
pub use options::{OpenOptions, ProviderKind};
pub use remote::{HttpTransport, RemoteConfig, RemoteProvider, Request, Transport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardstore_core::{Query, Record};

/// What a `delete` call removes
#[derive(Clone, Debug, PartialEq)]
pub enum DeleteTarget {
    /// A single record
    Id(u64),
    /// Every record matching `{category, ...constraints}`
    Query(Query),
}

impl From<u64> for DeleteTarget {
    fn from(id: u64) -> Self {
        Self::Id(id)
    }
}

impl From<Query> for DeleteTarget {
    fn from(query: Query) -> Self {
        Self::Query(query)
    }
}

/// Secondary index request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexDefinition {
    pub category: Option<String>,
    pub fields: Vec<String>,
    pub unique: bool,
    pub background: bool,
}

impl IndexDefinition {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Post-processing applied by an eager `select`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectOptions {
    /// Sort fields; empty keeps provider order
    pub order: Vec<String>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl SelectOptions {
    /// Append the matching operations to a cursor program
    pub fn apply(&self, cursor: Cursor) -> Cursor {
        let cursor = match (self.order.is_empty(), self.descending) {
            (true, _) => cursor,
            (false, false) => cursor.order(self.order.clone()),
            (false, true) => cursor.desc(self.order.clone()),
        };
        match self.limit {
            Some(n) => cursor.limit(n),
            None => cursor,
        }
    }
}

/// Uniform capability every storage backend implements
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Backend variant
    fn kind(&self) -> ProviderKind;

    /// Connect or initialize the backend; idempotent per instance
    async fn open(&self) -> Result<()>;

    /// Next id from the provider-scoped monotonic counter
    async fn generate_id(&self) -> Result<u64>;

    /// Assign an id and persist the record
    async fn create(&self, record: Record) -> Result<u64>;

    /// Persist a record under the id it already carries, drawn from this
    /// provider's `generate_id`. `DuplicateKey` if the id is taken.
    async fn insert(&self, record: Record) -> Result<u64>;

    /// Point lookup by id
    async fn get(&self, id: u64) -> Result<Record>;

    /// Overwrite the record with the same id
    async fn update(&self, record: Record) -> Result<()>;

    /// Remove by id or query; returns the number of records removed
    async fn delete(&self, target: DeleteTarget) -> Result<usize>;

    /// Lazy cursor whose program starts with `query`
    fn cursor(&self, query: Query) -> Result<Cursor>;

    /// Declare a secondary index
    async fn index(&self, definition: IndexDefinition) -> Result<()>;

    /// Eager select: cursor, options, fetch
    async fn select(&self, query: Query, options: SelectOptions) -> Result<Vec<Record>> {
        let mut cursor = options.apply(self.cursor(query)?);
        cursor.fetch().await
    }
}

/// Shared checks for `create`
pub(crate) fn check_new(record: &Record) -> Result<()> {
    match record.get(shardstore_core::ID_FIELD) {
        None => Ok(()),
        Some(id) => Err(ProviderError::Validation(format!(
            "create assigns ids; record already carries id {}",
            id
        ))),
    }
}
