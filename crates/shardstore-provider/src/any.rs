//! Enum dispatch over every provider variant

use crate::cursor::Cursor;
use crate::{
    DeleteTarget, DocumentClient, DocumentProvider, FileSystemProvider, IndexDefinition,
    IndexedDbFactory, IndexedDbProvider, MemoryProvider, OpenOptions, ProviderError,
    ProviderKind, RemoteProvider, Result, SelectOptions, StorageProvider, WebStorage,
    WebStorageProvider,
};
use async_trait::async_trait;
use shardstore_core::{Query, Record};
use std::sync::OnceLock;
use tracing::info;

/// Live backend handles local providers are opened against
#[derive(Clone, Default)]
pub struct Backends {
    pub indexed_db: IndexedDbFactory,
    pub web_storage: WebStorage,
    pub documents: DocumentClient,
}

impl Backends {
    /// Process-wide handles, created on first use
    pub fn global() -> &'static Backends {
        static GLOBAL: OnceLock<Backends> = OnceLock::new();
        GLOBAL.get_or_init(Backends::default)
    }
}

/// Any storage provider
pub enum AnyProvider {
    Memory(MemoryProvider),
    FileSystem(FileSystemProvider),
    IndexedDb(IndexedDbProvider),
    WebStorage(WebStorageProvider),
    Document(DocumentProvider),
    Remote(RemoteProvider),
}

impl AnyProvider {
    /// Build the local provider `options` describe
    pub fn from_options(options: &OpenOptions, backends: &Backends) -> Result<Self> {
        options.validate()?;
        let missing = |key: &str| ProviderError::Validation(format!("missing option {}", key));
        let provider = match options.provider {
            ProviderKind::Memory => Self::Memory(MemoryProvider::new()),
            ProviderKind::FileSystem => {
                let path = options.path.clone().ok_or_else(|| missing("path"))?;
                Self::FileSystem(FileSystemProvider::new(path))
            }
            ProviderKind::IndexedDb => {
                let database = options.database_name.as_deref().ok_or_else(|| missing("databaseName"))?;
                let store = options.store_name.as_deref().ok_or_else(|| missing("storeName"))?;
                Self::IndexedDb(IndexedDbProvider::new(backends.indexed_db.open(database, store)))
            }
            ProviderKind::WebStorage => {
                let store = options.store_name.as_deref().ok_or_else(|| missing("storeName"))?;
                Self::WebStorage(WebStorageProvider::new(backends.web_storage.area(store)))
            }
            ProviderKind::Document => {
                let database = options.database_name.clone().ok_or_else(|| missing("databaseName"))?;
                let mut provider = DocumentProvider::new(backends.documents.clone(), database);
                if let Some(label) = &options.id_label {
                    provider = provider.with_id_label(label.clone());
                }
                Self::Document(provider)
            }
            ProviderKind::Remote => {
                return Err(ProviderError::Validation(
                    "remote providers are created with connect".to_string(),
                ))
            }
        };
        info!(kind = %options.provider, "configured local provider");
        Ok(provider)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether records survive the process
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::FileSystem(_) | Self::Remote(_))
    }
}

impl From<MemoryProvider> for AnyProvider {
    fn from(provider: MemoryProvider) -> Self {
        Self::Memory(provider)
    }
}

impl From<RemoteProvider> for AnyProvider {
    fn from(provider: RemoteProvider) -> Self {
        Self::Remote(provider)
    }
}

#[async_trait]
impl StorageProvider for AnyProvider {
    fn kind(&self) -> ProviderKind {
        match self {
            Self::Memory(p) => p.kind(),
            Self::FileSystem(p) => p.kind(),
            Self::IndexedDb(p) => p.kind(),
            Self::WebStorage(p) => p.kind(),
            Self::Document(p) => p.kind(),
            Self::Remote(p) => p.kind(),
        }
    }

    async fn open(&self) -> Result<()> {
        match self {
            Self::Memory(p) => p.open().await,
            Self::FileSystem(p) => p.open().await,
            Self::IndexedDb(p) => p.open().await,
            Self::WebStorage(p) => p.open().await,
            Self::Document(p) => p.open().await,
            Self::Remote(p) => p.open().await,
        }
    }

    async fn generate_id(&self) -> Result<u64> {
        match self {
            Self::Memory(p) => p.generate_id().await,
            Self::FileSystem(p) => p.generate_id().await,
            Self::IndexedDb(p) => p.generate_id().await,
            Self::WebStorage(p) => p.generate_id().await,
            Self::Document(p) => p.generate_id().await,
            Self::Remote(p) => p.generate_id().await,
        }
    }

    async fn create(&self, record: Record) -> Result<u64> {
        match self {
            Self::Memory(p) => p.create(record).await,
            Self::FileSystem(p) => p.create(record).await,
            Self::IndexedDb(p) => p.create(record).await,
            Self::WebStorage(p) => p.create(record).await,
            Self::Document(p) => p.create(record).await,
            Self::Remote(p) => p.create(record).await,
        }
    }

    async fn insert(&self, record: Record) -> Result<u64> {
        match self {
            Self::Memory(p) => p.insert(record).await,
            Self::FileSystem(p) => p.insert(record).await,
            Self::IndexedDb(p) => p.insert(record).await,
            Self::WebStorage(p) => p.insert(record).await,
            Self::Document(p) => p.insert(record).await,
            Self::Remote(p) => p.insert(record).await,
        }
    }

    async fn get(&self, id: u64) -> Result<Record> {
        match self {
            Self::Memory(p) => p.get(id).await,
            Self::FileSystem(p) => p.get(id).await,
            Self::IndexedDb(p) => p.get(id).await,
            Self::WebStorage(p) => p.get(id).await,
            Self::Document(p) => p.get(id).await,
            Self::Remote(p) => p.get(id).await,
        }
    }

    async fn update(&self, record: Record) -> Result<()> {
        match self {
            Self::Memory(p) => p.update(record).await,
            Self::FileSystem(p) => p.update(record).await,
            Self::IndexedDb(p) => p.update(record).await,
            Self::WebStorage(p) => p.update(record).await,
            Self::Document(p) => p.update(record).await,
            Self::Remote(p) => p.update(record).await,
        }
    }

    async fn delete(&self, target: DeleteTarget) -> Result<usize> {
        match self {
            Self::Memory(p) => p.delete(target).await,
            Self::FileSystem(p) => p.delete(target).await,
            Self::IndexedDb(p) => p.delete(target).await,
            Self::WebStorage(p) => p.delete(target).await,
            Self::Document(p) => p.delete(target).await,
            Self::Remote(p) => p.delete(target).await,
        }
    }

    fn cursor(&self, query: Query) -> Result<Cursor> {
        match self {
            Self::Memory(p) => p.cursor(query),
            Self::FileSystem(p) => p.cursor(query),
            Self::IndexedDb(p) => p.cursor(query),
            Self::WebStorage(p) => p.cursor(query),
            Self::Document(p) => p.cursor(query),
            Self::Remote(p) => p.cursor(query),
        }
    }

    async fn index(&self, definition: IndexDefinition) -> Result<()> {
        match self {
            Self::Memory(p) => p.index(definition).await,
            Self::FileSystem(p) => p.index(definition).await,
            Self::IndexedDb(p) => p.index(definition).await,
            Self::WebStorage(p) => p.index(definition).await,
            Self::Document(p) => p.index(definition).await,
            Self::Remote(p) => p.index(definition).await,
        }
    }

    async fn select(&self, query: Query, options: SelectOptions) -> Result<Vec<Record>> {
        match self {
            Self::Memory(p) => p.select(query, options).await,
            Self::FileSystem(p) => p.select(query, options).await,
            Self::IndexedDb(p) => p.select(query, options).await,
            Self::WebStorage(p) => p.select(query, options).await,
            Self::Document(p) => p.select(query, options).await,
            Self::Remote(p) => p.select(query, options).await,
        }
    }
}
