//! Global storage facade
//!
//! One local provider plus connections to the other shards. Reads go
//! cache -> local provider -> owning shard; writes stay local, since every
//! shard is the single writer of the ids it generates.
//!
//! Once a shard tree is assigned, ids are composed from the local counter so
//! that each one routes back to this node:
//!
//! ```text
//!   id = (sequence << bits) | slot      slot owned by this node
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use shardstore_core::{
    build_index, Query, Record, ShardDescriptor, ShardIndex, ShardTree, ID_FIELD,
};
use shardstore_provider::{
    AnyProvider, Cursor, DeleteTarget, IndexDefinition, ProviderError, ProviderKind,
    RemoteConfig, RemoteProvider, Result, SelectOptions, StorageProvider,
};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

const MAX_ID_ATTEMPTS: usize = 16;

/// How to reach another node
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectOptions {
    pub url: String,
    pub timeout: Duration,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: RemoteConfig::default().timeout,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Storage spanning every shard of the infrastructure
pub struct GlobalStorage {
    name: String,
    local: AnyProvider,
    index: RwLock<Option<ShardIndex<ShardDescriptor>>>,
    /// Remote providers keyed by base URL
    remotes: DashMap<String, Arc<RemoteProvider>>,
    cache: Option<Mutex<LruCache<u64, Record>>>,
    // bumped under the cache lock by every invalidation
    cache_epoch: AtomicU64,
    remote_timeout: Duration,
}

impl GlobalStorage {
    /// Facade named `name` over `local`
    pub fn new(name: impl Into<String>, local: AnyProvider) -> Self {
        Self {
            name: name.into(),
            local,
            index: RwLock::new(None),
            remotes: DashMap::new(),
            cache: NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).map(|n| Mutex::new(LruCache::new(n))),
            cache_epoch: AtomicU64::new(0),
            remote_timeout: RemoteConfig::default().timeout,
        }
    }

    /// Resize the record cache; 0 disables it
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = NonZeroUsize::new(capacity).map(|n| Mutex::new(LruCache::new(n)));
        self
    }

    /// Timeout for lazily opened shard connections
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local(&self) -> &AnyProvider {
        &self.local
    }

    /// Current routing table, if one was assigned
    pub fn shard_index(&self) -> Option<ShardIndex<ShardDescriptor>> {
        self.index.read().clone()
    }

    /// Base URLs of the open remote connections
    pub fn remotes(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.remotes.iter().map(|e| e.key().clone()).collect();
        urls.sort();
        urls
    }

    /// Get cache statistics
    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.lock().len())
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            cache.clear();
            self.cache_epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Replace the routing tree. Ids keep routing by `id & mask` over the
    /// new table; records are not moved.
    #[instrument(skip(self, tree), fields(node = %self.name))]
    pub fn infrastructure_assign(&self, tree: &Value) -> Result<()> {
        let tree = ShardTree::<ShardDescriptor>::from_json(tree)?;
        let leaves = tree.leaves().len();
        let index = build_index(&tree)?;
        let owned = index.slots_where(|shard| shard.name == self.name).len();
        if owned == 0 {
            warn!("shard tree does not contain this node; creates will be refused");
        }
        info!(leaves, slots = index.len(), owned, bits = index.bits(), "assigned shard tree");
        *self.index.write() = Some(index);
        Ok(())
    }

    /// Open (or reuse) the connection to the node at `options.url`
    #[instrument(skip(self), fields(node = %self.name))]
    pub async fn connect(&self, options: ConnectOptions) -> Result<Arc<RemoteProvider>> {
        let url = options.url.trim_end_matches('/').to_string();
        let remote = match self.remotes.get(&url) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let config = RemoteConfig::with_url(url.clone()).timeout(options.timeout);
                let created = Arc::new(RemoteProvider::connect(config)?);
                Arc::clone(self.remotes.entry(url.clone()).or_insert(created).value())
            }
        };
        remote.open().await?;
        debug!(%url, "remote node ready");
        Ok(remote)
    }

    /// Shard owning `id`, or `None` before any tree is assigned
    pub fn owner_of(&self, id: u64) -> Result<Option<ShardDescriptor>> {
        match self.index.read().as_ref() {
            Some(index) => Ok(Some(index.find_server(id)?.clone())),
            None => Ok(None),
        }
    }

    /// Slots of the assigned table owned by this node
    pub fn own_slots(&self) -> Vec<u64> {
        self.index
            .read()
            .as_ref()
            .map(|index| index.slots_where(|shard| shard.name == self.name))
            .unwrap_or_default()
    }

    /// Cache then local provider, never another shard
    #[instrument(skip(self), fields(node = %self.name))]
    pub async fn get_local(&self, id: u64) -> Result<Record> {
        if let Some(record) = self.cached(id) {
            debug!("cache hit");
            return Ok(record);
        }
        let epoch = self.cache_epoch.load(Ordering::SeqCst);
        let record = self.local.get(id).await?;
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            // a write landed while reading; the record may already be stale
            if self.cache_epoch.load(Ordering::SeqCst) == epoch {
                cache.put(id, record.clone());
            }
        }
        Ok(record)
    }

    fn cached(&self, id: u64) -> Option<Record> {
        self.cache.as_ref()?.lock().get(&id).cloned()
    }

    fn invalidate(&self, id: u64) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            cache.pop(&id);
            self.cache_epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Next counter value composed into an id this node owns and has not
    /// used yet
    async fn generate_owned_id(&self, index: &ShardIndex<ShardDescriptor>) -> Result<u64> {
        let slots = index.slots_where(|shard| shard.name == self.name);
        if slots.is_empty() {
            return Err(ProviderError::BackendUnavailable(format!(
                "node {} owns no slot in the shard tree",
                self.name
            )));
        }
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let sequence = self.local.generate_id().await?;
            let id = index.compose_id(sequence, &slots)?;
            match self.local.get(id).await {
                Err(ProviderError::NotFound(_)) => return Ok(id),
                Ok(_) => debug!(id, attempt, "composed id already in use, drawing another"),
                Err(e) => return Err(e),
            }
        }
        Err(ProviderError::BackendUnavailable(format!(
            "no free id after {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    async fn get_from_owner(&self, id: u64) -> Result<Record> {
        let owner = match self.owner_of(id)? {
            Some(owner) if owner.name != self.name => owner,
            _ => return Err(ProviderError::NotFound(id)),
        };
        let url = owner.url.clone().ok_or_else(|| {
            ProviderError::BackendUnavailable(format!("shard {} has no url", owner.name))
        })?;
        debug!(shard = %owner, "routing lookup to owning shard");

        let options = ConnectOptions::new(url).timeout(self.remote_timeout);
        let result = match self.connect(options).await {
            Ok(remote) => remote.get(id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if !matches!(e, ProviderError::NotFound(_)) {
                warn!(shard = %owner, error = %e, "remote lookup failed");
            }
        }
        result
    }
}

#[async_trait]
impl StorageProvider for GlobalStorage {
    fn kind(&self) -> ProviderKind {
        self.local.kind()
    }

    async fn open(&self) -> Result<()> {
        self.local.open().await
    }

    /// The local counter until a tree is assigned, then ids owned by this node
    async fn generate_id(&self) -> Result<u64> {
        match self.shard_index() {
            Some(index) => self.generate_owned_id(&index).await,
            None => self.local.generate_id().await,
        }
    }

    #[instrument(skip(self, record), fields(node = %self.name))]
    async fn create(&self, mut record: Record) -> Result<u64> {
        let Some(index) = self.shard_index() else {
            return self.local.create(record).await;
        };
        if let Some(id) = record.get(ID_FIELD) {
            return Err(ProviderError::Validation(format!(
                "create assigns ids; record already carries id {}",
                id
            )));
        }
        let id = self.generate_owned_id(&index).await?;
        record.set_id(id);
        self.local.insert(record).await
    }

    async fn insert(&self, record: Record) -> Result<u64> {
        let id = record.require_id("insert")?;
        let result = self.local.insert(record).await;
        self.invalidate(id);
        result
    }

    /// Cache, local provider, then the shard the id routes to
    async fn get(&self, id: u64) -> Result<Record> {
        match self.get_local(id).await {
            Err(ProviderError::NotFound(_)) => self.get_from_owner(id).await,
            other => other,
        }
    }

    async fn update(&self, record: Record) -> Result<()> {
        let id = record.require_id("update")?;
        let result = self.local.update(record).await;
        self.invalidate(id);
        result
    }

    /// The cache is invalidated on both sides of the provider call
    async fn delete(&self, target: DeleteTarget) -> Result<usize> {
        let id = match &target {
            DeleteTarget::Id(id) => Some(*id),
            DeleteTarget::Query(_) => None,
        };
        let forget = || match id {
            Some(id) => self.invalidate(id),
            None => self.clear_cache(),
        };
        forget();
        let result = self.local.delete(target).await;
        forget();
        result
    }

    fn cursor(&self, query: Query) -> Result<Cursor> {
        self.local.cursor(query)
    }

    async fn index(&self, definition: IndexDefinition) -> Result<()> {
        self.local.index(definition).await
    }

    async fn select(&self, query: Query, options: SelectOptions) -> Result<Vec<Record>> {
        self.local.select(query, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardstore_core::CoreError;
    use shardstore_provider::{ErrorBody, ErrorKind, MemoryProvider};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage(name: &str) -> GlobalStorage {
        GlobalStorage::new(name, AnyProvider::from(MemoryProvider::new()))
    }

    async fn mount_node(server: &MockServer, name: &str) {
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok", "name": name, "provider": "memory"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let storage = storage("alpha");
        let id = storage.create(Record::new().with("name", "x")).await.unwrap();
        let record = storage.get(id).await.unwrap();
        assert_eq!(record.get("name"), Some(&json!("x")));
        assert_eq!(storage.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_invalidate_cache() {
        let storage = storage("alpha");
        let id = storage.create(Record::new().with("v", 1)).await.unwrap();
        storage.get(id).await.unwrap();

        let mut record = storage.get(id).await.unwrap();
        record.insert("v", 2);
        storage.update(record).await.unwrap();
        assert_eq!(storage.get(id).await.unwrap().get("v"), Some(&json!(2)));

        assert_eq!(storage.delete(DeleteTarget::Id(id)).await.unwrap(), 1);
        assert_eq!(storage.get(id).await, Err(ProviderError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_query_delete_clears_cache() {
        let storage = storage("alpha");
        for v in 0..3 {
            let id = storage.create(Record::new().with("v", v)).await.unwrap();
            storage.get(id).await.unwrap();
        }
        assert_eq!(storage.cache_len(), 3);

        let deleted = storage
            .delete(DeleteTarget::Query(Query::new().with("v", "<2")))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(storage.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_cache_can_be_disabled() {
        let storage = storage("alpha").with_cache_capacity(0);
        let id = storage.create(Record::new()).await.unwrap();
        storage.get(id).await.unwrap();
        assert_eq!(storage.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_missing_id_owned_here_is_not_found() {
        let storage = storage("alpha");
        assert_eq!(storage.get(5).await, Err(ProviderError::NotFound(5)));

        storage.infrastructure_assign(&json!(["alpha", "beta"])).unwrap();
        // even ids route to alpha
        assert_eq!(storage.get(4).await, Err(ProviderError::NotFound(4)));
        assert!(storage.remotes().is_empty());
    }

    #[tokio::test]
    async fn test_created_ids_route_back_to_their_node() {
        let tree = json!(["alpha", "beta"]);
        let alpha = storage("alpha");
        let beta = storage("beta");
        alpha.infrastructure_assign(&tree).unwrap();
        beta.infrastructure_assign(&tree).unwrap();

        let mut ids = Vec::new();
        for node in [&alpha, &beta] {
            for _ in 0..3 {
                let id = node.create(Record::new().with("by", node.name())).await.unwrap();
                assert_eq!(node.owner_of(id).unwrap().unwrap().name, node.name());
                ids.push(id);
            }
            let reserved = node.generate_id().await.unwrap();
            assert_eq!(node.owner_of(reserved).unwrap().unwrap().name, node.name());
            ids.push(reserved);
        }
        assert_eq!(ids, [2, 4, 6, 8, 3, 5, 7, 9]);
        assert_eq!(alpha.own_slots(), [0]);
        assert_eq!(beta.get_local(3).await.unwrap().get("by"), Some(&json!("beta")));
    }

    #[tokio::test]
    async fn test_create_refused_without_owned_slot() {
        let gamma = storage("gamma");
        gamma.infrastructure_assign(&json!(["alpha", "beta"])).unwrap();
        assert!(gamma.own_slots().is_empty());
        assert!(matches!(
            gamma.create(Record::new()).await,
            Err(ProviderError::BackendUnavailable(_))
        ));
        assert!(matches!(
            gamma.generate_id().await,
            Err(ProviderError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_composed_ids_skip_ids_in_use() {
        let alpha = storage("alpha");
        alpha.infrastructure_assign(&json!([["alpha", "x"], "y"])).unwrap();
        assert_eq!(alpha.create(Record::new()).await.unwrap(), 4);

        // a narrower tree would compose 4 again from the next sequence value
        alpha.infrastructure_assign(&json!(["alpha", "beta"])).unwrap();
        assert_eq!(alpha.create(Record::new()).await.unwrap(), 6);
        assert!(matches!(
            alpha.create(Record::new().with("id", 8)).await,
            Err(ProviderError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_leaves_no_stale_cache_entry() {
        let storage = Arc::new(storage("alpha"));
        for _ in 0..50 {
            let id = storage.create(Record::new().with("v", 1)).await.unwrap();
            let reader = {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let _ = storage.get_local(id).await;
                        tokio::task::yield_now().await;
                    }
                })
            };
            storage.delete(DeleteTarget::Id(id)).await.unwrap();
            reader.await.unwrap();
            assert_eq!(storage.get_local(id).await, Err(ProviderError::NotFound(id)));
        }
    }

    #[test]
    fn test_infrastructure_assign_builds_routing() {
        let storage = storage("a");
        assert_eq!(storage.owner_of(3).unwrap(), None);

        storage.infrastructure_assign(&json!([["a", "b"], "c"])).unwrap();
        let index = storage.shard_index().unwrap();
        assert_eq!(index.mask(), 3);
        assert_eq!(storage.owner_of(1).unwrap(), Some(ShardDescriptor::new("b")));
        assert_eq!(storage.owner_of(7).unwrap(), Some(ShardDescriptor::new("c")));
    }

    #[test]
    fn test_infrastructure_assign_rejects_bad_trees() {
        let storage = storage("a");
        assert_eq!(
            storage.infrastructure_assign(&json!([])),
            Err(ProviderError::Routing(CoreError::EmptyShardTree))
        );
        assert!(matches!(
            storage.infrastructure_assign(&json!(["a", "b", "c"])),
            Err(ProviderError::Validation(_))
        ));
        assert_eq!(storage.shard_index(), None);
    }

    #[tokio::test]
    async fn test_get_routes_to_owning_shard() {
        let server = MockServer::start().await;
        mount_node(&server, "beta").await;
        Mock::given(method("GET"))
            .and(path("/records/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 3, "name": "remote"})))
            .expect(2)
            .mount(&server)
            .await;

        let storage = storage("alpha");
        storage
            .infrastructure_assign(&json!(["alpha", {"name": "beta", "url": server.uri()}]))
            .unwrap();

        let record = storage.get(3).await.unwrap();
        assert_eq!(record.get("name"), Some(&json!("remote")));
        // remote records are not cached
        storage.get(3).await.unwrap();
        assert_eq!(storage.cache_len(), 0);
        assert_eq!(storage.remotes(), vec![server.uri()]);
    }

    #[tokio::test]
    async fn test_remote_not_found_keeps_id() {
        let server = MockServer::start().await;
        mount_node(&server, "beta").await;
        Mock::given(method("GET"))
            .and(path("/records/9"))
            .respond_with(ResponseTemplate::new(404).set_body_json(ErrorBody {
                kind: ErrorKind::NotFound,
                message: "record not found: 9".into(),
                id: Some(9),
                request_id: None,
            }))
            .mount(&server)
            .await;

        let storage = storage("alpha");
        storage
            .infrastructure_assign(&json!(["alpha", {"name": "beta", "url": server.uri()}]))
            .unwrap();
        assert_eq!(storage.get(9).await, Err(ProviderError::NotFound(9)));
    }

    #[test_log::test(tokio::test)]
    async fn test_unreachable_owner_is_unavailable() {
        let storage = storage("alpha").with_remote_timeout(Duration::from_secs(2));
        storage
            .infrastructure_assign(&json!(["alpha", "http://127.0.0.1:1"]))
            .unwrap();
        assert!(matches!(
            storage.get(1).await,
            Err(ProviderError::BackendUnavailable(_))
        ));

        storage.infrastructure_assign(&json!(["alpha", "beta"])).unwrap();
        assert!(matches!(
            storage.get(1).await,
            Err(ProviderError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_stay_local() {
        let server = MockServer::start().await;
        mount_node(&server, "beta").await;

        let storage = storage("alpha");
        storage
            .infrastructure_assign(&json!(["alpha", {"name": "beta", "url": server.uri()}]))
            .unwrap();
        for _ in 0..2 {
            storage.create(Record::new().with("k", "v")).await.unwrap();
        }
        let records = storage
            .select(Query::new().with("k", "v"), SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_reuses_connections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok", "name": "beta", "provider": "memory"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage("alpha");
        let first = storage.connect(ConnectOptions::new(server.uri())).await.unwrap();
        let second = storage
            .connect(ConnectOptions::new(format!("{}/", server.uri())))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
