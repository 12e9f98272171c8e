//! Remote provider: another node reached over a [`Transport`]

use crate::cursor::{Cursor, Source};
use crate::wire::{self, DeletedResponse, IdResponse, SelectRequest, SelectResponse};
use crate::{
    DeleteTarget, ErrorBody, IndexDefinition, ProviderError, ProviderKind, Result,
    SelectOptions, StorageProvider,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shardstore_core::{Query, Record};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

/// Configuration for a remote node connection
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Base URL of the node (e.g., "http://10.0.0.2:7070")
    pub url: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7070".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RemoteConfig {
    /// Create with a custom node URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One provider call in transport-neutral form
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Health,
    GenerateId,
    Create(Record),
    Get(u64),
    Update(u64, Record),
    Delete(u64),
    DeleteQuery(Query),
    Select(SelectRequest),
    Index(IndexDefinition),
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Self::Health | Self::Get(_) => Method::GET,
            Self::Update(..) => Method::PUT,
            Self::Delete(_) => Method::DELETE,
            Self::GenerateId
            | Self::Create(_)
            | Self::DeleteQuery(_)
            | Self::Select(_)
            | Self::Index(_) => Method::POST,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::Health => wire::HEALTH_PATH.to_string(),
            Self::GenerateId => wire::IDS_PATH.to_string(),
            Self::Create(_) => wire::RECORDS_PATH.to_string(),
            Self::Get(id) | Self::Update(id, _) | Self::Delete(id) => wire::record_path(*id),
            Self::DeleteQuery(_) => wire::DELETE_QUERY_PATH.to_string(),
            Self::Select(_) => wire::SELECT_PATH.to_string(),
            Self::Index(_) => wire::INDEXES_PATH.to_string(),
        }
    }

    pub fn body(&self) -> Result<Option<Value>> {
        let body = match self {
            Self::Health | Self::GenerateId | Self::Get(_) | Self::Delete(_) => return Ok(None),
            Self::Create(record) | Self::Update(_, record) => serde_json::to_value(record)?,
            Self::DeleteQuery(query) => serde_json::to_value(query)?,
            Self::Select(request) => serde_json::to_value(request)?,
            Self::Index(definition) => serde_json::to_value(definition)?,
        };
        Ok(Some(body))
    }
}

/// Carries [`Request`]s to a node and returns its JSON reply
#[async_trait]
pub trait Transport: Send + Sync {
    /// Where requests go, for logs and errors
    fn endpoint(&self) -> &str;

    async fn call(&self, request: Request) -> Result<Value>;
}

/// JSON over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    config: RemoteConfig,
}

impl HttpTransport {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::BackendUnavailable(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.config.url
    }

    #[instrument(skip(self, request), fields(url = %self.config.url, method = %request.method(), path = %request.path()))]
    async fn call(&self, request: Request) -> Result<Value> {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), request.path());
        let mut builder = self.client.request(request.method(), &url);
        if let Some(body) = request.body()? {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        debug!(%status, "remote call failed");
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(body.into_error()),
            Err(_) if status == StatusCode::SERVICE_UNAVAILABLE => {
                Err(ProviderError::BackendUnavailable(format!("{}: {}", url, text)))
            }
            Err(_) => Err(ProviderError::Http(format!("{} returned {}: {}", url, status, text))),
        }
    }
}

/// Deferred select against a remote node
#[derive(Clone)]
pub struct RemoteScan {
    transport: Arc<dyn Transport>,
    query: Query,
}

impl RemoteScan {
    pub(crate) async fn load(&self) -> Result<Vec<Record>> {
        let request = Request::Select(SelectRequest {
            query: self.query.clone(),
            options: SelectOptions::default(),
        });
        let response: SelectResponse = decode(self.transport.call(request).await?)?;
        Ok(response.records)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Provider forwarding every call to another node
pub struct RemoteProvider {
    transport: Arc<dyn Transport>,
    opened: OnceCell<()>,
}

impl RemoteProvider {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            opened: OnceCell::new(),
        }
    }

    /// HTTP connection to the node at `config.url`
    pub fn connect(config: RemoteConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new(config)?)))
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        decode(self.transport.call(request).await?)
    }
}

#[async_trait]
impl StorageProvider for RemoteProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    /// Health-check the node once
    async fn open(&self) -> Result<()> {
        self.opened
            .get_or_try_init(|| async {
                let health: wire::HealthResponse =
                    self.call(Request::Health).await.map_err(|e| match e {
                        ProviderError::BackendUnavailable(_) => e,
                        other => ProviderError::BackendUnavailable(format!(
                            "{} failed its health check: {}",
                            self.endpoint(),
                            other
                        )),
                    })?;
                info!(endpoint = %self.endpoint(), node = %health.name, provider = %health.provider, "connected to remote node");
                Ok::<(), ProviderError>(())
            })
            .await
            .map(|_| ())
    }

    async fn generate_id(&self) -> Result<u64> {
        let response: IdResponse = self.call(Request::GenerateId).await?;
        Ok(response.id)
    }

    async fn create(&self, record: Record) -> Result<u64> {
        let response: IdResponse = self.call(Request::Create(record)).await?;
        Ok(response.id)
    }

    /// Nodes assign ids themselves
    async fn insert(&self, _record: Record) -> Result<u64> {
        Err(ProviderError::not_implemented("insert with a caller-chosen id on a remote node"))
    }

    async fn get(&self, id: u64) -> Result<Record> {
        match self.call(Request::Get(id)).await {
            // a node predating id-carrying error bodies reports id 0
            Err(ProviderError::NotFound(_)) => Err(ProviderError::NotFound(id)),
            other => other,
        }
    }

    async fn update(&self, record: Record) -> Result<()> {
        let id = record.require_id("update")?;
        let _: Value = self.call(Request::Update(id, record)).await?;
        Ok(())
    }

    async fn delete(&self, target: DeleteTarget) -> Result<usize> {
        let request = match target {
            DeleteTarget::Id(id) => Request::Delete(id),
            DeleteTarget::Query(query) => Request::DeleteQuery(query),
        };
        let response: DeletedResponse = self.call(request).await?;
        Ok(response.deleted)
    }

    fn cursor(&self, query: Query) -> Result<Cursor> {
        let scan = RemoteScan {
            transport: Arc::clone(&self.transport),
            query: query.clone(),
        };
        Ok(Cursor::filtered(Source::Remote(scan), query))
    }

    async fn index(&self, definition: IndexDefinition) -> Result<()> {
        let _: Value = self.call(Request::Index(definition)).await?;
        Ok(())
    }

    /// Options run on the remote node, not locally
    async fn select(&self, query: Query, options: SelectOptions) -> Result<Vec<Record>> {
        let response: SelectResponse = self
            .call(Request::Select(SelectRequest { query, options }))
            .await?;
        Ok(response.records)
    }
}
