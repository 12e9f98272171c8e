//! Application state

use crate::config::NodeConfig;
use crate::error::Result;
use crate::storage::{ConnectOptions, GlobalStorage};
use shardstore_provider::{AnyProvider, Backends, StorageProvider};
use tracing::{info, warn};

/// Application state shared across handlers
pub struct AppState {
    /// Node configuration
    pub config: NodeConfig,
    /// Local provider behind the routing facade
    pub storage: GlobalStorage,
}

impl AppState {
    /// Open the configured provider against the process-wide backends
    pub async fn new(config: NodeConfig) -> Result<Self> {
        Self::with_backends(config, Backends::global()).await
    }

    pub async fn with_backends(config: NodeConfig, backends: &Backends) -> Result<Self> {
        let local = AnyProvider::from_options(&config.storage, backends)?;
        if local.is_persistent() {
            info!(provider = %local.kind(), "storage mode: persistent");
        } else {
            warn!(provider = %local.kind(), "storage mode: in-process (NOT persistent)");
        }

        let storage = GlobalStorage::new(config.name.clone(), local)
            .with_cache_capacity(config.cache_capacity)
            .with_remote_timeout(config.remote_timeout());
        storage.open().await?;

        if let Some(tree) = &config.shards {
            storage.infrastructure_assign(tree)?;
        }

        for peer in &config.peers {
            let Some(url) = &peer.url else {
                warn!(peer = %peer, "peer has no url, skipping");
                continue;
            };
            let options = ConnectOptions::new(url.clone()).timeout(config.remote_timeout());
            match storage.connect(options).await {
                Ok(_) => info!(peer = %peer, "connected to peer"),
                // owning shards are reconnected lazily on lookup
                Err(e) => warn!(peer = %peer, error = %e, "failed to connect to peer"),
            }
        }

        Ok(Self { config, storage })
    }
}
