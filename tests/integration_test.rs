//! Multi-node routing and persistence

use serde_json::json;
use shardstore_core::{Query, Record};
use shardstore_node::{serve, AppState, ConnectOptions, NodeConfig};
use shardstore_provider::{
    Backends, DeleteTarget, OpenOptions, ProviderError, ProviderKind, SelectOptions,
    StorageProvider,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Node {
    url: String,
    state: Arc<AppState>,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Node {
    async fn start(config: NodeConfig) -> Node {
        let state = Arc::new(AppState::with_backends(config, &Backends::default()).await.unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::clone(&state), async {
            rx.await.ok();
        }));
        Node {
            url,
            state,
            shutdown: Some(tx),
            server,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        self.server.await.unwrap().unwrap();
    }
}

fn named(name: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn test_lookup_routes_to_owning_node() {
    let beta = Node::start(NodeConfig {
        shards: Some(json!(["alpha", "beta"])),
        ..named("beta")
    })
    .await;
    let alpha = Node::start(NodeConfig {
        shards: Some(json!(["alpha", {"name": "beta", "url": beta.url}])),
        ..named("alpha")
    })
    .await;

    // beta owns odd ids; its first record is sequence 1 in slot 1
    let id = beta
        .state
        .storage
        .create(Record::new().with("owner", "beta"))
        .await
        .unwrap();
    assert_eq!(id, 3);

    let record = alpha.state.storage.get(id).await.unwrap();
    assert_eq!(record.get("owner"), Some(&json!("beta")));
    assert_eq!(alpha.state.storage.remotes(), vec![beta.url.clone()]);

    // alpha's local data is untouched
    let local = alpha
        .state
        .storage
        .select(Query::new(), SelectOptions::default())
        .await
        .unwrap();
    assert!(local.is_empty());

    // id 5 routes to beta too but does not exist there
    assert_eq!(alpha.state.storage.get(5).await, Err(ProviderError::NotFound(5)));

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_shards_hand_out_disjoint_ids() {
    let alpha = Node::start(named("alpha")).await;
    let beta = Node::start(named("beta")).await;
    let gamma = Node::start(named("gamma")).await;
    let tree = json!([
        {"name": "alpha", "url": alpha.url},
        {"name": "beta", "url": beta.url}
    ]);
    for node in [&alpha, &beta, &gamma] {
        node.state.storage.infrastructure_assign(&tree).unwrap();
    }

    let mut created = Vec::new();
    for node in [&alpha, &beta] {
        let storage = &node.state.storage;
        for _ in 0..3 {
            let id = storage.create(Record::new().with("owner", storage.name())).await.unwrap();
            assert_eq!(storage.owner_of(id).unwrap().unwrap().name, storage.name());
            created.push((id, storage.name().to_string()));
        }
    }
    let mut ids: Vec<u64> = created.iter().map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 6);

    // any node, owner or not, resolves every id to the record its owner wrote
    for (id, owner) in &created {
        for node in [&alpha, &beta, &gamma] {
            let record = node.state.storage.get(*id).await.unwrap();
            assert_eq!(record.get("owner"), Some(&json!(owner)));
        }
    }

    // gamma holds no slot, so it cannot mint ids
    assert!(matches!(
        gamma.state.storage.create(Record::new()).await,
        Err(ProviderError::BackendUnavailable(_))
    ));

    alpha.stop().await;
    beta.stop().await;
    gamma.stop().await;
}

#[tokio::test]
async fn test_stopped_owner_is_unavailable() {
    let beta = Node::start(named("beta")).await;
    let beta_url = beta.url.clone();
    beta.stop().await;

    let alpha = Node::start(NodeConfig {
        shards: Some(json!(["alpha", {"name": "beta", "url": beta_url}])),
        remote_timeout_secs: 2,
        ..named("alpha")
    })
    .await;
    assert!(matches!(
        alpha.state.storage.get(1).await,
        Err(ProviderError::BackendUnavailable(_))
    ));
    alpha.stop().await;
}

#[tokio::test]
async fn test_connect_reaches_peer_over_http() {
    let beta = Node::start(named("beta")).await;
    let alpha = Node::start(named("alpha")).await;

    let remote = alpha
        .state
        .storage
        .connect(ConnectOptions::new(beta.url.clone()))
        .await
        .unwrap();
    let id = remote.create(Record::new().with("via", "alpha")).await.unwrap();
    let record = beta.state.storage.get(id).await.unwrap();
    assert_eq!(record.get("via"), Some(&json!("alpha")));

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test]
async fn test_filesystem_node_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = NodeConfig {
        storage: OpenOptions::fs(dir.path().join("alpha")),
        ..named("alpha")
    };

    let node = Node::start(config.clone()).await;
    assert_eq!(node.state.storage.kind(), ProviderKind::FileSystem);
    let storage = &node.state.storage;
    let first = storage.create(Record::new().with("n", 1)).await.unwrap();
    let second = storage.create(Record::new().with("n", 2)).await.unwrap();
    storage.delete(DeleteTarget::Id(first)).await.unwrap();
    node.stop().await;

    assert!(dir.path().join("alpha").join("2.json").is_file());
    assert!(dir.path().join("alpha").join("counter").is_file());

    let node = Node::start(config).await;
    let storage = &node.state.storage;
    assert_eq!(storage.get(second).await.unwrap().get("n"), Some(&json!(2)));
    assert_eq!(storage.get(first).await, Err(ProviderError::NotFound(first)));
    // ids are never reused
    assert_eq!(storage.create(Record::new()).await.unwrap(), 3);
    node.stop().await;
}

#[tokio::test]
async fn test_health_over_plain_http() {
    let node = Node::start(named("alpha")).await;
    let health: serde_json::Value = reqwest::get(format!("{}/health", node.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({"status": "ok", "name": "alpha", "provider": "memory"}));
    node.stop().await;
}
