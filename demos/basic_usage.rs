//! Basic usage example for shardstore
//!
//! This example demonstrates:
//! - Lazy cursor queries over an in-memory provider
//! - A copy-on-write transaction over a shared record
//! - Two nodes routing lookups through a shard tree
//!
//! Run with: cargo run --example basic_usage

use parking_lot::RwLock;
use serde_json::json;
use shardstore_core::{Query, Record, Transaction};
use shardstore_node::{serve, AppState, NodeConfig};
use shardstore_provider::{
    Backends, MemoryProvider, RemoteConfig, RemoteProvider, SelectOptions, StorageProvider,
};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("shardstore - basic usage\n");

    // ==================== Cursor ====================

    let provider = MemoryProvider::new();
    for (name, born) in [
        ("Gutenberg", 1398),
        ("Dürer", 1471),
        ("Leonardo", 1452),
        ("Turing", 1912),
        ("Charlemagne", 748),
    ] {
        provider
            .create(Record::new().with("name", name).with("born", born))
            .await?;
    }

    let mut cursor = provider
        .cursor(Query::new().with("born", "<1500"))?
        .order(["born"])
        .col("name");
    println!("born before 1500: {:?}", cursor.fetch().await?);

    let mut cursor = provider.cursor(Query::new())?;
    println!("median birth year: {}", cursor.median("born").await?);

    // ==================== Transaction ====================

    let account = Arc::new(RwLock::new(Record::new().with("balance", 100)));
    let mut tx = Transaction::start(Arc::clone(&account));
    tx.set("balance".to_string(), json!(40));
    tx.set("pending".to_string(), json!(true));
    println!("\nbefore commit: {:?}", account.read().get("balance"));
    tx.commit();
    println!("after commit:  {:?}", account.read().get("balance"));

    // ==================== Two nodes ====================

    let beta_listener = TcpListener::bind("127.0.0.1:0").await?;
    let beta_url = format!("http://{}", beta_listener.local_addr()?);
    let beta = Arc::new(
        AppState::with_backends(
            NodeConfig {
                name: "beta".to_string(),
                shards: Some(json!(["alpha", "beta"])),
                ..Default::default()
            },
            &Backends::default(),
        )
        .await?,
    );
    tokio::spawn(serve(beta_listener, beta, std::future::pending()));

    let alpha = AppState::with_backends(
        NodeConfig {
            name: "alpha".to_string(),
            shards: Some(json!(["alpha", {"name": "beta", "url": beta_url}])),
            ..Default::default()
        },
        &Backends::default(),
    )
    .await?;

    // beta only hands out ids it owns (odd ids)
    let remote = RemoteProvider::connect(RemoteConfig::with_url(beta_url.clone()))?;
    let id = remote.create(Record::new().with("owner", "beta")).await?;
    let record = alpha.storage.get(id).await?;
    println!("\nalpha resolved id {} from beta: {:?}", id, record.get("owner"));

    let local = alpha
        .storage
        .select(Query::new(), SelectOptions::default())
        .await?;
    println!("alpha's own records: {}", local.len());

    Ok(())
}
