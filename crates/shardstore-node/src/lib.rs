//! # Shardstore Node
//!
//! A storage node of a sharded shardstore infrastructure.
//!
//! This crate provides:
//! - **GlobalStorage**: the facade routing reads to the shard owning an id
//! - **HTTP server**: the provider contract served for remote providers
//! - **Configuration**: defaults, config file, environment and CLI flags
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Other nodes (RemoteProvider)               │
//! └─────────────────────────┬───────────────────────────┘
//!                           │ JSON over HTTP
//! ┌─────────────────────────▼───────────────────────────┐
//! │                 shardstore-node                     │
//! ├─────────────────────────────────────────────────────┤
//! │        Router │ TraceLayer │ Request handlers       │
//! ├─────────────────────────────────────────────────────┤
//! │  GlobalStorage: LRU cache │ ShardIndex │ remotes    │
//! ├─────────────────────────────────────────────────────┤
//! │              shardstore-provider                    │
//! │    (memory, fs, key-value, document, remote)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;
pub mod storage;

pub use config::NodeConfig;
pub use error::{ApiError, NodeError, Result};
pub use server::{run_server, run_server_with_shutdown, serve};
pub use state::AppState;
pub use storage::{ConnectOptions, GlobalStorage};
