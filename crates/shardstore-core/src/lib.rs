//! # Shardstore Core
//!
//! Backend-independent building blocks of the shardstore document engine.
//!
//! This crate provides:
//! - **Records**: JSON documents carrying an `id` and a `category`
//! - **Queries**: flat `field -> condition` maps such as `{"born": "<1500"}`
//! - **Operations**: the pure JSQL operators folded by a cursor
//! - **Transactions**: copy-on-write overlays over records and sequences
//! - **Shard routing**: a flat id -> shard table built from a binary tree
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        GlobalStorage (shardstore-node)  │
//! ├─────────────────────────────────────────┤
//! │   Cursor + StorageProvider (provider)   │
//! ├──────────────┬──────────────┬───────────┤
//! │  Operations  │ Transaction  │ ShardIndex│
//! ├──────────────┴──────────────┴───────────┤
//! │            Record / Query               │
//! └─────────────────────────────────────────┘
//! ```

pub mod error;
pub mod ops;
pub mod query;
pub mod record;
pub mod shard;
pub mod transaction;

pub use error::{CoreError, Result};
pub use ops::Aggregate;
pub use query::{Condition, Operator, Predicate, Query};
pub use record::{Record, CATEGORY_FIELD, ID_FIELD};
pub use shard::{build_index, ShardDescriptor, ShardIndex, ShardTree, MAX_SHARD_DEPTH};
pub use transaction::{Shared, Transaction, TxTarget};
