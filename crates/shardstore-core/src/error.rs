//! Error types for the shardstore-core crate

use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the backend-independent core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Malformed query, condition string or record
    #[error("validation error: {0}")]
    Validation(String),

    /// Routing tree without any leaf
    #[error("shard tree is empty")]
    EmptyShardTree,

    /// Routing tree deeper than a 31-bit index allows
    #[error("shard tree depth {depth} exceeds maximum {max}")]
    ShardTreeTooDeep { depth: usize, max: usize },

    /// Id whose slot cannot be addressed by the shard table
    #[error("id {id} is outside the routing range of a {bits}-bit shard index")]
    RoutingRange { id: u64, bits: u32 },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
