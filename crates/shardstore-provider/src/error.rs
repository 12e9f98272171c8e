//! Error types for the shardstore-provider crate

use serde::{Deserialize, Serialize};
use shardstore_core::CoreError;
use thiserror::Error;

/// Result type alias using `ProviderError`
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur in storage providers and cursors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Capability the provider or cursor source does not offer
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// No record with this id
    #[error("record not found: {0}")]
    NotFound(u64),

    /// Unique key violated
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Malformed record, query or options
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend cannot be reached or refuses writes
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Shard routing failure
    #[error("routing error: {0}")]
    Routing(CoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("io error: {0}")]
    Io(String),

    /// HTTP error other than connectivity
    #[error("http error: {0}")]
    Http(String),

    /// Error reported by a remote node that maps to no other kind
    #[error("remote error: {0}")]
    Remote(String),
}

impl ProviderError {
    /// Wire-level classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::DuplicateKey(_) => ErrorKind::DuplicateKey,
            Self::Validation(_) => ErrorKind::Validation,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Routing(_) => ErrorKind::Routing,
            Self::Serialization(_) | Self::Io(_) | Self::Http(_) | Self::Remote(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented(what.into())
    }

    /// Message without the kind prefix, as carried in an [`ErrorBody`]
    pub fn detail(&self) -> String {
        match self {
            Self::NotImplemented(message)
            | Self::DuplicateKey(message)
            | Self::Validation(message)
            | Self::BackendUnavailable(message)
            | Self::Serialization(message)
            | Self::Io(message)
            | Self::Http(message)
            | Self::Remote(message) => message.clone(),
            Self::NotFound(_) | Self::Routing(_) => self.to_string(),
        }
    }
}

impl From<CoreError> for ProviderError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(message) => Self::Validation(message),
            CoreError::Serialization(message) => Self::Serialization(message),
            routing => Self::Routing(routing),
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::BackendUnavailable(format!("request timed out: {}", err))
        } else if err.is_connect() {
            Self::BackendUnavailable(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

/// Error classification carried over the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotImplemented,
    NotFound,
    DuplicateKey,
    Validation,
    BackendUnavailable,
    Routing,
    Internal,
}

/// JSON error body returned by a node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorBody {
    pub fn from_error(err: &ProviderError) -> Self {
        Self {
            kind: err.kind(),
            message: err.detail(),
            id: match err {
                ProviderError::NotFound(id) => Some(*id),
                _ => None,
            },
            request_id: None,
        }
    }

    /// Rebuild the error a remote node reported
    pub fn into_error(self) -> ProviderError {
        let message = self.message;
        match self.kind {
            ErrorKind::NotImplemented => ProviderError::NotImplemented(message),
            ErrorKind::NotFound => ProviderError::NotFound(self.id.unwrap_or_default()),
            ErrorKind::DuplicateKey => ProviderError::DuplicateKey(message),
            ErrorKind::Validation => ProviderError::Validation(message),
            ErrorKind::BackendUnavailable => ProviderError::BackendUnavailable(message),
            ErrorKind::Routing | ErrorKind::Internal => ProviderError::Remote(message),
        }
    }
}
