//! Node errors and their HTTP rendering

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use shardstore_core::CoreError;
use shardstore_provider::{ErrorBody, ErrorKind, ProviderError};
use thiserror::Error;

/// Result type alias using `NodeError`
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors raised while configuring or starting a node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<CoreError> for NodeError {
    fn from(err: CoreError) -> Self {
        Self::Provider(err.into())
    }
}

/// Error returned by HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("malformed request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(err) => err.kind(),
            Self::BadRequest(_) => ErrorKind::Validation,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Provider(ProviderError::Routing(CoreError::RoutingRange { .. })) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Provider(ProviderError::Http(_) | ProviderError::Remote(_)) => {
                StatusCode::BAD_GATEWAY
            }
            _ => match self.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Validation | ErrorKind::Routing => StatusCode::BAD_REQUEST,
                ErrorKind::DuplicateKey => StatusCode::CONFLICT,
                ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
                ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Wire body carrying a fresh request id
    pub fn body(&self) -> ErrorBody {
        let mut body = match self {
            Self::Provider(err) => ErrorBody::from_error(err),
            Self::BadRequest(message) => ErrorBody {
                kind: ErrorKind::Validation,
                message: message.clone(),
                id: None,
                request_id: None,
            },
        };
        body.request_id = Some(uuid::Uuid::new_v4().to_string());
        body
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Provider(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.body();
        if status.is_server_error() {
            tracing::error!(%status, request_id = ?body.request_id, "{}", self);
        } else {
            tracing::debug!(%status, request_id = ?body.request_id, "{}", self);
        }
        (status, Json(body)).into_response()
    }
}
