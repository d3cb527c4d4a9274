//! Server error types and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cairn_cluster::ClusterError;
use cairn_meta::MetaError;
use cairn_metasync::SyncError;
use cairn_rebalance::RebError;
use serde_json::json;
use thiserror::Error;

/// Result type for server handlers.
pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Reb(#[from] RebError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// This verb only exists on the other node role.
    #[error("{0} not supported on this node role")]
    WrongRole(&'static str),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Cluster(err) => match err {
                ClusterError::DuplicateNodeId(_) => StatusCode::CONFLICT,
                ClusterError::NodeNotFound(_) => StatusCode::NOT_FOUND,
                ClusterError::NotPrimary { .. } => StatusCode::MISDIRECTED_REQUEST,
                ClusterError::NonElectable(_) => StatusCode::BAD_REQUEST,
                ClusterError::Meta(MetaError::UuidMismatch { .. }) => StatusCode::CONFLICT,
                ClusterError::PrepareFailed { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Sync(SyncError::Meta(MetaError::UuidMismatch { .. })) => StatusCode::CONFLICT,
            Self::Sync(SyncError::Decode { .. }) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Meta(MetaError::UuidMismatch { .. }) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::WrongRole(_) => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
