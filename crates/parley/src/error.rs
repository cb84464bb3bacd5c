//! Client error types.

use reqwest::{Method, StatusCode};
use thiserror::Error;

use crate::models::HydrateError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while talking to the chat service.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
        body: String,
    },

    /// A success response whose body is not the expected JSON document.
    #[error("Failed to parse response from {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A wire record could not be turned into an entity.
    #[error(transparent)]
    Decode(#[from] HydrateError),

    /// Login failed; local credential state has been cleared.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// WebSocket handshake or stream failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A configured URL could not be used.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The background feed task panicked or was aborted.
    #[error("Feed task failed: {0}")]
    FeedTask(#[from] tokio::task::JoinError),
}

impl ClientError {
    /// HTTP status carried by the error, if the service produced one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(e) => e.status(),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}
