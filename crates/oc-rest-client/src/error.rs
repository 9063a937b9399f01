//! Error types for the REST API client

use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur when using the REST API client or the event stream
#[derive(Debug, Error)]
pub enum RestClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Server returned error status {status}: {body}")]
    ServerError { status: StatusCode, body: String },

    #[error("SSE endpoint returned status {}", .status.as_u16())]
    Status { status: StatusCode },

    #[error("already connected")]
    AlreadyConnected,

    #[error("event stream client has been disconnected")]
    Closed,

    #[error("SSE stream error: {0}")]
    Sse(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to reconnect after {attempts} attempts: {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: Box<RestClientError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RestClientError {
    /// Create a stream decode error from anything displayable.
    pub fn sse(message: impl std::fmt::Display) -> Self {
        Self::Sse(message.to_string())
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ServerError { status, .. } | Self::Status { status } => Some(*status),
            Self::Http(e) => e.status(),
            Self::ReconnectExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// Result type alias for REST client operations
pub type RestClientResult<T> = Result<T, RestClientError>;
