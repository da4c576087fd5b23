//! Error types for the push channel

use std::time::Duration;

use thiserror::Error;

/// Result type alias for event stream operations
pub type Result<T> = std::result::Result<T, EventStreamError>;

/// Transport-level failures of the push channel.
///
/// All of them are recoverable: the client reconnects with backoff.
#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("event stream answered HTTP status {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSE frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("no data received for {0:?}")]
    Idle(Duration),

    #[error("event stream closed by server")]
    Closed,

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// A push frame that could not be turned into a [`crate::ServerEvent`].
///
/// Frames in error are dropped; the stream stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unparseable push frame: {0}")]
    Unparseable(#[source] serde_json::Error),

    #[error("push frame has no 'type' tag")]
    MissingTag,

    #[error("malformed {tag} payload: {source}")]
    Malformed {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
