//! Error types for commands and the player seam

use thiserror::Error;

/// Result type alias for command operations
pub type Result<T> = std::result::Result<T, CommandError>;

/// Failure of a request sent to the queue server.
///
/// A failed command never touches the state cache.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server answered unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("cannot decode server answer: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failure reported by a media engine or while locating a manifest.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlayerError {
    #[error("media engine error: {0}")]
    Engine(String),

    #[error("cannot build manifest URL: {0}")]
    Manifest(String),
}

impl PlayerError {
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }
}

impl From<url::ParseError> for PlayerError {
    fn from(err: url::ParseError) -> Self {
        Self::Manifest(err.to_string())
    }
}
