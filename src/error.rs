//! Error types for the appshell library.

use thiserror::Error;

/// Errors that can occur in the cache, update and timer services.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during storage or config operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A URL could not be parsed or resolved against the scope.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration file could not be parsed or is inconsistent.
    #[error("config error: {0}")]
    Config(String),

    /// A request could not be turned into a network call.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A response arrived with a status that is not acceptable here.
    #[error("unexpected status {status} for {url}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code received.
        status: u16,
    },

    /// A required precache asset could not be stored.
    #[error("required asset {url} failed: {source}")]
    RequiredAsset {
        /// Asset URL.
        url: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A lifecycle transition was requested from the wrong state.
    #[error("cannot move from {from} to {to}")]
    InvalidState {
        /// Current lifecycle state.
        from: &'static str,
        /// Requested lifecycle state.
        to: &'static str,
    },

    /// The client connection has been closed.
    #[error("client {0} is gone")]
    ClientGone(String),

    /// The host refused to promote the waiting version.
    #[error("promotion failed: {0}")]
    Promotion(String),

    /// Cache storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The timer task is no longer running.
    #[error("timer task has stopped")]
    TimerStopped,
}

/// A specialized `Result` type for appshell operations.
pub type Result<T> = std::result::Result<T, Error>;
