//! Error types for the caller side.

use thiserror::Error;

use crate::error::{DecodeError, RunError};

/// Caller-side error type.
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error code from the body, when present.
        code: Option<String>,
        /// Error message from the API.
        message: String,
    },

    /// The event stream was malformed or truncated.
    #[error("Stream error: {0}")]
    Decode(#[from] DecodeError),

    /// In-process transport rejected the call.
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// The human input source failed or closed.
    #[error("Input error: {0}")]
    Input(String),

    /// Every answer to the same question was rejected.
    #[error("run `{run_id}`: answer rejected {attempts} times")]
    TooManyRejections { run_id: String, attempts: usize },

    /// Stream ended unexpectedly.
    #[error("Stream ended unexpectedly")]
    StreamEnded,
}

/// Result type alias for caller-side operations.
pub type Result<T> = std::result::Result<T, ClientError>;
