//! Error types shared by every client operation.

use thiserror::Error;

use crate::session::SessionState;

/// Errors surfaced by the client.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller arguments did not match the operation's declared shape
    #[error("invalid argument `{field}` for {operation}: {reason}")]
    Validation {
        operation: &'static str,
        field: String,
        reason: String,
    },

    /// Operation invoked out of sequence
    #[error("{operation} requires a {required} session, but the session is {actual}")]
    State {
        operation: &'static str,
        required: SessionState,
        actual: SessionState,
    },

    /// The token endpoint granted a different scope set than was requested
    #[error("granted scopes `{granted}` do not match requested scopes `{requested}`")]
    ScopeMismatch { requested: String, granted: String },

    /// The service answered with an `{error, error_description}` body
    #[error("remote error: {}", remote_message(.error, .description))]
    Remote {
        error: String,
        description: Option<String>,
    },

    /// Non-success status without an error body
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),

    /// An entity outlived the client it came from
    #[error("the client that produced this entity has been dropped")]
    ClientGone,

    #[error("stream error: {0}")]
    Stream(String),
}

impl Error {
    /// Fatal errors mean the current flow must not continue; retrying the
    /// same call will fail the same way.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::State { .. } | Self::ScopeMismatch { .. })
    }

    pub(crate) fn validation(
        operation: &'static str,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            operation,
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub(crate) fn remote_message(error: &str, description: &Option<String>) -> String {
    match description {
        Some(description) => format!("{error} ({description})"),
        None => error.to_string(),
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
