use std::time::Duration;

use thiserror::Error;

/// Connect, timeout or I/O failure below the HTTP status level.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: true,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            message: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },
    /// `status` is 0 when the subject was rejected before any request was made.
    #[error("query submission failed ({status}): {message}")]
    QuerySubmission { status: u16, message: String },
    #[error("query {query_id} did not complete within {waited:?}")]
    QueryTimeout { query_id: String, waited: Duration },
    /// The authority itself reported the query as failed.
    #[error("query {query_id} finished with status {status}")]
    QueryFailed { query_id: String, status: String },
    /// A status poll got a non-success reply; the query's own state is unknown.
    #[error("query {query_id} poll rejected ({status}): {body}")]
    PollRejected {
        query_id: String,
        status: u16,
        body: String,
    },
    #[error("artifact fetch failed ({status}): {message}")]
    ArtifactFetch { status: u16, message: String },
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },
    #[error("{operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
}

impl RecordError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Network trouble or an overloaded authority; retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::PollRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("model service request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("model service returned {status}: {body}")]
    Service { status: u16, body: String },
    #[error("model service returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("artifact content type '{content_type}' is not an image")]
    UnsupportedArtifact { content_type: String },
    #[error("failed to encode request: {0}")]
    Encoding(String),
}
