//! Error types for the inference client

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to callers of the client
#[derive(Debug, Error)]
pub enum ClientError {
    /// Endpoint string could not be parsed; raised before any network I/O
    #[error("Invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Readiness polling or an inference call ran out of time
    #[error("Timeout while {operation} after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Model is absent from the repository or reports a terminal state
    #[error("Model {model} is unavailable. {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("Model {model} doesn't support batching - use infer_sample method instead")]
    ModelDoesntSupportBatching { model: String },

    /// Caller contract violation detected before contacting the server
    #[error("{0}")]
    Value(String),

    /// Connection or client was closed before the operation completed
    #[error("Connection to {0} is closed")]
    Closed(String),

    /// Pending request was cancelled by its owner
    #[error("Request cancelled")]
    Cancelled,

    #[error("Failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("{operation} failed for model {model}: {source}")]
    Transport {
        operation: &'static str,
        model: String,
        #[source]
        source: TransportError,
    },
}

impl ClientError {
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    pub fn unavailable(model: impl ToString, reason: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            model: model.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach operation and model context to a transport failure.
    ///
    /// Transport level timeouts are reported as [`ClientError::Timeout`] so
    /// callers see one timeout kind regardless of where it fired.
    pub fn transport(operation: &'static str, model: impl ToString, source: TransportError) -> Self {
        match source {
            TransportError::Timeout(elapsed) => Self::Timeout {
                operation: format!("{} for model {}", operation, model.to_string()),
                elapsed,
            },
            source => Self::Transport {
                operation,
                model: model.to_string(),
                source,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_model_unavailable(&self) -> bool {
        matches!(self, Self::ModelUnavailable { .. })
    }
}

/// Failures raised by a concrete transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gRPC call failed: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("gRPC channel error: {0}")]
    Channel(#[from] tonic::transport::Error),

    /// Server answered with a non-success status
    #[error("Server returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Response could not be decoded into the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport timeout after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
