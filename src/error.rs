//! Error types shared by every transport.
//!
//! Every caller-visible failure of [`Connection::perform`] is an
//! [`ActionError`]. Each variant maps onto the `{"error": {...}}` envelope the
//! backend itself uses, so model code can treat local and remote failures the
//! same way.
//!
//! [`Connection::perform`]: crate::connection::Connection::perform

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Message carried by locally detected request timeouts.
pub const TIMEOUT_STATUS_TEXT: &str = "Request timed out.";

/// Status reported for failures that never produced a structured body.
pub const TRANSPORT_FAILURE_STATUS: u16 = 500;

/// Normalized description of a transport-level failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportFailure {
    pub name: String,
    pub message: String,
    pub status: u16,
    pub code: i64,
    pub explanation: String,
}

impl TransportFailure {
    /// Builds the `status: 500, code: 0` shape used for unstructured failures.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            status: TRANSPORT_FAILURE_STATUS,
            code: 0,
            explanation: String::new(),
        }
    }
}

/// Failure outcome of a single action.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ActionError {
    /// No reply arrived before the request expired, or the connection was
    /// disposed while the request was in flight.
    #[error("Request timed out.")]
    Timeout,

    /// Application error reported by the backend, passed through verbatim.
    #[error("remote error: {0}")]
    Remote(Value),

    /// Transport failure without a structured body from the backend.
    #[error("{}: {}", .0.name, .0.message)]
    Transport(TransportFailure),

    /// Parameters could not be turned into an action parameter object.
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl ActionError {
    pub(crate) fn transport(name: &str, message: impl Into<String>) -> Self {
        Self::Transport(TransportFailure::new(name, message))
    }

    /// Returns true for locally detected timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Renders the error as the `{"error": {...}}` envelope.
    pub fn to_envelope(&self) -> Value {
        match self {
            Self::Timeout => json!({ "error": { "statusText": TIMEOUT_STATUS_TEXT } }),
            Self::Remote(error) => json!({ "error": error }),
            Self::Transport(failure) => json!({ "error": failure }),
            Self::InvalidParams(message) => json!({
                "error": TransportFailure::new("InvalidParams", message.clone())
            }),
        }
    }

    /// Human readable message, whatever the variant.
    pub fn message(&self) -> String {
        match self {
            Self::Timeout => TIMEOUT_STATUS_TEXT.to_string(),
            Self::Remote(error) => error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            Self::Transport(failure) => failure.message.clone(),
            Self::InvalidParams(message) => message.clone(),
        }
    }
}

/// Errors raised while building a [`Connection`](crate::connection::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// An endpoint in the options is not a valid URL for its transport.
    #[error("invalid {field}: {reason}")]
    InvalidEndpoint { field: &'static str, reason: String },
}
