//! Dispatch error types and error categorization
//!
//! Errors are categorized to determine recovery behavior:
//! - **Transient**: Temporary failure, retry with exponential backoff
//! - **Permanent**: Unrecoverable, dead-letter immediately

use crate::broker::BrokerError;
use core_config::ConfigError;
use std::fmt;
use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (timeouts, 5xx, throttling, lost connection)
    Transient,
    /// Unrecoverable failure (invalid recipient, malformed payload, 4xx)
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors surfaced by the dispatch engine.
///
/// Delivery failures never appear here: they are folded into
/// [`DeliveryOutcome`](crate::message::DeliveryOutcome) inside the worker pool.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Invalid or incomplete configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broker unreachable after exhausting the reconnect budget
    #[error("Broker unreachable after {attempts} connection attempts: {source}")]
    BrokerConnectivity {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// Broker command failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Dead-letter publication failed after all retries
    #[error("Dead-letter publish failed for message {message_id} after {attempts} attempts: {reason}")]
    DeadLetterPublish {
        message_id: String,
        attempts: u32,
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl DispatchError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::Config(_) => ErrorCategory::Permanent,
            DispatchError::BrokerConnectivity { .. } => ErrorCategory::Permanent,
            DispatchError::Broker(e) => e.category(),
            DispatchError::DeadLetterPublish { .. } => ErrorCategory::Permanent,
            DispatchError::Serialization(_) => ErrorCategory::Permanent,
            DispatchError::Shutdown => ErrorCategory::Permanent,
        }
    }

    /// Whether the process should stop because of this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::Config(_) | DispatchError::BrokerConnectivity { .. }
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}
