//! Error types for messaging operations

use crate::error::AppError;

/// Result type for messaging operations
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur while talking to the broker or handling a delivery
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    /// Transport unreachable or dropped
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Broker rejected a publish (negative confirm, queue mismatch)
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Payload is not a valid envelope
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Processing hook failed on a structurally valid envelope
    #[error("Processing failed: {0}")]
    Processing(String),

    /// Broker refused a channel-level operation (declare, qos, ack)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Invalid broker configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MessagingError {
    /// Stable label used in log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            MessagingError::Connection(_) => "connection",
            MessagingError::Publish(_) => "publish",
            MessagingError::Decode(_) => "decode",
            MessagingError::Processing(_) => "processing",
            MessagingError::Channel(_) => "channel",
            MessagingError::Configuration(_) => "configuration",
        }
    }

    /// Re-label a channel refusal seen on the publish path as a publish failure
    pub(crate) fn into_publish_failure(self) -> Self {
        match self {
            MessagingError::Channel(msg) => MessagingError::Publish(msg),
            other => other,
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Decode(err.to_string())
    }
}

impl From<MessagingError> for AppError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::Configuration(msg) => AppError::Configuration(msg),
            other => AppError::Messaging {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}
