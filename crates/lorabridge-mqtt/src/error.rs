//! Error types for bridge operations
//!
//! Setup-time failures (connect, initial subscribe) propagate to the caller.
//! Per-message failures (decode, adjust, publish) are logged by the
//! forwarding loops and never unwind them.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Connection Errors =====
    /// Broker unreachable or refused after all retries
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection attempt outlived its timeout and then failed
    #[error("Connection failed after exceeding {duration_ms}ms: {reason}")]
    ConnectionTimeout {
        /// Attempt timeout in milliseconds
        duration_ms: u64,
        /// Failure reported once the attempt completed
        reason: String,
    },

    /// Operation requires a live connection
    #[error("Not connected to broker")]
    NotConnected,

    /// Broker address could not be understood
    #[error("Invalid broker address {address}: {reason}")]
    InvalidAddress {
        /// Address as configured
        address: String,
        /// Why it was rejected
        reason: String,
    },

    // ===== Per-message Errors =====
    /// Malformed inbound envelope or payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Payload post-processing failed
    #[error("Payload adjustment failed: {0}")]
    Adjustment(String),

    /// Publish to the broker or the internal bus failed
    #[error("Publish to {topic} failed: {reason}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Failure reason
        reason: String,
    },

    // ===== Setup Errors =====
    /// Subscription could not be established
    #[error("Subscription to {topic} failed: {reason}")]
    Subscription {
        /// Topic filter
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ===== General Errors =====
    /// JSON error wrapper
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_)
                | BridgeError::ConnectionTimeout { .. }
                | BridgeError::NotConnected
        )
    }

    /// Check if this error only concerns a single message
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            BridgeError::Decode(_) | BridgeError::Adjustment(_) | BridgeError::Publish { .. }
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::Connection(_) => "CONNECTION",
            BridgeError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            BridgeError::NotConnected => "NOT_CONNECTED",
            BridgeError::InvalidAddress { .. } => "INVALID_ADDRESS",
            BridgeError::Decode(_) => "DECODE",
            BridgeError::Adjustment(_) => "ADJUSTMENT",
            BridgeError::Publish { .. } => "PUBLISH",
            BridgeError::Subscription { .. } => "SUBSCRIPTION",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::MissingConfig(_) => "MISSING_CONFIG",
            BridgeError::Json(_) => "JSON",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }

    pub(crate) fn publish(topic: impl Into<String>, reason: impl ToString) -> Self {
        BridgeError::Publish {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn subscription(topic: impl Into<String>, reason: impl ToString) -> Self {
        BridgeError::Subscription {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<base64::DecodeError> for BridgeError {
    fn from(err: base64::DecodeError) -> Self {
        BridgeError::Decode(err.to_string())
    }
}

impl From<lorabridge_core::CoreError> for BridgeError {
    fn from(err: lorabridge_core::CoreError) -> Self {
        match err {
            lorabridge_core::CoreError::Json(e) => BridgeError::Json(e),
            other => BridgeError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::Connection(err.to_string())
    }
}
