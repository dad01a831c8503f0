//! Error types for the sorting core.

use thiserror::Error;

/// Core error type.
///
/// Collaborator failures are usually absorbed by the controller (degraded to zero
/// confidence); they surface here so the absorbing site can log what went wrong.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An external service (embedding, segmentation, planner, camera) failed.
    #[error("Collaborator '{service}' unavailable: {reason}")]
    CollaboratorUnavailable {
        /// Which collaborator failed.
        service: &'static str,
        /// Failure description reported by the collaborator.
        reason: String,
    },

    /// A planner-emitted line failed the command grammar.
    #[error("Malformed command '{line}': {reason}")]
    MalformedCommand {
        /// The normalised line.
        line: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Socket connect/send/receive failed or timed out.
    #[error("Connection to {endpoint} failed: {source}")]
    Connection {
        /// Endpoint in `host:port` form.
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The vision robot replied with something other than `DONE`.
    #[error("Unexpected reply from {endpoint}: '{reply}'")]
    UnexpectedReply {
        /// Endpoint in `host:port` form.
        endpoint: String,
        /// Reply as received (trimmed).
        reply: String,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Calibration data is missing or malformed.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Embedded store errors
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
}

impl CoreError {
    pub fn collaborator(service: &'static str, reason: impl ToString) -> Self {
        Self::CollaboratorUnavailable {
            service,
            reason: reason.to_string(),
        }
    }

    pub fn malformed(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedCommand {
            line: line.into(),
            reason: reason.into(),
        }
    }

    pub fn connection(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            source,
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
