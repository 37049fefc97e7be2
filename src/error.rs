//! Error types for the seeker bot

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, SeekerError>;

/// Main error type for the seeker bot.
///
/// The leaf adapters raise these; only the orchestrator and the transfer
/// coordinator decide whether a failure is retried, escalated, or reported.
#[derive(Debug, Error)]
pub enum SeekerError {
    /// The remote page no longer matches the expected structure.
    /// Retrying does not help; surfaced immediately.
    #[error("failed to parse booking page: {reason}")]
    Parse { reason: String },

    /// Someone else claimed the slot first. Expected, not anomalous.
    #[error("slot already taken by another participant")]
    Conflict,

    /// Network failure or server-side error. Transient, retried.
    #[error("remote error: {message}")]
    Remote { message: String },

    /// The remote system refused a release because its deadline passed.
    #[error("release deadline has passed")]
    DeadlinePassed,

    /// The operator did not reply within the configured bound.
    #[error("no reply received within {waited_secs}s")]
    ReplyTimeout { waited_secs: u64 },

    /// A transfer stopped in an ambiguous dual-hold state. Always escalated.
    #[error("transfer partially completed: {stage}")]
    PartialTransfer { stage: String },

    /// Could not authenticate against the booking site.
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// The authenticated session expired mid-flight.
    #[error("session expired")]
    SessionExpired,

    /// Delivery of an operator notification failed.
    #[error("failed to deliver notification: {message}")]
    Notification { message: String },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for SeekerError {
    fn from(err: reqwest::Error) -> Self {
        SeekerError::Remote {
            message: err.to_string(),
        }
    }
}

impl SeekerError {
    /// Shorthand for a parse failure with context.
    pub fn parse(reason: impl Into<String>) -> Self {
        SeekerError::Parse {
            reason: reason.into(),
        }
    }

    /// Shorthand for a remote failure with context.
    pub fn remote(message: impl Into<String>) -> Self {
        SeekerError::Remote {
            message: message.into(),
        }
    }

    /// Shorthand for a configuration failure with context.
    pub fn config(message: impl Into<String>) -> Self {
        SeekerError::Config {
            message: message.into(),
        }
    }
}
