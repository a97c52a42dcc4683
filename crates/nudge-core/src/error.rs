//! Nudge error types.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NudgeError>;

/// Top-level error for all Nudge subsystems.
#[derive(Debug, Error)]
pub enum NudgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid schedule: {0}")]
    Schedule(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classified delivery failure from a messaging channel.
///
/// The channel is responsible for mapping its transport/API errors onto this
/// enum so the dispatcher can decide retryability without inspecting error
/// message text.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Channel has no live client yet (`initialize` not called or failed).
    #[error("channel not ready")]
    NotReady,

    /// The remote endpoint asked us to slow down (HTTP 429).
    #[error("rate limited (retry after {}s)", retry_after_secs.unwrap_or(0))]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out in flight.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure (reset, refused, DNS).
    #[error("network error: {0}")]
    Network(String),

    /// Remote endpoint returned a 5xx.
    #[error("server error: HTTP {0}")]
    Server(u16),

    /// Permanent rejection (invalid recipient, blocked bot, bad payload).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl SendError {
    /// Whether a retry with backoff has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SendError::RateLimited { .. }
                | SendError::Timeout
                | SendError::Network(_)
                | SendError::Server(_)
        )
    }

    /// Server-suggested wait, if the error carried one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SendError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}
