//! Error types for ringtopic.

use thiserror::Error;

/// Boxed error returned by subscribers and carried by terminal error signals.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for ringtopic operations
pub type Result<T> = std::result::Result<T, TopicError>;

#[derive(Error, Debug)]
pub enum TopicError {
    /// Worker thread could not be spawned
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Operation not allowed in the processor's current state
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// A wait was interrupted by cancellation or shutdown
    #[error("Wait interrupted by alert")]
    Alerted,

    /// A subscriber failed while handling the item at `sequence`
    #[error("Handler failed at sequence {sequence}: {source}")]
    HandlerFailure {
        sequence: i64,
        #[source]
        source: BoxError,
    },

    #[error("Operation timed out")]
    Timeout,

    /// A submitted task was dropped or panicked before producing a value
    #[error("Task cancelled before completion")]
    TaskCancelled,
}

impl TopicError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState { message: message.into() }
    }

    pub fn handler(sequence: i64, source: impl Into<BoxError>) -> Self {
        Self::HandlerFailure { sequence, source: source.into() }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Alerted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TopicError::config("backlog must be positive");
        assert_eq!(err.to_string(), "Invalid configuration: backlog must be positive");

        let err = TopicError::handler(7, "boom");
        assert_eq!(err.to_string(), "Handler failed at sequence 7: boom");
    }

    #[test]
    fn test_recoverable() {
        assert!(TopicError::Timeout.is_recoverable());
        assert!(TopicError::Alerted.is_recoverable());
        assert!(!TopicError::illegal_state("closed").is_recoverable());
    }
}
