//! Custom error types for the WebSQ client.
//!
//! This module defines `WebSqError`, the single error type surfaced by the
//! channels and the `WebSq` facade. It is built with `thiserror` so that
//! lower-level errors (`std::io`, `serde_json`, `figment`) convert through
//! `?` without ceremony.
//!
//! ## Error Hierarchy
//!
//! - **`Timeout`**: `ControlChannel::get` exceeded its wait ceiling. Terminal
//!   for that call only; the channel stays healthy.
//! - **`InvalidArgument`**: a per-detector command was given an array of the
//!   wrong length. Raised before any bytes touch the wire.
//! - **`ChannelClosed`** / **`ConnectionLost`**: the socket has been closed
//!   locally, or the receive loop died on a hard socket failure.
//! - **`UnexpectedValue`**: a label exists but its value does not have the
//!   shape the caller asked for.
//! - **`Io`**, **`Json`**, **`Config`**: wrapped lower-level failures.
//!
//! Malformed JSON fragments on the control stream never become errors; the
//! receive loop drops them and logs at debug level.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, WebSqError>;

/// Errors raised by the WebSQ client.
#[derive(Error, Debug)]
pub enum WebSqError {
    /// A label did not appear in the label table within the wait ceiling.
    #[error("Timed out after {waited:?} waiting for label '{label}'")]
    Timeout {
        /// Label that was requested
        label: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// Caller supplied an argument the device would reject.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The named channel has already been closed.
    #[error("{0} channel is closed")]
    ChannelClosed(&'static str),

    /// The receive loop terminated on a hard socket failure.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A label value could not be interpreted as the requested type.
    #[error("Unexpected value for label '{label}': {reason}")]
    UnexpectedValue {
        /// Label whose value was malformed
        label: String,
        /// What was wrong with it
        reason: String,
    },

    /// Configuration was parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for WebSqError {
    fn from(value: figment::Error) -> Self {
        WebSqError::Config(Box::new(value))
    }
}

impl WebSqError {
    /// Whether the failed call can simply be retried on the same connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WebSqError::Timeout { .. }
                | WebSqError::InvalidArgument(_)
                | WebSqError::UnexpectedValue { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_label() {
        let err = WebSqError::Timeout {
            label: "BiasVoltage".to_string(),
            waited: Duration::from_secs(10),
        };
        let message = err.to_string();
        assert!(message.contains("BiasVoltage"));
        assert!(message.contains("10s"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_connection_errors_are_not_recoverable() {
        assert!(!WebSqError::ChannelClosed("control").is_recoverable());
        assert!(!WebSqError::ConnectionLost("reset by peer".into()).is_recoverable());
        let io = WebSqError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!io.is_recoverable());
    }
}
