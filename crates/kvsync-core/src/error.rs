//! Client error handling
//!
//! Provides typed errors for requests against the store. Errors are
//! `Clone` so a watch can keep the last one in its published state.

use std::fmt::Display;

use thiserror::Error;

/// Errors that can occur while talking to the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Could not establish a connection
    #[error("Failed to connect to '{address}': {message}")]
    Connect { address: String, message: String },

    /// No live connection in this scope
    #[error("Not connected to a store")]
    NotConnected,

    /// The connection was closed while the request was pending
    #[error("Connection closed")]
    Closed,

    /// The store rejected or failed a request
    #[error("{op} request failed: {message}")]
    Request { op: &'static str, message: String },

    /// Key could not be parsed
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Pattern could not be parsed
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
}

impl ClientError {
    /// Create a request error for the named operation
    pub fn request(op: &'static str, message: impl Display) -> Self {
        ClientError::Request {
            op,
            message: message.to_string(),
        }
    }

    /// Check if retrying after a reconnect could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::NotConnected | ClientError::Closed
        )
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_recoverable() {
        let err = ClientError::Connect {
            address: "ws://localhost:8080/ws".to_string(),
            message: "refused".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(ClientError::Closed.is_recoverable());
        assert!(ClientError::NotConnected.is_recoverable());
    }

    #[test]
    fn test_request_errors_are_not_recoverable() {
        let err = ClientError::request("get", "no such key");
        assert!(!err.is_recoverable());

        let err = ClientError::InvalidKey {
            key: "a//b".to_string(),
            reason: "empty segment",
        };
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::request("set", "permission denied");
        assert_eq!(err.to_string(), "set request failed: permission denied");

        let err = ClientError::Connect {
            address: "ws://store:8080/ws".to_string(),
            message: "timed out".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ws://store:8080/ws"));
        assert!(msg.contains("timed out"));
    }
}
