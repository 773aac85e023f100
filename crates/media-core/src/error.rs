//! Error types for the media relay engine

use thiserror::Error;

/// Errors raised by the relay engine
#[derive(Error, Debug)]
pub enum MediaError {
    /// A UDP socket could not be bound or configured
    #[error("Bind error on {address}: {reason}")]
    BindError { address: String, reason: String },

    /// The session ceiling has been reached
    #[error("Too many relay sessions (max {max})")]
    TooManySessions { max: usize },

    /// No relay session exists for the identifier
    #[error("Relay session not found: {0}")]
    SessionNotFound(String),

    /// No listener could be bound within the retry budget
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Malformed SDP or RTP input
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Malformed RPC request
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn bind(address: impl ToString, reason: impl ToString) -> Self {
        Self::BindError {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound(id.into())
    }

    /// Errors that must abort call setup rather than continue unproxied
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Self::TooManySessions { .. } | Self::RelayUnavailable(_) | Self::BindError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
