//! Error types for the B2B transaction and dialog engine

use sbc_media_core::MediaError;
use thiserror::Error;

/// Errors raised while routing transactions and correlating dialogs
#[derive(Error, Debug)]
pub enum B2bError {
    /// Every resolution strategy for the target came back empty
    #[error("Unable to resolve target {target}")]
    UnresolvableTarget { target: String },

    /// No dialog matches the message
    #[error("No dialog exists: {0}")]
    NoDialogExists(String),

    /// The 2xx needed to recover an ACK branch is gone
    #[error("Missing branch: {0}")]
    MissingBranch(String),

    /// Send or connect failure on the client side
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Malformed SIP input
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Max-Forwards exhausted")]
    MaxForwardsExceeded,

    /// Dialog or registration store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Media relay error: {0}")]
    Media(#[from] MediaError),
}

impl B2bError {
    pub fn unresolvable(target: impl Into<String>) -> Self {
        Self::UnresolvableTarget { target: target.into() }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// Status line used when the error is surfaced to a peer
    pub fn sip_status(&self) -> (u16, &'static str) {
        match self {
            Self::UnresolvableTarget { .. } => (500, "DNS/SRV Error"),
            Self::NoDialogExists(_) => (481, "Call/Transaction Does Not Exist"),
            Self::MissingBranch(_) => (481, "Call/Transaction Does Not Exist"),
            Self::TransportError(_) => (503, "Service Unavailable"),
            Self::ProtocolViolation(_) => (400, "Bad Request"),
            Self::MaxForwardsExceeded => (483, "Too Many Hops"),
            Self::Persistence(_) => (500, "Internal Server Error"),
            Self::Media(MediaError::ProtocolViolation(_)) => (400, "Bad Request"),
            Self::Media(MediaError::SessionNotFound(_)) => (481, "Call/Transaction Does Not Exist"),
            Self::Media(_) => (500, "Media Relay Unavailable"),
        }
    }
}

pub type Result<T> = std::result::Result<T, B2bError>;
