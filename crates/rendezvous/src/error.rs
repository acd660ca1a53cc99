//! Error types for the rendezvous crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // State machine errors
    /// A state transition was requested from a state the machine is not in.
    #[error("{machine} invalid state transition {from} -> {to}, actual state {actual}")]
    InvalidTransition {
        /// Name of the state machine, for diagnostics.
        machine: &'static str,
        /// State the transition required.
        from: String,
        /// State the transition would have moved to.
        to: String,
        /// State the machine was actually in.
        actual: String,
    },

    /// An operation needed an attached connection but none is present.
    #[error("not connected")]
    NotConnected,

    // Handshake errors
    /// The handshake line exceeded the maximum allowed size.
    #[error("handshake too large: {size} bytes exceeds maximum of {max} bytes")]
    HandshakeTooLong {
        /// Actual line size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The handshake line was not a well-formed security key.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
