//! Relay error types.
//!
//! Error types map to numeric codes carried in outbound `error` events.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Relay service error type.
///
/// Maps to wire error codes:
/// - `InvalidIdentity`, `Decode`: `BAD_REQUEST` (1)
/// - `IdentityInUse`, `AlreadyRegistered`: `CONFLICT` (5)
/// - `Transport`, `Internal`: `INTERNAL_ERROR` (6)
/// - `Draining`: `UNAVAILABLE` (7)
#[derive(Debug, Error)]
pub enum RelayError {
    /// Registration carried an empty identity.
    #[error("Invalid identity")]
    InvalidIdentity,

    /// Identity is already held by another live connection.
    #[error("Identity already in use: {0}")]
    IdentityInUse(String),

    /// Connection tried to register a second time.
    #[error("Connection already registered as {0}")]
    AlreadyRegistered(String),

    /// Inbound frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Transport read or write failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relay is shutting down and no longer accepts registrations.
    #[error("Relay is draining")]
    Draining,

    /// Internal error (actor channel failures and similar).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RelayError::InvalidIdentity | RelayError::Decode(_) => 1, // BAD_REQUEST
            RelayError::IdentityInUse(_) | RelayError::AlreadyRegistered(_) => 5, // CONFLICT
            RelayError::Transport(_) | RelayError::Internal(_) => 6,  // INTERNAL_ERROR
            RelayError::Draining => 7,                                 // UNAVAILABLE
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RelayError::InvalidIdentity => "Identity must not be empty".to_string(),
            // Don't echo the contested identity back
            RelayError::IdentityInUse(_) => "Identity is already in use".to_string(),
            RelayError::AlreadyRegistered(_) => "Connection is already registered".to_string(),
            RelayError::Decode(_) => "Malformed message".to_string(),
            RelayError::Transport(_) | RelayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            RelayError::Draining => "Server is shutting down, please reconnect".to_string(),
        }
    }

    /// Bounded label for rejection metrics.
    #[must_use]
    pub const fn metric_label(&self) -> &'static str {
        match self {
            RelayError::InvalidIdentity => "invalid_identity",
            RelayError::IdentityInUse(_) => "identity_in_use",
            RelayError::AlreadyRegistered(_) => "already_registered",
            RelayError::Decode(_) => "decode",
            RelayError::Transport(_) => "transport",
            RelayError::Draining => "draining",
            RelayError::Internal(_) => "internal",
        }
    }
}
