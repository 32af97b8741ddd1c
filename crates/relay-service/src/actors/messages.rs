//! Message types for actor communication.
//!
//! Connection actors talk to the coordinator over a bounded `tokio::sync::mpsc`
//! mailbox. Request-reply commands carry a `tokio::sync::oneshot` sender.

use crate::errors::RelayError;

use super::session::SessionOutbound;

use std::collections::BTreeSet;
use tokio::sync::oneshot;

/// Messages sent to `CoordinatorActor`.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Register a connection under a client-chosen identity.
    Register {
        connection_id: String,
        identity: String,
        interests: BTreeSet<String>,
        /// Delivery handle for events routed to this connection.
        outbound: SessionOutbound,
        /// Response channel for the registration result.
        respond_to: oneshot::Sender<Result<RegisterResult, RelayError>>,
    },

    /// Forward a message frame to the sender's partner (fire-and-forget).
    Relay {
        connection_id: String,
        identity: String,
        /// Original inbound frame text.
        payload: String,
    },

    /// The connection is gone; tear down its session and pairing.
    Unregister {
        connection_id: String,
        identity: String,
    },

    /// Get current registry and match counts.
    GetStatus {
        respond_to: oneshot::Sender<CoordinatorStatus>,
    },

    /// Look up the current partner of an identity.
    GetPartner {
        identity: String,
        respond_to: oneshot::Sender<Option<String>>,
    },

    /// Stop accepting registrations and close every session.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), RelayError>>,
    },
}

impl CoordinatorMessage {
    /// Bounded label for latency metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            CoordinatorMessage::Register { .. } => "register",
            CoordinatorMessage::Relay { .. } => "relay",
            CoordinatorMessage::Unregister { .. } => "unregister",
            CoordinatorMessage::GetStatus { .. } => "get_status",
            CoordinatorMessage::GetPartner { .. } => "get_partner",
            CoordinatorMessage::Shutdown { .. } => "shutdown",
        }
    }
}

/// Result of an accepted registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResult {
    /// Partner found by the matching scan, if any.
    pub partner: Option<String>,
}

/// Coordinator status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    /// Registered sessions.
    pub session_count: usize,
    /// Active pairs.
    pub match_count: usize,
    /// Registered sessions without a partner.
    pub unmatched_count: usize,
    /// Commands waiting in the mailbox.
    pub mailbox_depth: usize,
    /// True once shutdown has begun.
    pub is_draining: bool,
}

/// Connection lifecycle, as seen by its connection actor.
///
/// `Connecting -> Registered -> Matched -> Disconnected`; `Registered` may go
/// straight to `Disconnected`. There is no transition back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Matched,
    Disconnected,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Registered => "registered",
            ConnectionState::Matched => "matched",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}
