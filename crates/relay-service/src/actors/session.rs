//! Client sessions and the session registry.
//!
//! A [`Session`] exists only while its connection is registered. Its
//! partner is not stored here: the [`MatchTable`](super::match_table::MatchTable)
//! is the single source of truth for pairings.
//!
//! The [`SessionRegistry`] iterates in registration order, which is the
//! order the matching scan walks.

use crate::errors::RelayError;
use crate::wire::OutboundEvent;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a non-blocking delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The session's outbound queue is at capacity.
    QueueFull,
    /// The connection stopped reading its queue.
    Closed,
}

/// Handle for pushing events to one connection.
///
/// The coordinator only ever uses [`try_deliver`](Self::try_deliver),
/// [`try_reserve`](Self::try_reserve) and [`close`](Self::close); it never
/// waits on a client.
#[derive(Debug, Clone)]
pub struct SessionOutbound {
    sender: mpsc::Sender<OutboundEvent>,
    close_token: CancellationToken,
}

impl SessionOutbound {
    #[must_use]
    pub fn new(sender: mpsc::Sender<OutboundEvent>, close_token: CancellationToken) -> Self {
        Self {
            sender,
            close_token,
        }
    }

    /// Queue an event without waiting.
    pub fn try_deliver(&self, event: OutboundEvent) -> Result<(), DeliveryFailure> {
        if self.close_token.is_cancelled() {
            return Err(DeliveryFailure::Closed);
        }
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    /// Claim one queue slot without waiting.
    ///
    /// Dropping the permit unused releases the slot.
    pub fn try_reserve(&self) -> Result<mpsc::Permit<'_, OutboundEvent>, DeliveryFailure> {
        if self.close_token.is_cancelled() {
            return Err(DeliveryFailure::Closed);
        }
        self.sender.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => DeliveryFailure::QueueFull,
            mpsc::error::TrySendError::Closed(()) => DeliveryFailure::Closed,
        })
    }

    /// Ask the owning connection to shut down. Idempotent.
    pub fn close(&self) {
        self.close_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled() || self.sender.is_closed()
    }

    /// Events currently waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// A registered participant.
#[derive(Debug)]
pub struct Session {
    /// Client-chosen identity, unique among registered sessions.
    pub identity: String,
    /// Declared interest tags. Compared by exact, case-sensitive equality.
    pub interests: BTreeSet<String>,
    /// Server-assigned ID of the owning connection.
    pub connection_id: String,
    /// Delivery handle for the owning connection.
    pub outbound: SessionOutbound,
    /// Registration timestamp.
    pub registered_at: DateTime<Utc>,
    /// Monotonic registration time, for session duration.
    pub registered_instant: Instant,
}

impl Session {
    #[must_use]
    pub fn new(
        identity: String,
        interests: BTreeSet<String>,
        connection_id: String,
        outbound: SessionOutbound,
    ) -> Self {
        Self {
            identity,
            interests,
            connection_id,
            outbound,
            registered_at: Utc::now(),
            registered_instant: Instant::now(),
        }
    }

    /// True if the two sessions declared at least one common tag.
    #[must_use]
    pub fn shares_interest(&self, other: &Session) -> bool {
        !self.interests.is_disjoint(&other.interests)
    }

    /// True if this session belongs to `connection_id`.
    #[must_use]
    pub fn is_owned_by(&self, connection_id: &str) -> bool {
        self.connection_id == connection_id
    }
}

struct RegisteredSession {
    seq: u64,
    session: Session,
}

/// All registered sessions, keyed by identity and ordered by registration.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, RegisteredSession>,
    /// Registration sequence -> identity.
    order: BTreeMap<u64, String>,
    /// Connection ID -> identity.
    by_connection: HashMap<String, String>,
    next_seq: u64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session.
    ///
    /// Fails if the identity is already registered or the connection
    /// already owns a session; the existing entry is left untouched.
    pub fn insert(&mut self, session: Session) -> Result<(), RelayError> {
        if let Some(existing) = self.by_connection.get(&session.connection_id) {
            return Err(RelayError::AlreadyRegistered(existing.clone()));
        }
        if self.sessions.contains_key(&session.identity) {
            return Err(RelayError::IdentityInUse(session.identity));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.order.insert(seq, session.identity.clone());
        self.by_connection
            .insert(session.connection_id.clone(), session.identity.clone());
        self.sessions
            .insert(session.identity.clone(), RegisteredSession { seq, session });
        Ok(())
    }

    /// Remove a session by identity.
    pub fn remove(&mut self, identity: &str) -> Option<Session> {
        let entry = self.sessions.remove(identity)?;
        self.order.remove(&entry.seq);
        self.by_connection.remove(&entry.session.connection_id);
        Some(entry.session)
    }

    #[must_use]
    pub fn get(&self, identity: &str) -> Option<&Session> {
        self.sessions.get(identity).map(|entry| &entry.session)
    }

    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Identity registered by a connection, if any.
    #[must_use]
    pub fn identity_for_connection(&self, connection_id: &str) -> Option<&str> {
        self.by_connection.get(connection_id).map(String::as_str)
    }

    /// Sessions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.order
            .values()
            .filter_map(|identity| self.sessions.get(identity))
            .map(|entry| &entry.session)
    }

    /// Remove every session, in registration order.
    pub fn drain(&mut self) -> Vec<Session> {
        let order = std::mem::take(&mut self.order);
        self.by_connection.clear();
        let sessions = order
            .into_values()
            .filter_map(|identity| self.sessions.remove(&identity))
            .map(|entry| entry.session)
            .collect();
        self.sessions.clear();
        sessions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
