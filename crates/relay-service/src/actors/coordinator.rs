//! `CoordinatorActor` - singleton owner of the session registry and match
//! table.
//!
//! Every mutation of relay state happens inside this actor, one command at
//! a time, in mailbox order:
//!
//! - Registers sessions and runs first-fit matching
//! - Relays message frames to the sender's partner
//! - Tears down sessions on disconnect or outbound overflow
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! The actor never waits on a client. Delivery uses
//! [`SessionOutbound::try_deliver`]; a session whose queue is full is
//! evicted and its connection closed.
//!
//! # Graceful Shutdown
//!
//! On `Shutdown`, the coordinator:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken`
//! 3. Closes every session's outbound handle and clears the match table

use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::wire::OutboundEvent;

use super::match_table::MatchTable;
use super::messages::{CoordinatorMessage, CoordinatorStatus, RegisterResult};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{DeliveryFailure, Session, SessionOutbound, SessionRegistry};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to the `CoordinatorActor`.
///
/// Cheap to clone; every connection actor holds one.
#[derive(Clone, Debug)]
pub struct CoordinatorActorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
}

impl CoordinatorActorHandle {
    /// Register `identity` for a connection.
    ///
    /// Resolves once the coordinator has inserted the session and run the
    /// matching scan.
    pub async fn register(
        &self,
        connection_id: String,
        identity: String,
        interests: BTreeSet<String>,
        outbound: SessionOutbound,
    ) -> Result<RegisterResult, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Register {
                connection_id,
                identity,
                interests,
                outbound,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Queue a message for the sender's partner.
    ///
    /// Returns once the command is in the mailbox, not when it is delivered.
    pub async fn relay(
        &self,
        connection_id: String,
        identity: String,
        payload: String,
    ) -> Result<(), RelayError> {
        self.sender
            .send(CoordinatorMessage::Relay {
                connection_id,
                identity,
                payload,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    /// Tear down the session owned by `connection_id`, if any.
    pub async fn unregister(
        &self,
        connection_id: String,
        identity: String,
    ) -> Result<(), RelayError> {
        self.sender
            .send(CoordinatorMessage::Unregister {
                connection_id,
                identity,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))
    }

    /// Get the current coordinator status.
    pub async fn get_status(&self) -> Result<CoordinatorStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current partner of `identity`.
    pub async fn get_partner(&self, identity: String) -> Result<Option<String>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::GetPartner {
                identity,
                respond_to: tx,
            })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoordinatorMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| RelayError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for the listener and connection actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `CoordinatorActor` implementation.
pub struct CoordinatorActor {
    /// Relay instance ID.
    relay_id: String,
    /// Message receiver.
    receiver: mpsc::Receiver<CoordinatorMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    /// Registered sessions.
    registry: SessionRegistry,
    /// Current pairings.
    matches: MatchTable,
    /// Whether new registrations are accepted.
    accepting_new: bool,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl CoordinatorActor {
    /// Spawn the coordinator and return its handle and task handle.
    ///
    /// `mailbox_capacity` bounds the command queue; connection actors wait
    /// when it is full.
    pub fn spawn(
        relay_id: String,
        mailbox_capacity: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (CoordinatorActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(mailbox_capacity);

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Coordinator, &relay_id),
            relay_id,
            receiver,
            cancel_token: cancel_token.clone(),
            registry: SessionRegistry::new(),
            matches: MatchTable::new(),
            accepting_new: true,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = CoordinatorActorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "relay.actor.coordinator", fields(relay_id = %self.relay_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.coordinator",
            relay_id = %self.relay_id,
            "CoordinatorActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.coordinator",
                        relay_id = %self.relay_id,
                        "CoordinatorActor received cancellation signal"
                    );
                    self.graceful_shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let depth = self.receiver.len() + 1;
                            self.mailbox.observe(depth);
                            prom::set_actor_mailbox_depth(ActorType::Coordinator.as_str(), depth);

                            let command = message.kind();
                            let start = Instant::now();
                            self.handle_message(message);
                            prom::record_command_latency(command, start.elapsed());

                            self.mailbox.record_processed();
                        }
                        None => {
                            info!(
                                target: "relay.actor.coordinator",
                                relay_id = %self.relay_id,
                                "CoordinatorActor channel closed, exiting"
                            );
                            self.graceful_shutdown();
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.coordinator",
            relay_id = %self.relay_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "CoordinatorActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Register {
                connection_id,
                identity,
                interests,
                outbound,
                respond_to,
            } => {
                let result = self.register(connection_id, identity, interests, outbound);
                if let Err(ref e) = result {
                    prom::record_registration_rejected(e.metric_label());
                    debug!(
                        target: "relay.actor.coordinator",
                        relay_id = %self.relay_id,
                        reason = e.metric_label(),
                        "Registration rejected"
                    );
                }
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::Relay {
                connection_id,
                identity,
                payload,
            } => {
                self.relay(&connection_id, &identity, payload);
            }

            CoordinatorMessage::Unregister {
                connection_id,
                identity,
            } => {
                self.unregister(&connection_id, &identity);
            }

            CoordinatorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            CoordinatorMessage::GetPartner {
                identity,
                respond_to,
            } => {
                let partner = self.matches.partner_of(&identity).map(str::to_string);
                let _ = respond_to.send(partner);
            }

            CoordinatorMessage::Shutdown { respond_to } => {
                self.initiate_shutdown();
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    /// Insert a session and pair it with the first compatible one.
    fn register(
        &mut self,
        connection_id: String,
        identity: String,
        interests: BTreeSet<String>,
        outbound: SessionOutbound,
    ) -> Result<RegisterResult, RelayError> {
        if !self.accepting_new {
            return Err(RelayError::Draining);
        }
        if identity.is_empty() {
            return Err(RelayError::InvalidIdentity);
        }

        let interest_count = interests.len();
        self.registry
            .insert(Session::new(identity.clone(), interests, connection_id, outbound))?;

        debug!(
            target: "relay.actor.coordinator",
            relay_id = %self.relay_id,
            identity = %identity,
            interest_count = interest_count,
            total_sessions = self.registry.len(),
            "Session registered"
        );

        let partner = self.match_newcomer(&identity);
        self.publish_gauges();

        Ok(RegisterResult { partner })
    }

    /// First registered, unmatched session sharing an interest with
    /// `identity`.
    fn find_partner(&self, identity: &str) -> Option<String> {
        let newcomer = self.registry.get(identity)?;
        if self.matches.is_matched(identity) {
            return None;
        }

        self.registry
            .iter()
            .find(|candidate| {
                candidate.identity != identity
                    && !self.matches.is_matched(&candidate.identity)
                    && candidate.shares_interest(newcomer)
            })
            .map(|candidate| candidate.identity.clone())
    }

    /// Run the matching scan for a freshly registered session.
    ///
    /// Both sides reserve a queue slot before either `match` event is sent.
    /// A candidate that cannot take the event is torn down and the scan
    /// continues with the next one; a newcomer that cannot ends the scan.
    fn match_newcomer(&mut self, identity: &str) -> Option<String> {
        while let Some(candidate) = self.find_partner(identity) {
            if let Err((failed, failure)) = self.notify_pair(identity, &candidate) {
                self.handle_delivery_failure(&failed, failure);
                if failed == identity {
                    return None;
                }
                continue;
            }

            self.matches.pair(identity, &candidate);
            self.metrics.match_made();
            prom::record_match();

            info!(
                target: "relay.actor.coordinator",
                relay_id = %self.relay_id,
                identity = %identity,
                partner = %candidate,
                total_matches = self.matches.pair_count(),
                "Sessions matched"
            );

            return Some(candidate);
        }

        None
    }

    /// Send each side a `match` naming the other, or neither.
    ///
    /// On failure returns the identity that could not take the event.
    fn notify_pair(&self, newcomer: &str, candidate: &str) -> Result<(), (String, DeliveryFailure)> {
        let newcomer_slot = self.reserve_slot(newcomer)?;
        let candidate_slot = self.reserve_slot(candidate)?;

        newcomer_slot.send(OutboundEvent::Matched {
            partner: candidate.to_string(),
        });
        candidate_slot.send(OutboundEvent::Matched {
            partner: newcomer.to_string(),
        });
        Ok(())
    }

    fn reserve_slot(
        &self,
        identity: &str,
    ) -> Result<mpsc::Permit<'_, OutboundEvent>, (String, DeliveryFailure)> {
        self.registry
            .get(identity)
            .ok_or(DeliveryFailure::Closed)
            .and_then(|session| session.outbound.try_reserve())
            .map_err(|failure| (identity.to_string(), failure))
    }

    /// Forward a payload from `identity` to its partner.
    fn relay(&mut self, connection_id: &str, identity: &str, payload: String) {
        let owned = self
            .registry
            .get(identity)
            .is_some_and(|session| session.is_owned_by(connection_id));
        if !owned {
            self.drop_message("not_registered");
            return;
        }

        let Some(partner) = self.matches.partner_of(identity).map(str::to_string) else {
            self.drop_message("no_partner");
            return;
        };

        match self.deliver(&partner, OutboundEvent::Relay { payload }) {
            Ok(()) => {
                self.metrics.message_relayed();
                prom::record_message_relayed();
            }
            Err(DeliveryFailure::QueueFull) => self.drop_message("queue_full"),
            Err(DeliveryFailure::Closed) => self.drop_message("partner_closed"),
        }
    }

    fn drop_message(&self, reason: &'static str) {
        self.metrics.message_dropped();
        prom::record_message_dropped(reason);
        debug!(
            target: "relay.actor.coordinator",
            relay_id = %self.relay_id,
            reason = reason,
            "Message dropped"
        );
    }

    /// Tear down the session for `identity` if `connection_id` owns it.
    fn unregister(&mut self, connection_id: &str, identity: &str) {
        let owned = self
            .registry
            .get(identity)
            .is_some_and(|session| session.is_owned_by(connection_id));
        if !owned {
            debug!(
                target: "relay.actor.coordinator",
                relay_id = %self.relay_id,
                connection_id = %connection_id,
                "Unregister ignored, session not owned by connection"
            );
            return;
        }

        self.teardown(identity, "disconnect");
    }

    /// Queue an event for a session; tear the session down if it can't
    /// take it.
    fn deliver(&mut self, identity: &str, event: OutboundEvent) -> Result<(), DeliveryFailure> {
        let Some(session) = self.registry.get(identity) else {
            return Err(DeliveryFailure::Closed);
        };

        let result = session.outbound.try_deliver(event);
        if let Err(failure) = result {
            self.handle_delivery_failure(identity, failure);
        }
        result
    }

    /// Evict a session whose queue is full, or clean up one already gone.
    fn handle_delivery_failure(&mut self, identity: &str, failure: DeliveryFailure) {
        match failure {
            DeliveryFailure::QueueFull => {
                warn!(
                    target: "relay.actor.coordinator",
                    relay_id = %self.relay_id,
                    identity = %identity,
                    "Outbound queue full, evicting session"
                );
                self.metrics.session_evicted();
                prom::record_session_evicted();
                self.teardown(identity, "queue_full");
            }
            DeliveryFailure::Closed => {
                self.teardown(identity, "closed");
            }
        }
    }

    /// Remove a session, unmatch its partner, and close its connection.
    ///
    /// The former partner stays registered and unmatched.
    fn teardown(&mut self, identity: &str, reason: &'static str) {
        let Some(session) = self.registry.remove(identity) else {
            return;
        };
        let former_partner = self.matches.unpair(identity);
        session.outbound.close();

        prom::record_session_duration(session.registered_instant.elapsed());
        self.publish_gauges();

        info!(
            target: "relay.actor.coordinator",
            relay_id = %self.relay_id,
            identity = %identity,
            reason = reason,
            was_matched = former_partner.is_some(),
            registered_at = %session.registered_at,
            total_sessions = self.registry.len(),
            "Session removed"
        );
    }

    fn get_status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            session_count: self.registry.len(),
            match_count: self.matches.pair_count(),
            unmatched_count: self.registry.len() - self.matches.matched_count(),
            mailbox_depth: self.receiver.len(),
            is_draining: !self.accepting_new,
        }
    }

    fn initiate_shutdown(&mut self) {
        info!(
            target: "relay.actor.coordinator",
            relay_id = %self.relay_id,
            sessions = self.registry.len(),
            "Initiating graceful shutdown"
        );
        self.accepting_new = false;
        self.cancel_token.cancel();
    }

    /// Close every session's connection and clear all state.
    fn graceful_shutdown(&mut self) {
        self.accepting_new = false;

        let sessions = self.registry.drain();
        let closed = sessions.len();
        for session in sessions {
            session.outbound.close();
            prom::record_session_duration(session.registered_instant.elapsed());
        }
        self.matches.clear();
        self.publish_gauges();

        info!(
            target: "relay.actor.coordinator",
            relay_id = %self.relay_id,
            sessions_closed = closed,
            "Graceful shutdown complete"
        );
    }

    fn publish_gauges(&self) {
        prom::set_sessions_active(self.registry.len());
        prom::set_matches_active(self.matches.pair_count());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct TestClient {
        connection_id: String,
        identity: String,
        rx: mpsc::Receiver<OutboundEvent>,
        close_token: CancellationToken,
    }

    fn spawn_coordinator() -> (CoordinatorActorHandle, JoinHandle<()>, Arc<ActorMetrics>) {
        let metrics = ActorMetrics::new();
        let (handle, task) = CoordinatorActor::spawn(
            "relay-test".to_string(),
            64,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (handle, task, metrics)
    }

    async fn register_with_capacity(
        handle: &CoordinatorActorHandle,
        connection_id: &str,
        identity: &str,
        interests: &[&str],
        capacity: usize,
    ) -> (Result<RegisterResult, RelayError>, TestClient) {
        let (tx, rx) = mpsc::channel(capacity);
        let close_token = CancellationToken::new();
        let outbound = SessionOutbound::new(tx, close_token.clone());
        let result = handle
            .register(
                connection_id.to_string(),
                identity.to_string(),
                interests.iter().map(|s| (*s).to_string()).collect(),
                outbound,
            )
            .await;
        let client = TestClient {
            connection_id: connection_id.to_string(),
            identity: identity.to_string(),
            rx,
            close_token,
        };
        (result, client)
    }

    async fn register(
        handle: &CoordinatorActorHandle,
        identity: &str,
        interests: &[&str],
    ) -> TestClient {
        let connection_id = format!("conn-{identity}");
        let (result, client) =
            register_with_capacity(handle, &connection_id, identity, interests, 16).await;
        result.expect("registration should succeed");
        client
    }

    async fn relay(handle: &CoordinatorActorHandle, from: &TestClient, payload: &str) {
        handle
            .relay(
                from.connection_id.clone(),
                from.identity.clone(),
                payload.to_string(),
            )
            .await
            .unwrap();
        // Commands are processed in order; a status round-trip flushes the relay.
        handle.get_status().await.unwrap();
    }

    fn matched(partner: &str) -> OutboundEvent {
        OutboundEvent::Matched {
            partner: partner.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_fit_matching() {
        let (handle, _task, metrics) = spawn_coordinator();

        let mut a = register(&handle, "A", &["x"]).await;
        let mut b = register(&handle, "B", &["y"]).await;
        let mut c = register(&handle, "C", &["x", "y"]).await;

        assert_eq!(a.rx.try_recv().unwrap(), matched("C"));
        assert_eq!(c.rx.try_recv().unwrap(), matched("A"));
        assert!(b.rx.try_recv().is_err());

        assert_eq!(
            handle.get_partner("C".to_string()).await.unwrap(),
            Some("A".to_string())
        );
        assert_eq!(handle.get_partner("B".to_string()).await.unwrap(), None);

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, 3);
        assert_eq!(status.match_count, 1);
        assert_eq!(status.unmatched_count, 1);
        assert!(!status.is_draining);
        assert_eq!(metrics.matches_made(), 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_register_returns_partner() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let (first, _a) = register_with_capacity(&handle, "c1", "A", &["x"], 4).await;
        let (second, _b) = register_with_capacity(&handle, "c2", "B", &["x"], 4).await;

        assert_eq!(first.unwrap().partner, None);
        assert_eq!(second.unwrap().partner, Some("A".to_string()));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_disjoint_interests_never_match() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let mut a = register(&handle, "A", &["x"]).await;
        let mut b = register(&handle, "B", &["X"]).await;
        let mut c = register(&handle, "C", &[]).await;

        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
        assert!(c.rx.try_recv().is_err());

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.match_count, 0);
        assert_eq!(status.unmatched_count, 3);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let (result, _client) = register_with_capacity(&handle, "c1", "", &["x"], 4).await;

        assert!(matches!(result, Err(RelayError::InvalidIdentity)));
        assert_eq!(handle.get_status().await.unwrap().session_count, 0);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let _a = register(&handle, "alice", &["x"]).await;
        let _b = register(&handle, "bob", &["x"]).await;

        let (result, intruder) =
            register_with_capacity(&handle, "c-other", "alice", &["x"], 4).await;

        assert!(matches!(result, Err(RelayError::IdentityInUse(_))));
        assert!(!intruder.close_token.is_cancelled());
        assert_eq!(
            handle.get_partner("alice".to_string()).await.unwrap(),
            Some("bob".to_string())
        );

        // The rejected connection cannot tear down the original session.
        handle
            .unregister("c-other".to_string(), "alice".to_string())
            .await
            .unwrap();
        assert_eq!(handle.get_status().await.unwrap().session_count, 2);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_reregister_same_connection_rejected() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let _a = register(&handle, "alice", &["x"]).await;
        let (result, _again) =
            register_with_capacity(&handle, "conn-alice", "alice2", &["x"], 4).await;

        assert!(matches!(result, Err(RelayError::AlreadyRegistered(id)) if id == "alice"));
        assert_eq!(handle.get_status().await.unwrap().session_count, 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_relay_isolation() {
        let (handle, _task, metrics) = spawn_coordinator();

        let mut a = register(&handle, "A", &["x"]).await;
        let mut b = register(&handle, "B", &["x"]).await;
        let mut c = register(&handle, "C", &["z"]).await;
        a.rx.try_recv().unwrap();
        b.rx.try_recv().unwrap();

        relay(&handle, &c, r#"{"type":"message","text":"anyone?"}"#).await;
        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
        assert!(c.rx.try_recv().is_err());

        let frame = r#"{"type":"message","id":"A","text":"hi  there"}"#;
        relay(&handle, &a, frame).await;
        assert_eq!(
            b.rx.try_recv().unwrap(),
            OutboundEvent::Relay {
                payload: frame.to_string()
            }
        );
        assert!(a.rx.try_recv().is_err());
        assert!(c.rx.try_recv().is_err());

        assert_eq!(metrics.messages_relayed(), 1);
        assert_eq!(metrics.messages_dropped(), 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_relay_from_foreign_connection_dropped() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let _a = register(&handle, "A", &["x"]).await;
        let mut b = register(&handle, "B", &["x"]).await;
        b.rx.try_recv().unwrap();

        handle
            .relay("conn-forged".to_string(), "A".to_string(), "spoof".to_string())
            .await
            .unwrap();
        handle.get_status().await.unwrap();

        assert!(b.rx.try_recv().is_err());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_cleanup() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let mut a = register(&handle, "A", &["x"]).await;
        let mut b = register(&handle, "B", &["x"]).await;
        let mut c = register(&handle, "C", &["x"]).await;
        a.rx.try_recv().unwrap();
        b.rx.try_recv().unwrap();

        handle
            .unregister(a.connection_id.clone(), a.identity.clone())
            .await
            .unwrap();

        assert!(a.close_token.is_cancelled());
        assert_eq!(handle.get_partner("B".to_string()).await.unwrap(), None);
        // Survivors are not re-matched with each other.
        assert_eq!(handle.get_partner("C".to_string()).await.unwrap(), None);
        assert!(b.rx.try_recv().is_err());
        assert!(c.rx.try_recv().is_err());

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, 2);
        assert_eq!(status.match_count, 0);
        assert_eq!(status.unmatched_count, 2);

        // B's messages reach nobody.
        relay(&handle, &b, "hello?").await;
        assert!(c.rx.try_recv().is_err());

        // A new registrant picks the earliest waiting session.
        let mut d = register(&handle, "D", &["x"]).await;
        assert_eq!(d.rx.try_recv().unwrap(), matched("B"));
        assert_eq!(b.rx.try_recv().unwrap(), matched("D"));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let a = register(&handle, "A", &["x"]).await;
        let _b = register(&handle, "B", &["x"]).await;

        for _ in 0..2 {
            handle
                .unregister(a.connection_id.clone(), a.identity.clone())
                .await
                .unwrap();
        }
        handle
            .unregister("conn-unknown".to_string(), "nobody".to_string())
            .await
            .unwrap();

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, 1);
        assert_eq!(status.match_count, 0);

        // Identity is free again once released.
        let _a2 = register(&handle, "A", &["y"]).await;
        assert_eq!(handle.get_status().await.unwrap().session_count, 2);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_overflow_evicts_only_slow_session() {
        let (handle, _task, metrics) = spawn_coordinator();

        let mut fast = register(&handle, "fast", &["x"]).await;
        // Capacity 1: the match event fills the queue.
        let (result, slow) = register_with_capacity(&handle, "conn-slow", "slow", &["x"], 1).await;
        assert_eq!(result.unwrap().partner, Some("fast".to_string()));
        assert_eq!(fast.rx.try_recv().unwrap(), matched("slow"));

        relay(&handle, &fast, "first").await;

        assert!(slow.close_token.is_cancelled());
        assert!(!fast.close_token.is_cancelled());
        assert_eq!(handle.get_partner("fast".to_string()).await.unwrap(), None);

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, 1);
        assert_eq!(status.match_count, 0);
        assert_eq!(metrics.sessions_evicted(), 1);
        assert_eq!(metrics.messages_dropped(), 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_closed_candidate_skipped_during_matching() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let gone = register(&handle, "gone", &["x"]).await;
        let mut live = register(&handle, "live", &["y"]).await;
        drop(gone.rx);

        let mut newcomer = register(&handle, "new", &["x", "y"]).await;

        assert_eq!(newcomer.rx.try_recv().unwrap(), matched("live"));
        assert_eq!(live.rx.try_recv().unwrap(), matched("new"));
        assert!(gone.close_token.is_cancelled());
        assert_eq!(handle.get_status().await.unwrap().session_count, 2);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_full_candidate_evicted_without_notifying_newcomer() {
        let (handle, _task, metrics) = spawn_coordinator();

        // Capacity 1: the first match fills the queue and it is never drained.
        let (_, busy) = register_with_capacity(&handle, "conn-busy", "busy", &["x"], 1).await;
        let first = register(&handle, "first", &["x"]).await;
        let mut spare = register(&handle, "spare", &["x"]).await;
        handle
            .unregister(first.connection_id.clone(), first.identity.clone())
            .await
            .unwrap();

        let mut newcomer = register(&handle, "new", &["x"]).await;

        assert_eq!(newcomer.rx.try_recv().unwrap(), matched("spare"));
        assert!(newcomer.rx.try_recv().is_err());
        assert_eq!(spare.rx.try_recv().unwrap(), matched("new"));
        assert!(busy.close_token.is_cancelled());
        assert_eq!(metrics.sessions_evicted(), 1);
        assert_eq!(handle.get_status().await.unwrap().session_count, 2);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_closed_newcomer_leaves_candidate_unnotified() {
        let (handle, _task, _metrics) = spawn_coordinator();

        let mut waiting = register(&handle, "waiting", &["x"]).await;

        let (tx, _rx) = mpsc::channel(4);
        let close_token = CancellationToken::new();
        close_token.cancel();
        let result = handle
            .register(
                "conn-late".to_string(),
                "late".to_string(),
                BTreeSet::from(["x".to_string()]),
                SessionOutbound::new(tx, close_token),
            )
            .await;

        assert_eq!(result.unwrap().partner, None);
        assert!(waiting.rx.try_recv().is_err());
        assert_eq!(
            handle.get_partner("waiting".to_string()).await.unwrap(),
            None
        );

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, 1);
        assert_eq!(status.unmatched_count, 1);

        handle.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_keeps_pairings_consistent() {
        let (handle, _task, _metrics) = spawn_coordinator();
        let tag = |n: usize| match n % 3 {
            0 => "red",
            1 => "green",
            _ => "blue",
        };

        let mut tasks = Vec::new();
        for i in 0..60 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let identity = format!("peer-{i}");
                let interests = [tag(i), tag(i / 3)];
                let (result, client) = register_with_capacity(
                    &handle,
                    &format!("conn-{identity}"),
                    &identity,
                    &interests,
                    64,
                )
                .await;
                result.unwrap();

                let leaves = i % 4 == 0;
                if leaves {
                    tokio::task::yield_now().await;
                    handle
                        .unregister(client.connection_id.clone(), client.identity.clone())
                        .await
                        .unwrap();
                }
                (client, leaves)
            }));
        }

        let mut stayed = Vec::new();
        for task in tasks {
            let (client, leaves) = task.await.unwrap();
            if leaves {
                assert_eq!(handle.get_partner(client.identity.clone()).await.unwrap(), None);
            } else {
                stayed.push(client);
            }
        }

        for client in &mut stayed {
            let partner = handle.get_partner(client.identity.clone()).await.unwrap();
            let mut last_event = None;
            while let Ok(event) = client.rx.try_recv() {
                last_event = Some(event);
            }

            if let Some(partner) = partner {
                assert_eq!(
                    handle.get_partner(partner.clone()).await.unwrap(),
                    Some(client.identity.clone())
                );
                assert_eq!(last_event, Some(matched(&partner)));
            }
        }

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.session_count, stayed.len());
        assert_eq!(
            status.unmatched_count + 2 * status.match_count,
            status.session_count
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_sessions() {
        let (handle, task, _metrics) = spawn_coordinator();

        let a = register(&handle, "A", &["x"]).await;
        let b = register(&handle, "B", &["x"]).await;
        let c = register(&handle, "C", &["z"]).await;

        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("coordinator should stop")
            .unwrap();

        assert!(handle.is_cancelled());
        assert!(a.close_token.is_cancelled());
        assert!(b.close_token.is_cancelled());
        assert!(c.close_token.is_cancelled());

        let result = handle.get_status().await;
        assert!(matches!(result, Err(RelayError::Internal(_))));
    }

    #[tokio::test]
    async fn test_cancel_token_propagates_to_children() {
        let (handle, task, _metrics) = spawn_coordinator();
        let child = handle.child_token();

        handle.cancel();

        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("coordinator should stop")
            .unwrap();
    }
}
