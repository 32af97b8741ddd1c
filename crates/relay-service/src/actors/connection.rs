//! `ConnectionActor` - per-client connection actor.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one client connection
//! - Binds at most one identity, via the coordinator
//! - Forwards `message` frames to the coordinator for relaying
//! - Writes events routed by the coordinator back to the client
//!
//! # Lifecycle
//!
//! 1. Created when the WebSocket upgrade completes (`Connecting`)
//! 2. `Registered` after an accepted `register`, `Matched` once paired
//! 3. Runs until the client leaves, a read or write fails, the coordinator
//!    closes the session, or the server shuts down
//! 4. On exit, unregisters from the coordinator and sends a close frame

use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::transport::Frame;
use crate::wire::{decode_inbound, InboundEvent, OutboundEvent};

use super::coordinator::CoordinatorActorHandle;
use super::messages::ConnectionState;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::SessionOutbound;

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upper bound on the best-effort close frame write.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    /// Server-assigned connection ID.
    connection_id: String,
    /// Coordinator handle.
    coordinator: CoordinatorActorHandle,
    /// Sending half of the outbound queue, handed to the coordinator.
    outbound_tx: mpsc::Sender<OutboundEvent>,
    /// Events routed to this connection by the coordinator.
    receiver: mpsc::Receiver<OutboundEvent>,
    /// Closes this connection (child of the server shutdown token).
    cancel_token: CancellationToken,
    /// Identity bound by an accepted `register`.
    identity: Option<String>,
    state: ConnectionState,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Outbound queue monitor.
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Create an actor for a freshly accepted connection.
    ///
    /// `outbound_queue` bounds the events the coordinator may queue before
    /// the session is evicted as a slow consumer.
    #[must_use]
    pub fn new(
        coordinator: CoordinatorActorHandle,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        outbound_queue: usize,
    ) -> Self {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let (outbound_tx, receiver) = mpsc::channel(outbound_queue);

        Self {
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
            connection_id,
            coordinator,
            outbound_tx,
            receiver,
            cancel_token,
            identity: None,
            state: ConnectionState::Connecting,
            metrics,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Run the connection until it closes.
    #[instrument(
        skip_all,
        name = "relay.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    pub async fn run<R, W, E>(mut self, mut inbound: R, mut outbound: W)
    where
        R: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
        W: Sink<Frame> + Unpin,
        W::Error: Display,
    {
        self.metrics.connection_opened();
        prom::set_connections_active(self.metrics.connection_count());

        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        let reason = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break "cancelled";
                }

                event = self.receiver.recv() => {
                    // The actor holds a sender, so the queue never closes.
                    let Some(event) = event else { break "queue_closed" };

                    self.mailbox.observe(self.receiver.len() + 1);
                    if matches!(event, OutboundEvent::Matched { .. }) {
                        self.state = ConnectionState::Matched;
                    }
                    let result = self.write_event(&mut outbound, &event).await;
                    self.mailbox.record_processed();

                    if let Err(e) = result {
                        debug!(
                            target: "relay.actor.connection",
                            connection_id = %self.connection_id,
                            event = event.kind(),
                            error = %e,
                            "Write failed"
                        );
                        break "write_failed";
                    }
                }

                frame = inbound.next() => {
                    match frame {
                        Some(Ok(Frame::Text(raw))) => {
                            if let Some(reason) = self.handle_frame(raw, &mut outbound).await {
                                break reason;
                            }
                        }
                        Some(Ok(Frame::Close)) => break "client_closed",
                        None => break "stream_ended",
                        Some(Err(e)) => {
                            debug!(
                                target: "relay.actor.connection",
                                connection_id = %self.connection_id,
                                error = %e,
                                "Read failed"
                            );
                            break "read_failed";
                        }
                    }
                }
            }
        };

        self.teardown(&mut outbound, reason).await;

        self.metrics.connection_closed();
        prom::set_connections_active(self.metrics.connection_count());

        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            reason = reason,
            messages_written = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle one inbound text frame. Returns an exit reason to stop.
    async fn handle_frame<W>(&mut self, raw: String, outbound: &mut W) -> Option<&'static str>
    where
        W: Sink<Frame> + Unpin,
        W::Error: Display,
    {
        let event = match decode_inbound(&raw) {
            Ok(event) => event,
            Err(e) => {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    frame_len = raw.len(),
                    "Malformed frame"
                );
                return Some("malformed_frame");
            }
        };

        match event {
            InboundEvent::Register {
                identity,
                interests,
            } => self.handle_register(identity, interests, outbound).await,

            InboundEvent::Message { text } => {
                let Some(identity) = self.identity.clone() else {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        text_len = text.len(),
                        "Message before registration ignored"
                    );
                    return None;
                };

                // The coordinator forwards the frame as received.
                match self
                    .coordinator
                    .relay(self.connection_id.clone(), identity, raw)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(
                            target: "relay.actor.connection",
                            connection_id = %self.connection_id,
                            error = %e,
                            "Coordinator unavailable"
                        );
                        Some("coordinator_unavailable")
                    }
                }
            }

            InboundEvent::Unknown { kind } => {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    kind_len = kind.len(),
                    "Unknown message type ignored"
                );
                None
            }
        }
    }

    async fn handle_register<W>(
        &mut self,
        identity: String,
        interests: BTreeSet<String>,
        outbound: &mut W,
    ) -> Option<&'static str>
    where
        W: Sink<Frame> + Unpin,
        W::Error: Display,
    {
        let session_outbound =
            SessionOutbound::new(self.outbound_tx.clone(), self.cancel_token.clone());

        let result = self
            .coordinator
            .register(
                self.connection_id.clone(),
                identity.clone(),
                interests,
                session_outbound,
            )
            .await;

        match result {
            Ok(registered) => {
                self.state = if registered.partner.is_some() {
                    ConnectionState::Matched
                } else {
                    ConnectionState::Registered
                };
                self.identity = Some(identity);

                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    state = self.state.as_str(),
                    "Registered"
                );
                None
            }
            Err(RelayError::InvalidIdentity) => {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    "Register without identity ignored"
                );
                None
            }
            Err(RelayError::Internal(e)) => {
                warn!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Coordinator unavailable"
                );
                Some("coordinator_unavailable")
            }
            Err(e) => {
                let event = OutboundEvent::from_error(&e);
                match self.write_event(outbound, &event).await {
                    Ok(()) => None,
                    Err(_) => Some("write_failed"),
                }
            }
        }
    }

    /// Encode and write one event, giving up if the connection is closed
    /// meanwhile.
    async fn write_event<W>(&self, outbound: &mut W, event: &OutboundEvent) -> Result<(), RelayError>
    where
        W: Sink<Frame> + Unpin,
        W::Error: Display,
    {
        let text = event.encode()?;

        tokio::select! {
            () = self.cancel_token.cancelled() => {
                Err(RelayError::Transport("connection closed during write".to_string()))
            }
            result = outbound.send(Frame::Text(text)) => {
                result.map_err(|e| RelayError::Transport(e.to_string()))
            }
        }
    }

    /// Current state, asking the coordinator whether a partner is still
    /// attached. A partner that leaves does not notify this connection.
    async fn resolve_state(&self) -> ConnectionState {
        let Some(identity) = &self.identity else {
            return self.state;
        };
        match self.coordinator.get_partner(identity.clone()).await {
            Ok(Some(_)) => ConnectionState::Matched,
            Ok(None) => ConnectionState::Registered,
            Err(_) => self.state,
        }
    }

    /// Unregister and send a close frame (best-effort).
    async fn teardown<W>(&mut self, outbound: &mut W, reason: &str)
    where
        W: Sink<Frame> + Unpin,
        W::Error: Display,
    {
        let previous = self.resolve_state().await;
        self.state = ConnectionState::Disconnected;

        if let Some(identity) = self.identity.take() {
            if let Err(e) = self
                .coordinator
                .unregister(self.connection_id.clone(), identity)
                .await
            {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Unregister failed, coordinator already stopped"
                );
            }
        }

        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            reason = %reason,
            previous_state = previous.as_str(),
            "Closing connection"
        );

        let _ = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, async {
            let _ = outbound.send(Frame::Close).await;
            let _ = outbound.close().await;
        })
        .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::coordinator::CoordinatorActor;
    use futures::channel::mpsc as fmpsc;
    use serde_json::Value;
    use tokio::task::JoinHandle;

    struct TestPeer {
        inbound: fmpsc::UnboundedSender<Result<Frame, String>>,
        outbound: fmpsc::UnboundedReceiver<Frame>,
        cancel_token: CancellationToken,
        task: JoinHandle<()>,
    }

    impl TestPeer {
        fn send(&self, text: &str) {
            self.inbound
                .unbounded_send(Ok(Frame::Text(text.to_string())))
                .unwrap();
        }

        async fn recv(&mut self) -> Frame {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.next())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound closed")
        }

        async fn recv_json(&mut self) -> Value {
            match self.recv().await {
                Frame::Text(text) => serde_json::from_str(&text).unwrap(),
                Frame::Close => panic!("expected text frame, got close"),
            }
        }

        async fn finished(self) -> fmpsc::UnboundedReceiver<Frame> {
            tokio::time::timeout(Duration::from_secs(2), self.task)
                .await
                .expect("connection actor should stop")
                .unwrap();
            self.outbound
        }
    }

    fn spawn_coordinator(metrics: &Arc<ActorMetrics>) -> CoordinatorActorHandle {
        let (handle, _task) = CoordinatorActor::spawn(
            "relay-test".to_string(),
            64,
            CancellationToken::new(),
            Arc::clone(metrics),
        );
        handle
    }

    fn connect(coordinator: &CoordinatorActorHandle, metrics: &Arc<ActorMetrics>) -> TestPeer {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let cancel_token = coordinator.child_token();

        let actor = ConnectionActor::new(
            coordinator.clone(),
            cancel_token.clone(),
            Arc::clone(metrics),
            16,
        );
        let task = tokio::spawn(actor.run(in_rx, out_tx));

        TestPeer {
            inbound: in_tx,
            outbound: out_rx,
            cancel_token,
            task,
        }
    }

    async fn wait_for_sessions(coordinator: &CoordinatorActorHandle, expected: usize) {
        for _ in 0..100 {
            if coordinator.get_status().await.unwrap().session_count == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session count never reached {expected}");
    }

    #[tokio::test]
    async fn test_connection_id_is_uuid() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let actor = ConnectionActor::new(coordinator, CancellationToken::new(), metrics, 4);

        assert!(uuid::Uuid::parse_str(actor.connection_id()).is_ok());
    }

    #[tokio::test]
    async fn test_register_match_and_relay() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let mut alice = connect(&coordinator, &metrics);
        let mut bob = connect(&coordinator, &metrics);

        alice.send(r#"{"type":"register","id":"alice","interests":["rust"]}"#);
        wait_for_sessions(&coordinator, 1).await;
        bob.send(r#"{"type":"register","id":"bob","interests":["go","rust"]}"#);

        let to_alice = alice.recv_json().await;
        assert_eq!(to_alice["type"], "match");
        assert_eq!(to_alice["id"], "bob");
        let to_bob = bob.recv_json().await;
        assert_eq!(to_bob["type"], "match");
        assert_eq!(to_bob["id"], "alice");

        let frame = r#"{"type":"message","id":"whatever","text":"hello  bob"}"#;
        alice.send(frame);
        assert_eq!(bob.recv().await, Frame::Text(frame.to_string()));

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_message_before_register_and_unknown_type_ignored() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let mut peer = connect(&coordinator, &metrics);
        peer.send(r#"{"type":"message","text":"too early"}"#);
        peer.send(r#"{"type":"typing"}"#);
        peer.send(r#"{"type":"register","id":"solo","interests":[]}"#);

        wait_for_sessions(&coordinator, 1).await;
        assert!(!peer.task.is_finished());
        assert!(peer.outbound.try_next().is_err());

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_identity_gets_error_and_stays_open() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let first = connect(&coordinator, &metrics);
        first.send(r#"{"type":"register","id":"alice","interests":["x"]}"#);
        wait_for_sessions(&coordinator, 1).await;

        let mut second = connect(&coordinator, &metrics);
        second.send(r#"{"type":"register","id":"alice","interests":["x"]}"#);

        let error = second.recv_json().await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], 5);
        assert!(!error["message"].as_str().unwrap().contains("alice"));

        // Still usable: a fresh identity registers and matches the first.
        second.send(r#"{"type":"register","id":"alice-2","interests":["x"]}"#);
        let matched = second.recv_json().await;
        assert_eq!(matched["type"], "match");
        assert_eq!(matched["id"], "alice");

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_empty_identity_ignored_and_stays_open() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let mut peer = connect(&coordinator, &metrics);
        peer.send(r#"{"type":"register","interests":["x"]}"#);
        peer.send(r#"{"type":"register","id":"","interests":["x"]}"#);

        // Frames are handled in order, so the valid register lands last.
        peer.send(r#"{"type":"register","id":"late","interests":["y"]}"#);
        wait_for_sessions(&coordinator, 1).await;

        assert!(!peer.task.is_finished());
        assert!(peer.outbound.try_next().is_err());
        assert_eq!(
            coordinator.get_partner("late".to_string()).await.unwrap(),
            None
        );

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_state_returns_to_registered_after_partner_leaves() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let mut actor = ConnectionActor::new(
            coordinator.clone(),
            coordinator.child_token(),
            Arc::clone(&metrics),
            16,
        );
        assert_eq!(actor.resolve_state().await, ConnectionState::Connecting);

        let mut sink = futures::sink::drain::<Frame>();
        let exit = actor
            .handle_register("alice".to_string(), BTreeSet::from(["x".to_string()]), &mut sink)
            .await;
        assert_eq!(exit, None);
        assert_eq!(actor.resolve_state().await, ConnectionState::Registered);

        let mut bob = connect(&coordinator, &metrics);
        bob.send(r#"{"type":"register","id":"bob","interests":["x"]}"#);
        assert_eq!(bob.recv_json().await["id"], "alice");
        assert_eq!(actor.resolve_state().await, ConnectionState::Matched);

        bob.inbound.unbounded_send(Ok(Frame::Close)).unwrap();
        bob.finished().await;
        assert_eq!(actor.resolve_state().await, ConnectionState::Registered);

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_and_unregisters() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let peer = connect(&coordinator, &metrics);
        peer.send(r#"{"type":"register","id":"alice","interests":["x"]}"#);
        wait_for_sessions(&coordinator, 1).await;

        peer.send("{not json");
        let mut outbound = peer.finished().await;

        assert_eq!(outbound.next().await, Some(Frame::Close));
        assert_eq!(coordinator.get_status().await.unwrap().session_count, 0);
        assert_eq!(metrics.connection_count(), 0);

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_unmatches_partner() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let mut alice = connect(&coordinator, &metrics);
        let mut bob = connect(&coordinator, &metrics);
        alice.send(r#"{"type":"register","id":"alice","interests":["x"]}"#);
        wait_for_sessions(&coordinator, 1).await;
        bob.send(r#"{"type":"register","id":"bob","interests":["x"]}"#);
        alice.recv_json().await;
        bob.recv_json().await;

        alice.inbound.unbounded_send(Ok(Frame::Close)).unwrap();
        alice.finished().await;

        assert_eq!(
            coordinator.get_partner("bob".to_string()).await.unwrap(),
            None
        );
        assert_eq!(coordinator.get_status().await.unwrap().session_count, 1);

        // Bob's messages now go nowhere and bob stays connected.
        bob.send(r#"{"type":"message","text":"still there?"}"#);
        coordinator.get_status().await.unwrap();
        assert!(!bob.task.is_finished());
        assert!(bob.outbound.try_next().is_err());

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let peer = connect(&coordinator, &metrics);
        peer.inbound
            .unbounded_send(Err("connection reset".to_string()))
            .unwrap();

        let mut outbound = peer.finished().await;
        assert_eq!(outbound.next().await, Some(Frame::Close));

        coordinator.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_token_closes_connection() {
        let metrics = ActorMetrics::new();
        let coordinator = spawn_coordinator(&metrics);

        let peer = connect(&coordinator, &metrics);
        peer.send(r#"{"type":"register","id":"alice","interests":["x"]}"#);
        wait_for_sessions(&coordinator, 1).await;

        peer.cancel_token.cancel();
        let mut outbound = peer.finished().await;

        assert_eq!(outbound.next().await, Some(Frame::Close));
        assert_eq!(coordinator.get_status().await.unwrap().session_count, 0);

        coordinator.cancel();
    }
}
