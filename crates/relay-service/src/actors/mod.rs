//! Actor model implementation for the relay.
//!
//! ```text
//! CoordinatorActor (singleton per relay instance)
//! ├── owns the SessionRegistry and MatchTable
//! └── receives commands from N ConnectionActors
//!     └── ConnectionActor (one per WebSocket connection)
//!         └── drains its bounded outbound queue to the client
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner**: only the coordinator mutates sessions and pairings
//! - **Never block on clients**: the coordinator uses `try_send` into each
//!   session's outbound queue; overflow disconnects that session
//! - **Connection-scoped commands**: every command carries the sender's
//!   connection ID, so stale commands from a replaced connection are no-ops
//! - **CancellationToken propagation**: coordinator root token -> server
//!   shutdown token -> connection tokens
//!
//! # Modules
//!
//! - [`coordinator`] - `CoordinatorActor` singleton: registration, matching, relay
//! - [`connection`] - `ConnectionActor` per client connection
//! - [`match_table`] - Symmetric partner table
//! - [`session`] - Sessions, the registry and outbound delivery handles
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod coordinator;
pub mod match_table;
pub mod messages;
pub mod metrics;
pub mod session;

// Re-export primary types
pub use connection::ConnectionActor;
pub use coordinator::{CoordinatorActor, CoordinatorActorHandle};
pub use match_table::MatchTable;
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
pub use session::{DeliveryFailure, Session, SessionOutbound, SessionRegistry};
