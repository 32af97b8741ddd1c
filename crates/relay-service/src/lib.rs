//! Interest Relay Service Library
//!
//! A WebSocket matchmaking relay:
//!
//! - Clients register an identity and a set of interest tags
//! - Each new registrant is paired with the earliest waiting client that
//!   shares at least one tag (first-fit)
//! - Text messages from a matched client are forwarded verbatim to its
//!   partner
//! - Disconnects unpair both sides; the survivor waits for a new registrant
//!
//! # Architecture
//!
//! ```text
//! CoordinatorActor (singleton, owns registry + match table)
//! └── ConnectionActor (one per WebSocket connection)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Coordinator and connection actors
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`routes`] - Axum router and application state
//! - [`transport`] - Frame abstraction and the WebSocket adapter
//! - [`wire`] - JSON wire protocol

pub mod actors;
pub mod config;
pub mod errors;
pub mod observability;
pub mod routes;
pub mod transport;
pub mod wire;
