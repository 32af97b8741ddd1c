//! # Relay Test Utilities
//!
//! Shared test utilities for the relay service.
//!
//! This crate provides:
//! - Server test harness (`TestRelayServer` for E2E tests)
//! - WebSocket client (`TestClient`) speaking the relay wire protocol
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestRelayServer::spawn().await?;
//!     let mut alice = server.connect().await?;
//!     let mut bob = server.connect().await?;
//!
//!     alice.register("alice", &["rust"]).await?;
//!     bob.register("bob", &["rust"]).await?;
//!
//!     assert_eq!(alice.expect_match().await?, "bob");
//!     Ok(())
//! }
//! ```

pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use server_harness::*;
pub use ws_client::*;
