//! Client transport.
//!
//! Connection actors speak [`Frame`]s over any `Stream` + `Sink` pair. The
//! WebSocket adapter lives in [`websocket`]; tests drive actors over plain
//! channels.

pub mod websocket;

/// A transport-level frame, as seen by a connection actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete text message.
    Text(String),
    /// The peer closed, or we are closing.
    Close,
}
