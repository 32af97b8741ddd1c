//! axum WebSocket adapter.
//!
//! Text frames pass through unchanged. Binary frames are accepted when they
//! are valid UTF-8. Ping/pong is answered by axum and never surfaces here.

use super::Frame;
use crate::errors::RelayError;

use axum::extract::ws::{Message, WebSocket};
use futures::future::{ready, Ready};
use futures::{Sink, SinkExt, Stream, StreamExt};

/// Split an upgraded socket into a frame sink and a frame stream.
pub fn into_frames(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = RelayError> + Unpin,
    impl Stream<Item = Result<Frame, RelayError>> + Unpin,
) {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| RelayError::Transport(e.to_string()))
        .with(|frame: Frame| -> Ready<Result<Message, RelayError>> {
            ready(Ok(to_message(frame)))
        });

    let stream = stream.filter_map(|msg| ready(from_message(msg)));

    (sink, stream)
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Close => Message::Close(None),
    }
}

/// `None` for control frames the actor never sees.
fn from_message(msg: Result<Message, axum::Error>) -> Option<Result<Frame, RelayError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Binary(bytes)) => Some(
            String::from_utf8(bytes)
                .map(Frame::Text)
                .map_err(|_| RelayError::Decode("binary frame is not valid UTF-8".to_string())),
        ),
        Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(e) => Some(Err(RelayError::Transport(e.to_string()))),
    }
}
