//! WebSocket test client
//!
//! Provides `TestClient`, a thin wrapper over `tokio-tungstenite` that speaks
//! the relay's JSON protocol and fails fast instead of hanging.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long `recv_*` waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// What the server did with the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Text(String),
    Closed,
}

/// A WebSocket client connected to a test relay.
pub struct TestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:1234/ws`).
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect to {} failed: {}", url, e))?;
        Ok(Self { stream })
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send failed: {}", e))
    }

    /// Send a raw binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.stream
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send failed: {}", e))
    }

    /// Send a `register` command.
    pub async fn register(&mut self, identity: &str, interests: &[&str]) -> Result<(), anyhow::Error> {
        let frame = json!({
            "type": "register",
            "id": identity,
            "interests": interests,
        });
        self.send_text(&frame.to_string()).await
    }

    /// Send a `message` command and return the exact frame text sent.
    pub async fn send_message(&mut self, text: &str) -> Result<String, anyhow::Error> {
        let frame = json!({
            "type": "message",
            "text": text,
        })
        .to_string();
        self.send_text(&frame).await?;
        Ok(frame)
    }

    /// Next text frame or close, skipping control frames.
    pub async fn recv_event(&mut self) -> Result<ClientEvent, anyhow::Error> {
        tokio::time::timeout(RECV_TIMEOUT, self.next_event())
            .await
            .map_err(|_| anyhow::anyhow!("Timed out waiting for a frame"))?
    }

    async fn next_event(&mut self) -> Result<ClientEvent, anyhow::Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(ClientEvent::Text(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(ClientEvent::Text(String::from_utf8(bytes)?));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(ClientEvent::Closed),
                // A reset after the server closes counts as closed
                Some(Err(_)) => return Ok(ClientEvent::Closed),
            }
        }
    }

    /// Next text frame; fails if the connection closed instead.
    pub async fn recv_text(&mut self) -> Result<String, anyhow::Error> {
        match self.recv_event().await? {
            ClientEvent::Text(text) => Ok(text),
            ClientEvent::Closed => anyhow::bail!("Connection closed while waiting for a frame"),
        }
    }

    /// Next text frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Result<Value, anyhow::Error> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("Invalid JSON {:?}: {}", text, e))
    }

    /// Expect a `match` event and return the partner identity it carries.
    pub async fn expect_match(&mut self) -> Result<String, anyhow::Error> {
        let frame = self.recv_json().await?;
        if frame["type"] != "match" {
            anyhow::bail!("Expected match event, got {}", frame);
        }
        frame["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("match event without id: {}", frame))
    }

    /// Expect an `error` event and return its code.
    pub async fn expect_error(&mut self) -> Result<i64, anyhow::Error> {
        let frame = self.recv_json().await?;
        if frame["type"] != "error" {
            anyhow::bail!("Expected error event, got {}", frame);
        }
        frame["code"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("error event without code: {}", frame))
    }

    /// Expect the server to close the connection.
    pub async fn expect_closed(&mut self) -> Result<(), anyhow::Error> {
        match self.recv_event().await? {
            ClientEvent::Closed => Ok(()),
            ClientEvent::Text(text) => anyhow::bail!("Expected close, got frame {:?}", text),
        }
    }

    /// Expect nothing to arrive for `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), anyhow::Error> {
        match tokio::time::timeout(window, self.next_event()).await {
            Err(_) => Ok(()),
            Ok(event) => anyhow::bail!("Expected silence, got {:?}", event?),
        }
    }

    /// Close the connection with a normal close frame.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.stream
            .close(None)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket close failed: {}", e))
    }
}
