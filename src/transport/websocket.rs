//! WebSocket client transport used by the agent to reach the broker.
//!
//! The socket is split once; each half sits behind its own mutex so a send
//! never waits on a pending receive.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::Envelope;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Agent-side connection to the broker's WebSocket endpoint.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<Socket, Message>>,
    stream: Mutex<SplitStream<Socket>>,
}

impl WebSocketTransport {
    /// Dial `url` (e.g. `ws://localhost:8080/api/websocket`), giving up
    /// after `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        debug!(url = %url, "Dialing broker");
        let (socket, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| anyhow::anyhow!("Broker did not answer within {connect_timeout:?}"))?
            .with_context(|| format!("Failed to connect to broker at {url}"))?;

        let (sink, stream) = socket.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let json = envelope.to_json().context("Failed to serialize envelope")?;
        self.sink
            .lock()
            .await
            .send(Message::text(json))
            .await
            .context("Failed to send envelope to broker")
    }

    async fn recv(&self) -> Result<Option<Envelope>> {
        let mut stream = self.stream.lock().await;
        loop {
            let msg = match stream.next().await {
                None => return Ok(None),
                Some(msg) => msg.context("Failed to read from broker")?,
            };

            let decoded = match msg {
                Message::Text(text) => Envelope::from_json(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice(&bytes),
                Message::Close(_) => return Ok(None),
                _ => continue,
            };

            match decoded {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => warn!(error = %e, "Dropping malformed envelope"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::protocol::RequestType;

    /// Accept one connection, send `frames`, then close.
    async fn broker_sending(frames: Vec<Message>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(tcp).await.unwrap();
            for frame in frames {
                socket.send(frame).await.unwrap();
            }
            socket.close(None).await.unwrap();
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn skips_malformed_frames() {
        let start = Envelope::command(RequestType::Start).to_json().unwrap();
        let url = broker_sending(vec![
            Message::text("garbage"),
            Message::binary(b"{\"request_id\": 1}".to_vec()),
            Message::text(start),
        ])
        .await;

        let transport = WebSocketTransport::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();
        let got = transport.recv().await.unwrap().unwrap();
        assert_eq!(got.request_type, RequestType::Start);
        assert!(transport.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refused_dial_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WebSocketTransport::connect(&format!("ws://{addr}"), Duration::from_secs(5)).await;
        assert!(result.is_err());
    }
}
