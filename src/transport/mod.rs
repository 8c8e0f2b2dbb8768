//! Transport layer for agent ↔ broker communication.
//!
//! Provides the `Transport` trait the agent runtime works against.
//! `WebSocketTransport` is the production implementation; `ChannelTransport`
//! is an in-process pair for driving an agent without a network.

pub mod channel;
pub mod websocket;

pub use channel::{ChannelPeer, ChannelTransport};
pub use websocket::WebSocketTransport;

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::Envelope;

/// Abstraction over an ordered, reliable, message-framed connection that
/// carries one [`Envelope`] per message.
///
/// Send and receive are guarded independently, so the status reporter can
/// write while the inbound loop is parked in `recv`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one envelope to the peer.
    async fn send(&self, envelope: &Envelope) -> Result<()>;

    /// Wait for the next well-formed envelope.
    ///
    /// Messages that fail to decode are logged and skipped. Returns
    /// `Ok(None)` once the peer has closed the connection.
    async fn recv(&self) -> Result<Option<Envelope>>;
}
