//! In-process transport backed by unbounded channels.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::Transport;
use crate::protocol::Envelope;

/// The agent's end of an in-process connection.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Envelope>,
    inbound: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

/// The broker's end: push commands in, observe what the agent sends.
pub struct ChannelPeer {
    pub to_agent: mpsc::UnboundedSender<Envelope>,
    pub from_agent: mpsc::UnboundedReceiver<Envelope>,
}

/// Create a connected transport/peer pair.
pub fn pair() -> (ChannelTransport, ChannelPeer) {
    let (to_agent, inbound) = mpsc::unbounded_channel();
    let (outbound, from_agent) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            outbound,
            inbound: Mutex::new(inbound),
        },
        ChannelPeer {
            to_agent,
            from_agent,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.outbound
            .send(envelope.clone())
            .map_err(|_| anyhow::anyhow!("Peer closed the connection"))
    }

    async fn recv(&self) -> Result<Option<Envelope>> {
        Ok(self.inbound.lock().await.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestType;

    #[tokio::test]
    async fn delivers_both_ways() {
        let (transport, mut peer) = pair();

        peer.to_agent.send(Envelope::command(RequestType::Start)).unwrap();
        let got = transport.recv().await.unwrap().unwrap();
        assert_eq!(got.request_type, RequestType::Start);

        transport.send(&Envelope::command(RequestType::Pause)).await.unwrap();
        let got = peer.from_agent.recv().await.unwrap();
        assert_eq!(got.request_type, RequestType::Pause);
    }

    #[tokio::test]
    async fn closed_peer_ends_stream() {
        let (transport, peer) = pair();
        drop(peer);

        assert!(transport.recv().await.unwrap().is_none());
        assert!(transport
            .send(&Envelope::command(RequestType::Start))
            .await
            .is_err());
    }
}
