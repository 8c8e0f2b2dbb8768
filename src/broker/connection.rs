//! Per-connection tasks for one agent WebSocket.
//!
//! Two halves run for the connection's lifetime:
//! - the reader decodes inbound envelopes and publishes `AGENT_STATUS`
//!   reports to the session's status slot
//! - the writer drains the session's command queue onto the socket, each
//!   write bounded by a deadline
//!
//! Whichever half stops first ends the connection, and the session is
//! removed from the table on the way out. Commands still queued are dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{Session, SessionBroker};
use crate::protocol::{AgentInfo, Envelope, MessageType, RequestType};

/// Serve one agent connection until it closes or fails.
pub async fn serve_agent(broker: Arc<SessionBroker>, socket: WebSocket, write_timeout: Duration) {
    let (sink, stream) = socket.split();
    run_session(&broker, sink, stream, write_timeout).await;
}

/// Register a session for one connection's two halves and serve it until
/// either half stops. The session is removed before this returns.
async fn run_session<Si, St, E>(
    broker: &SessionBroker,
    sink: Si,
    stream: St,
    write_timeout: Duration,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: std::error::Error + Send + Sync + 'static,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let Session {
        id,
        to_agent,
        from_agent,
    } = broker.register().await;
    let span = info_span!("session", id = %id);

    async {
        let outcome = tokio::select! {
            res = read_status(stream, &from_agent) => res,
            res = write_commands(sink, to_agent, write_timeout) => res,
        };
        match outcome {
            Ok(()) => info!("Agent disconnected"),
            Err(e) => warn!(error = %format_args!("{e:#}"), "Agent connection failed"),
        }
    }
    .instrument(span)
    .await;

    broker.unregister(&id).await;
}

async fn read_status<St, E>(mut stream: St, status: &watch::Sender<AgentInfo>) -> Result<()>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    while let Some(msg) = stream.next().await {
        match msg.context("Failed to read from agent")? {
            Message::Text(text) => absorb(text.as_str(), status),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => absorb(text, status),
                Err(e) => warn!(error = %e, "Dropping non-UTF-8 frame"),
            },
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Ok(())
}

/// Apply one inbound message. Bad messages are dropped, never fatal.
fn absorb(text: &str, status: &watch::Sender<AgentInfo>) {
    let envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Dropping malformed envelope");
            return;
        }
    };

    if envelope.message_type != MessageType::Info
        || envelope.request_type != RequestType::AgentStatus
    {
        debug!(request_type = ?envelope.request_type, "Ignoring non-status message");
        return;
    }

    match envelope.agent_info() {
        Ok(info) => {
            status.send_replace(info);
        }
        Err(e) => warn!(error = %e, "Dropping status report with bad payload"),
    }
}

async fn write_commands<Si>(
    mut sink: Si,
    mut queue: mpsc::Receiver<Envelope>,
    write_timeout: Duration,
) -> Result<()>
where
    Si: Sink<Message> + Unpin,
    Si::Error: std::error::Error + Send + Sync + 'static,
{
    while let Some(envelope) = queue.recv().await {
        let json = envelope.to_json().context("Failed to serialize envelope")?;
        tokio::time::timeout(write_timeout, sink.send(Message::text(json)))
            .await
            .map_err(|_| anyhow::anyhow!("Write to agent timed out after {write_timeout:?}"))?
            .context("Failed to write to agent")?;
        debug!(request_id = %envelope.request_id, "Command forwarded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;

    use futures_util::sink;
    use futures_util::stream::{self, BoxStream};

    use super::*;
    use crate::protocol::AgentStatus;

    type TestSink = Pin<Box<dyn Sink<Message, Error = io::Error> + Send>>;

    /// An agent that never reads, so every write stalls.
    fn stalled_sink() -> TestSink {
        Box::pin(sink::unfold((), |(), _msg: Message| async {
            std::future::pending::<()>().await;
            Ok::<_, io::Error>(())
        }))
    }

    /// An agent whose connection is already broken for writing.
    fn broken_sink() -> TestSink {
        Box::pin(sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(io::Error::from(io::ErrorKind::BrokenPipe))
        }))
    }

    /// An agent that stays connected but never sends anything.
    fn silent_stream() -> BoxStream<'static, Result<Message, io::Error>> {
        stream::pending().boxed()
    }

    /// Serve a session with `sink`, route one command to it, and return once
    /// the handler has exited.
    async fn serve_until_write_fails(sink: TestSink, write_timeout: Duration) -> Arc<SessionBroker> {
        let broker = Arc::new(SessionBroker::new(Duration::from_secs(1), 4));
        let handler = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                run_session(&broker, sink, silent_stream(), write_timeout).await;
            })
        };

        let id = loop {
            if let Some(id) = broker.list_sessions().await.pop() {
                break id;
            }
            tokio::task::yield_now().await;
        };
        broker
            .route_command(&id, Envelope::command(RequestType::AutoHome))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .expect("handler outlived its failed write")
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn write_timeout_ends_the_session() {
        let broker = serve_until_write_fails(stalled_sink(), Duration::from_millis(20)).await;
        assert!(broker.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn write_error_ends_the_session() {
        let broker = serve_until_write_fails(broken_sink(), Duration::from_secs(5)).await;
        assert!(broker.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn write_commands_reports_timeout() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(Envelope::command(RequestType::Start)).await.unwrap();

        let err = write_commands(stalled_sink(), rx, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn absorb_updates_status_from_info_report() {
        let (tx, rx) = watch::channel(AgentInfo::default());
        let report = Envelope::status(AgentInfo {
            busy: true,
            status: AgentStatus::Printing,
        })
        .unwrap();

        absorb(&report.to_json().unwrap(), &tx);
        assert_eq!(
            *rx.borrow(),
            AgentInfo {
                busy: true,
                status: AgentStatus::Printing
            }
        );
    }

    #[test]
    fn absorb_ignores_garbage_and_commands() {
        let (tx, rx) = watch::channel(AgentInfo::default());

        absorb("{not json", &tx);
        absorb(&Envelope::command(RequestType::Start).to_json().unwrap(), &tx);

        let mut bad = Envelope::status(AgentInfo::default()).unwrap();
        bad.payload = b"[1,2,3]".to_vec();
        absorb(&bad.to_json().unwrap(), &tx);

        assert_eq!(*rx.borrow(), AgentInfo::default());
        assert!(!rx.has_changed().unwrap());
    }
}
