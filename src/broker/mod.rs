//! Session broker: the registry of live agent connections.
//!
//! Every accepted agent connection gets a fresh random session id, a bounded
//! outbound command queue and a cached status slot. The table is mutated by
//! connection accept/teardown and read by any number of concurrent request
//! handlers; all access goes through one lock, and a lookup clones what it
//! needs inside the critical section so a concurrent teardown can never
//! leave a caller holding a dangling session.
//!
//! Status is cached, not queued: the latest `AGENT_STATUS` report wins.

pub mod connection;

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RouteError;
use crate::protocol::{AgentInfo, Envelope};

pub type SessionId = String;

/// The connection handler's half of a session.
pub struct Session {
    pub id: SessionId,
    /// Commands waiting to be written to the agent.
    pub to_agent: mpsc::Receiver<Envelope>,
    /// Where the reader task publishes the agent's latest status.
    pub from_agent: watch::Sender<AgentInfo>,
}

/// The table's half of a session.
struct SessionEntry {
    to_agent: mpsc::Sender<Envelope>,
    info: watch::Receiver<AgentInfo>,
}

pub struct SessionBroker {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    route_timeout: Duration,
    channel_capacity: usize,
}

impl SessionBroker {
    /// `route_timeout` bounds how long [`route_command`](Self::route_command)
    /// waits for room on a full queue; `channel_capacity` is the per-session
    /// queue size.
    pub fn new(route_timeout: Duration, channel_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            route_timeout,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Create and register a session for a newly accepted connection.
    pub async fn register(&self) -> Session {
        let id = Uuid::new_v4().to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel(self.channel_capacity);
        let (info_tx, info_rx) = watch::channel(AgentInfo::default());

        self.sessions.write().await.insert(
            id.clone(),
            SessionEntry {
                to_agent: cmd_tx,
                info: info_rx,
            },
        );
        info!(session = %id, "Agent session registered");

        Session {
            id,
            to_agent: cmd_rx,
            from_agent: info_tx,
        }
    }

    /// Remove a session. Returns whether it was present.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!(session = %id, "Agent session removed");
        }
        removed
    }

    /// Queue `envelope` for the session's writer task.
    ///
    /// Success means accepted for delivery, not executed. If the queue stays
    /// full for `route_timeout`, or the session is torn down before the
    /// command is taken, the command is dropped and `NotDelivered` returned.
    pub async fn route_command(&self, id: &str, envelope: Envelope) -> Result<(), RouteError> {
        let sender = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(id)
                .ok_or_else(|| RouteError::NotFound(id.to_string()))?;
            entry.to_agent.clone()
        };

        debug!(session = %id, request_type = ?envelope.request_type, "Routing command");
        sender
            .send_timeout(envelope, self.route_timeout)
            .await
            .map_err(|_| RouteError::NotDelivered(id.to_string()))
    }

    /// Last status reported by the session's agent. Never waits on the agent.
    pub async fn get_status(&self, id: &str) -> Result<AgentInfo, RouteError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|entry| *entry.info.borrow())
            .ok_or_else(|| RouteError::NotFound(id.to_string()))
    }

    /// Snapshot of live session ids, in no particular order.
    pub async fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
