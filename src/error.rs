//! Error types for the library surface.

use thiserror::Error;

/// Failure while streaming a script to the printer.
///
/// Any of these aborts the current script; nothing is retried or rolled back.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial device closed the stream")]
    Closed,
}

/// Failure while handling one command on the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Another print operation holds the printer. Expected, not exceptional.
    #[error("agent is busy, try again later")]
    Busy,

    #[error("no file loaded")]
    NothingLoaded,

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("download failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Failure to hand a command to a session's writer task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session went away or did not drain its queue in time.
    #[error("command not delivered to session {0}")]
    NotDelivered(String),
}

/// Failure looking something up in the file store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),
}
