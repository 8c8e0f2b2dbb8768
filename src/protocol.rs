//! Agent ↔ broker message types.
//!
//! One JSON-encoded [`Envelope`] per WebSocket text frame, in both directions.
//! The payload is an opaque byte blob carried as base64; it is only
//! meaningful for `LOAD` commands ([`LoadFile`]) and `AGENT_STATUS` reports
//! ([`AgentInfo`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether the recipient is expected to act on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Command,
    Info,
}

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    AgentStatus,
    LevelBed,
    AutoHome,
    UnlockPrinter,
    Load,
    Start,
    Pause,
    Cancel,
}

impl RequestType {
    /// Status reports travel as `INFO`, everything else as `COMMAND`.
    pub const fn message_type(self) -> MessageType {
        match self {
            Self::AgentStatus => MessageType::Info,
            _ => MessageType::Command,
        }
    }
}

/// Printer state as reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    Unknown,
    Idle,
    Ready,
    Printing,
}

/// Snapshot of an agent, cached by the broker for polling clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// No print commands accepted while set.
    pub busy: bool,
    pub status: AgentStatus,
}

/// Payload of a `LOAD` command: the file to fetch before printing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFile {
    pub id: String,
    pub url: String,
}

/// One message exchanged between agent and broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Informational only, uniqueness is not enforced.
    pub request_id: String,
    pub message_type: MessageType,
    pub request_type: RequestType,
    #[serde(default, with = "payload_base64")]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// A payload-free command. `LOAD` and `AGENT_STATUS` have their own
    /// constructors because they carry data.
    pub fn command(request_type: RequestType) -> Self {
        Self {
            request_id: new_request_id(),
            message_type: request_type.message_type(),
            request_type,
            payload: Vec::new(),
        }
    }

    /// A `LOAD` command pointing the agent at a downloadable file.
    pub fn load(file: &LoadFile) -> serde_json::Result<Self> {
        Ok(Self {
            payload: serde_json::to_vec(file)?,
            ..Self::command(RequestType::Load)
        })
    }

    /// An unsolicited `AGENT_STATUS` report.
    pub fn status(info: AgentInfo) -> serde_json::Result<Self> {
        Ok(Self {
            payload: serde_json::to_vec(&info)?,
            ..Self::command(RequestType::AgentStatus)
        })
    }

    /// Decode the payload of a `LOAD` command.
    pub fn load_file(&self) -> serde_json::Result<LoadFile> {
        serde_json::from_slice(&self.payload)
    }

    /// Decode the payload of an `AGENT_STATUS` report.
    pub fn agent_info(&self) -> serde_json::Result<AgentInfo> {
        serde_json::from_slice(&self.payload)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Byte payloads are base64 strings on the wire; `null` and a missing field
/// both decode to an empty payload.
mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if bytes.is_empty() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&STANDARD.encode(bytes))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
