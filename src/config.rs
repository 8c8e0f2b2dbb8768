//! Configuration for the broker and agent roles.
//!
//! An optional JSON file supplies `broker` and `agent` sections in plain
//! seconds and integers; command-line flags (each with an environment
//! variable fallback) override individual values afterwards.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,

    #[serde(default)]
    pub agent: AgentSection,
}

impl ConfigFile {
    /// Read and parse a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid configuration JSON")
    }
}

/// Broker settings as read from the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub listen: String,
    /// Base URL agents use to download uploaded files.
    pub public_url: String,
    pub write_timeout_seconds: u64,
    pub route_timeout_seconds: u64,
    pub channel_capacity: usize,
    pub allow_origins: Vec<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            public_url: "http://localhost:8080".into(),
            write_timeout_seconds: 100,
            route_timeout_seconds: 5,
            channel_capacity: 16,
            allow_origins: vec!["*".into()],
        }
    }
}

/// Agent settings as read from the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub serial_device: String,
    pub baud_rate: u32,
    pub broker_url: String,
    pub status_interval_ms: u64,
    pub connect_timeout_seconds: u64,
    pub download_timeout_seconds: u64,
    pub retry_delay_seconds: u64,
    pub max_attempts: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            serial_device: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            broker_url: "ws://localhost:8080/api/websocket".into(),
            status_interval_ms: 1000,
            connect_timeout_seconds: 10,
            download_timeout_seconds: 60,
            retry_delay_seconds: 5,
            max_attempts: 10,
        }
    }
}

/// Runtime broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen: SocketAddr,
    pub public_url: String,
    /// Deadline for one outbound write to an agent.
    pub write_timeout: Duration,
    /// How long a command request may wait for room on a session's queue.
    pub route_timeout: Duration,
    /// Commands buffered per session before senders start waiting.
    pub channel_capacity: usize,
    pub allow_origins: Vec<String>,
}

impl BrokerConfig {
    pub fn from_section(section: &BrokerSection) -> Result<Self> {
        let listen = section
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", section.listen))?;
        anyhow::ensure!(section.channel_capacity > 0, "channel_capacity must be > 0");

        Ok(Self {
            listen,
            public_url: section.public_url.trim_end_matches('/').to_string(),
            write_timeout: Duration::from_secs(section.write_timeout_seconds),
            route_timeout: Duration::from_secs(section.route_timeout_seconds),
            channel_capacity: section.channel_capacity,
            allow_origins: section.allow_origins.clone(),
        })
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_url: "http://localhost:8080".into(),
            write_timeout: Duration::from_secs(100),
            route_timeout: Duration::from_secs(5),
            channel_capacity: 16,
            allow_origins: vec!["*".into()],
        }
    }
}

/// Runtime agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub serial_device: String,
    pub baud_rate: u32,
    pub broker_url: String,
    /// Cadence of unsolicited status reports.
    pub status_interval: Duration,
    pub connect_timeout: Duration,
    pub download_timeout: Duration,
    /// Supervisor pause between attempts.
    pub retry_delay: Duration,
    /// Consecutive failed attempts before the supervisor gives up.
    pub max_attempts: u32,
}

impl AgentConfig {
    pub fn from_section(section: &AgentSection) -> Self {
        Self {
            serial_device: section.serial_device.clone(),
            baud_rate: section.baud_rate,
            broker_url: section.broker_url.clone(),
            status_interval: Duration::from_millis(section.status_interval_ms),
            connect_timeout: Duration::from_secs(section.connect_timeout_seconds),
            download_timeout: Duration::from_secs(section.download_timeout_seconds),
            retry_delay: Duration::from_secs(section.retry_delay_seconds),
            max_attempts: section.max_attempts,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_section(&AgentSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let file = ConfigFile::from_json("{}").unwrap();
        let broker = BrokerConfig::from_section(&file.broker).unwrap();
        assert_eq!(broker.listen, BrokerConfig::default().listen);
        assert_eq!(broker.write_timeout, Duration::from_secs(100));
        assert_eq!(broker.channel_capacity, 16);

        let agent = AgentConfig::from_section(&file.agent);
        assert_eq!(agent.baud_rate, 115_200);
        assert_eq!(agent.status_interval, Duration::from_secs(1));
        assert_eq!(agent.broker_url, "ws://localhost:8080/api/websocket");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let json = r#"{
            "broker": { "listen": "127.0.0.1:9000", "public_url": "http://printers.local/" },
            "agent": { "serial_device": "/dev/ttyACM0", "max_attempts": 3 }
        }"#;
        let file = ConfigFile::from_json(json).unwrap();

        let broker = BrokerConfig::from_section(&file.broker).unwrap();
        assert_eq!(broker.listen.port(), 9000);
        assert_eq!(broker.public_url, "http://printers.local");
        assert_eq!(broker.route_timeout, Duration::from_secs(5));

        let agent = AgentConfig::from_section(&file.agent);
        assert_eq!(agent.serial_device, "/dev/ttyACM0");
        assert_eq!(agent.max_attempts, 3);
        assert_eq!(agent.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let section = BrokerSection {
            listen: "not an address".into(),
            ..BrokerSection::default()
        };
        assert!(BrokerConfig::from_section(&section).is_err());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let section = BrokerSection {
            channel_capacity: 0,
            ..BrokerSection::default()
        };
        assert!(BrokerConfig::from_section(&section).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"agent": {"baud_rate": 250000}}"#).unwrap();

        let file = ConfigFile::load(&path).unwrap();
        assert_eq!(file.agent.baud_rate, 250_000);
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigFile::load(&dir.path().join("nope.json")).is_err());
    }
}
