//! print-relay library
//!
//! Remote control of serial-attached 3D printers:
//! - Serial line driver speaking the firmware's `ok` handshake
//! - Agent runtime that owns one printer and one broker connection
//! - Session broker that routes web commands to connected agents
//! - HTTP/WebSocket surface and G-code file store for the broker

pub mod agent;
pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod serial;
pub mod store;
pub mod transport;
