//! Keeps one agent runtime alive across serial and broker failures.
//!
//! Each attempt opens the serial device (once; the agent and its loaded
//! file survive broker reconnects), dials the broker and serves the
//! connection. A failed open, a failed dial and a connection that ends in an
//! error all count as failed attempts and are retried after a fixed delay.
//! Only a connection the broker closed cleanly resets the count, so a broker
//! that accepts and then immediately errors still exhausts the budget.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::Agent;
use crate::config::AgentConfig;
use crate::serial::{port, BoxedSerial};
use crate::transport::{Transport, WebSocketTransport};

/// Source of the two connections an agent needs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open_serial(&self) -> Result<BoxedSerial>;
    async fn dial(&self) -> Result<Arc<dyn Transport>>;
}

/// Real serial device plus WebSocket broker.
pub struct DeviceConnector {
    config: AgentConfig,
}

impl DeviceConnector {
    pub const fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for DeviceConnector {
    async fn open_serial(&self) -> Result<BoxedSerial> {
        let stream = port::open(&self.config.serial_device, self.config.baud_rate)?;
        Ok(Box::new(stream))
    }

    async fn dial(&self) -> Result<Arc<dyn Transport>> {
        let transport =
            WebSocketTransport::connect(&self.config.broker_url, self.config.connect_timeout)
                .await?;
        Ok(Arc::new(transport))
    }
}

pub struct Supervisor<C> {
    connector: C,
    config: AgentConfig,
}

impl<C: Connector> Supervisor<C> {
    pub const fn new(connector: C, config: AgentConfig) -> Self {
        Self { connector, config }
    }

    /// Run until the retry budget is exhausted. Only ever returns an error.
    pub async fn run(&self) -> Result<()> {
        let mut agent: Option<Arc<Agent>> = None;
        let mut failures = 0u32;

        loop {
            let outcome = match self.connect(&mut agent).await {
                Ok((agent, transport)) => agent.run(transport).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    failures = 0;
                    info!("Broker connection closed, reconnecting");
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.config.max_attempts {
                        return Err(e).with_context(|| {
                            format!("Agent gave up after {failures} attempts")
                        });
                    }
                    warn!(
                        error = %format_args!("{e:#}"),
                        attempt = failures,
                        max_attempts = self.config.max_attempts,
                        "Agent connection failed, retrying"
                    );
                }
            }

            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    async fn connect(
        &self,
        agent: &mut Option<Arc<Agent>>,
    ) -> Result<(Arc<Agent>, Arc<dyn Transport>)> {
        let current = match agent {
            Some(existing) => Arc::clone(existing),
            None => {
                let serial = self
                    .connector
                    .open_serial()
                    .await
                    .context("Failed to open serial device")?;
                let created = Arc::new(Agent::new(serial, self.config.clone())?);
                *agent = Some(Arc::clone(&created));
                created
            }
        };

        let transport = self
            .connector
            .dial()
            .await
            .context("Failed to dial broker")?;
        Ok((current, transport))
    }
}
