//! Agent runtime: owns the printer's serial link and one broker connection.
//!
//! Inbound envelopes are dispatched on their own tasks so receipt never
//! blocks. Print-triggering commands (`LEVEL_BED`, `AUTO_HOME`, `LOAD`,
//! `START`) must take the printer lock first and are rejected with
//! [`AgentError::Busy`] rather than queued when it is held. The lock is held
//! for the whole operation, so at most one serial handshake runs at a time.
//!
//! `UNLOCK_PRINTER` clears the reported busy flag without touching the lock.
//! It only corrects what the agent reports: while a print is still running
//! the flag reads `false`, but new print commands are still rejected. It
//! cannot rescue a hung handshake; a printer that never acknowledges keeps
//! the lock until the serial stream fails or the agent restarts.

pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::protocol::{AgentInfo, AgentStatus, Envelope, RequestType};
use crate::serial::{BoxedSerial, BuiltinScript, LineDriver};
use crate::transport::Transport;

/// File fetched by `LOAD`, waiting for `START`.
#[derive(Debug, Clone)]
struct LoadedFile {
    id: String,
    script: Arc<str>,
}

#[derive(Debug)]
struct AgentState {
    status: AgentStatus,
    loaded: Option<LoadedFile>,
}

/// One printer agent.
pub struct Agent {
    /// Held for the entire duration of a print operation.
    printer: Mutex<LineDriver<BoxedSerial>>,
    busy: AtomicBool,
    state: RwLock<AgentState>,
    http: reqwest::Client,
    config: AgentConfig,
}

/// Proof of holding the printer; clears the busy flag when dropped, on
/// every exit path.
struct PrintGuard<'a> {
    driver: MutexGuard<'a, LineDriver<BoxedSerial>>,
    busy: &'a AtomicBool,
}

impl Drop for PrintGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl Agent {
    pub fn new(serial: BoxedSerial, config: AgentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            printer: Mutex::new(LineDriver::new(serial)),
            busy: AtomicBool::new(false),
            state: RwLock::new(AgentState {
                status: AgentStatus::Idle,
                loaded: None,
            }),
            http,
            config,
        })
    }

    /// Current `{busy, status}` snapshot.
    pub async fn info(&self) -> AgentInfo {
        AgentInfo {
            busy: self.busy.load(Ordering::SeqCst),
            status: self.state.read().await.status,
        }
    }

    /// Serve one broker connection until it closes or fails.
    ///
    /// Runs the inbound loop and the periodic status reporter side by side;
    /// whichever stops first ends the connection. Print tasks already
    /// started keep running.
    pub async fn run(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        info!("Connected to broker");
        // A closed connection also fails the next status send; report the close.
        tokio::select! {
            biased;
            res = self.receive(Arc::clone(&transport)) => res,
            res = self.report_status(transport) => {
                res.context("Status reporting stopped")
            }
        }
    }

    async fn receive(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<()> {
        while let Some(envelope) = transport.recv().await? {
            let agent = Arc::clone(self);
            tokio::spawn(async move { agent.dispatch(envelope).await });
        }
        info!("Broker closed the connection");
        Ok(())
    }

    async fn report_status(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = Envelope::status(self.info().await)?;
            transport.send(&report).await?;
        }
    }

    #[instrument(skip_all, fields(request_id = %envelope.request_id, request_type = ?envelope.request_type))]
    async fn dispatch(&self, envelope: Envelope) {
        match self.handle(&envelope).await {
            Ok(()) => debug!("Command handled"),
            Err(AgentError::Busy) => warn!("Rejected: agent is busy"),
            Err(e) => error!(error = %e, "Command failed"),
        }
    }

    /// Execute one command to completion.
    pub async fn handle(&self, envelope: &Envelope) -> Result<(), AgentError> {
        match envelope.request_type {
            RequestType::LevelBed => self.run_builtin(BuiltinScript::LevelBed).await,
            RequestType::AutoHome => self.run_builtin(BuiltinScript::Home).await,
            RequestType::Load => self.load(envelope).await,
            RequestType::Start => self.start().await,
            RequestType::UnlockPrinter => {
                self.unlock();
                Ok(())
            }
            RequestType::Pause | RequestType::Cancel => {
                info!("Not implemented, ignoring");
                Ok(())
            }
            RequestType::AgentStatus => {
                debug!("Ignoring status message");
                Ok(())
            }
        }
    }

    /// Clear the busy flag without taking the printer lock.
    pub fn unlock(&self) {
        info!("Printer unlocked");
        self.busy.store(false, Ordering::SeqCst);
    }

    fn claim(&self) -> Result<PrintGuard<'_>, AgentError> {
        let driver = self.printer.try_lock().map_err(|_| AgentError::Busy)?;
        self.busy.store(true, Ordering::SeqCst);
        Ok(PrintGuard {
            driver,
            busy: &self.busy,
        })
    }

    async fn run_builtin(&self, script: BuiltinScript) -> Result<(), AgentError> {
        let mut guard = self.claim()?;
        info!(?script, "Running built-in script");
        guard.driver.run(script.text()).await?;
        Ok(())
    }

    async fn load(&self, envelope: &Envelope) -> Result<(), AgentError> {
        let _guard = self.claim()?;
        let file = envelope.load_file()?;

        let bytes = self
            .http
            .get(&file.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        info!(id = %file.id, bytes = bytes.len(), url = %file.url, "Downloaded gcode");

        let mut state = self.state.write().await;
        state.loaded = Some(LoadedFile {
            id: file.id,
            script: String::from_utf8_lossy(&bytes).into(),
        });
        state.status = AgentStatus::Ready;
        Ok(())
    }

    async fn start(&self) -> Result<(), AgentError> {
        let mut guard = self.claim()?;
        let file = {
            let mut state = self.state.write().await;
            let file = state.loaded.clone().ok_or(AgentError::NothingLoaded)?;
            state.status = AgentStatus::Printing;
            file
        };
        info!(id = %file.id, "Starting print");

        let result = guard.driver.run(&file.script).await;
        self.state.write().await.status = AgentStatus::Ready;

        let summary = result?;
        info!(id = %file.id, lines = summary.lines_sent, "Print finished");
        Ok(())
    }
}
