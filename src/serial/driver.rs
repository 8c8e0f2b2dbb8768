//! Line-level handshake with printer firmware.
//!
//! The firmware protocol has no framing beyond newlines and no correlation
//! ids. After each line is sent, the driver reads replies until one of two
//! signals shows up:
//! - a line starting with an uppercase letter (unsolicited telemetry such as
//!   `T:200.1 /0.0 B:60.0/0.0`), taken as proof the firmware is responsive
//! - exactly `ok`
//!
//! Anything else (canonically `echo:busy: processing`) keeps the driver in
//! the busy-wait sub-loop. There is no bound on busy replies; only a read
//! error or end of stream ends the wait.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::error::DriverError;

/// Acknowledgement token sent by the firmware once a line is processed.
pub const ACK: &str = "ok";

/// Busy heartbeat emitted by Marlin-style firmware while a move is running.
pub const BUSY: &str = "echo:busy: processing";

/// How a single firmware reply is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Exactly `ok`.
    Ack,
    /// Uppercase-prefixed telemetry; also releases the next line.
    Info,
    /// Anything else. Keep waiting.
    Busy,
}

/// Classify one reply line (with or without its line terminator).
pub fn classify(reply: &str) -> Reply {
    if reply.chars().next().is_some_and(char::is_uppercase) {
        return Reply::Info;
    }
    if reply.trim_end_matches(['\r', '\n']) == ACK {
        Reply::Ack
    } else {
        Reply::Busy
    }
}

/// A line is sent only if it starts with a letter. Blank lines, `;`
/// comments and anything malformed are skipped.
pub fn is_significant(line: &str) -> bool {
    line.chars().next().is_some_and(char::is_alphabetic)
}

/// The lines of `script` that will be sent, in order, without terminators.
pub fn significant_lines(script: &str) -> impl Iterator<Item = &str> {
    script.lines().filter(|line| is_significant(line)).map(str::trim_end)
}

/// Counters from one completed script run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptSummary {
    pub lines_sent: usize,
    pub busy_replies: usize,
    pub info_replies: usize,
}

/// Drives the per-line handshake over a duplex byte stream.
///
/// The stream stays wrapped in one buffered reader for the driver's whole
/// life so bytes read ahead of a line boundary are never lost.
pub struct LineDriver<S> {
    stream: BufReader<S>,
    reply: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineDriver<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            reply: Vec::with_capacity(128),
        }
    }

    /// Stream every significant line of `script`, one fully acknowledged
    /// line at a time. Returns the first I/O error, abandoning the rest.
    pub async fn run(&mut self, script: &str) -> Result<ScriptSummary, DriverError> {
        let mut summary = ScriptSummary::default();
        for line in significant_lines(script) {
            self.send(line).await?;
            summary.lines_sent += 1;
            self.await_ack(&mut summary).await?;
        }
        debug!(
            lines = summary.lines_sent,
            busy = summary.busy_replies,
            "Script complete"
        );
        Ok(summary)
    }

    async fn send(&mut self, line: &str) -> Result<(), DriverError> {
        debug!(line, "SEND");
        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line);
        frame.push('\n');
        self.stream.write_all(frame.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// AWAIT_ACK, falling into BUSY_WAIT until a releasing reply arrives.
    async fn await_ack(&mut self, summary: &mut ScriptSummary) -> Result<(), DriverError> {
        loop {
            let reply = self.read_reply().await?;
            match classify(&reply) {
                Reply::Ack => return Ok(()),
                Reply::Info => {
                    summary.info_replies += 1;
                    return Ok(());
                }
                Reply::Busy => {
                    summary.busy_replies += 1;
                    trace!("Firmware busy, waiting for ack");
                }
            }
        }
    }

    async fn read_reply(&mut self) -> Result<String, DriverError> {
        self.reply.clear();
        let n = self.stream.read_until(b'\n', &mut self.reply).await?;
        if n == 0 {
            return Err(DriverError::Closed);
        }
        let reply = String::from_utf8_lossy(&self.reply).into_owned();
        debug!(reply = %reply.trim_end(), "RECV");
        Ok(reply)
    }
}
