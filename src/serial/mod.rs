//! Serial side of the agent: the firmware handshake driver, the built-in
//! maintenance scripts, and device helpers.

mod driver;
pub mod port;

pub use driver::{classify, is_significant, significant_lines, LineDriver, Reply, ScriptSummary, ACK, BUSY};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream a printer can sit behind.
pub trait SerialStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialStream for T {}

/// Boxed serial stream, so the agent does not care what is on the wire.
pub type BoxedSerial = Box<dyn SerialStream>;

/// Motion limits, then home all axes.
pub const GCODE_AUTO_HOME: &str = "\
M201 X500 Y500 Z100 E5000 ; sets maximum accelerations, mm/sec^2
M203 X500 Y500 Z10 E60 ; sets maximum feedrates, mm/sec
M204 P500 R1000 T500 ; sets acceleration (P, T) and retract acceleration (R), mm/sec^2
M205 X8.00 Y8.00 Z0.40 E5.00 ; sets the jerk limits, mm/sec
M205 S0 T0 ; sets the minimum extruding and travel feed rate, mm/sec
M107 ; disable fan
G90 ; use absolute coordinates
M83 ; extruder relative mode
G28 ; home all
";

/// Home, then visit each corner at first-layer height so the bed can be
/// trammed by hand with a sheet of paper.
pub const GCODE_LEVEL_BED_TEST: &str = "\
G90 ; use absolute coordinates
M107 ; disable fan
G28 ; home all
G1 Z5 F600 ; lift nozzle
G1 X30 Y30 F3000 ; front left
G1 Z0.2 F600
G1 Z5 F600
G1 X200 Y30 F3000 ; front right
G1 Z0.2 F600
G1 Z5 F600
G1 X200 Y200 F3000 ; back right
G1 Z0.2 F600
G1 Z5 F600
G1 X30 Y200 F3000 ; back left
G1 Z0.2 F600
G1 Z5 F600
G28 X Y ; park
M84 ; disable steppers
";

/// Scripts the agent can run without a loaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BuiltinScript {
    Home,
    LevelBed,
}

impl BuiltinScript {
    pub const fn text(self) -> &'static str {
        match self {
            Self::Home => GCODE_AUTO_HOME,
            Self::LevelBed => GCODE_LEVEL_BED_TEST,
        }
    }
}
