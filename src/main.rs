//! print-relay
//!
//! Runs either side of the relay: the broker that web clients talk to, or an
//! agent sitting next to a printer. `print` and `devices` work locally
//! without a broker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use print_relay::agent::supervisor::{DeviceConnector, Supervisor};
use print_relay::config::{AgentConfig, BrokerConfig, ConfigFile};
use print_relay::serial::{port, BuiltinScript, LineDriver};

#[derive(Parser, Debug)]
#[command(name = "print-relay")]
#[command(about = "Remote control for serial-attached 3D printers")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// JSON configuration file; flags override its values
    #[arg(long, global = true, env = "PRINT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker: HTTP API plus the agent WebSocket endpoint
    Serve(ServeArgs),

    /// Run an agent for one printer
    Agent(AgentArgs),

    /// Stream a G-code file or built-in script straight to a printer
    #[command(visible_alias = "p")]
    Print(PrintArgs),

    /// List serial devices
    Devices,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Base URL agents use to download uploaded files
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Serial device the printer is attached to
    #[arg(short = 'p', long, env = "SERIAL_PORT")]
    serial_device: Option<String>,

    #[arg(short, long, env = "BAUD_RATE")]
    baud_rate: Option<u32>,

    /// Broker WebSocket endpoint
    #[arg(short, long, env = "WEBSOCKET_URL")]
    websocket_url: Option<String>,
}

#[derive(Args, Debug)]
struct PrintArgs {
    #[arg(short = 'p', long, env = "SERIAL_PORT")]
    serial_port: String,

    #[arg(short, long, env = "BAUD_RATE", default_value_t = 115_200)]
    baud_rate: u32,

    /// G-code file to print
    #[arg(short, long, env = "INPUT_FILE", conflicts_with = "builtin", required_unless_present = "builtin")]
    input_file: Option<PathBuf>,

    /// Built-in script to run instead of a file
    #[arg(long, value_enum)]
    builtin: Option<BuiltinScript>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (stderr so stdout stays clean for `devices`)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };

    match cli.command {
        Command::Serve(args) => serve(file, args).await,
        Command::Agent(args) => agent(file, args).await,
        Command::Print(args) => print(args).await,
        Command::Devices => devices(),
    }
}

async fn serve(file: ConfigFile, args: ServeArgs) -> Result<()> {
    let mut section = file.broker;
    if let Some(listen) = args.listen {
        section.listen = listen;
    }
    if let Some(public_url) = args.public_url {
        section.public_url = public_url;
    }
    let config = BrokerConfig::from_section(&section).context("Invalid broker configuration")?;

    info!(listen = %config.listen, public_url = %config.public_url, "Starting broker");
    print_relay::http::serve(config).await
}

async fn agent(file: ConfigFile, args: AgentArgs) -> Result<()> {
    let mut section = file.agent;
    if let Some(device) = args.serial_device {
        section.serial_device = device;
    }
    if let Some(baud_rate) = args.baud_rate {
        section.baud_rate = baud_rate;
    }
    if let Some(url) = args.websocket_url {
        section.broker_url = url;
    }
    let config = AgentConfig::from_section(&section);

    info!(
        device = %config.serial_device,
        baud_rate = config.baud_rate,
        broker = %config.broker_url,
        "Starting agent"
    );
    Supervisor::new(DeviceConnector::new(config.clone()), config)
        .run()
        .await
}

async fn print(args: PrintArgs) -> Result<()> {
    let script = match (&args.input_file, args.builtin) {
        (Some(path), _) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (None, Some(builtin)) => builtin.text().to_string(),
        (None, None) => anyhow::bail!("Either --input-file or --builtin is required"),
    };

    let serial = port::open(&args.serial_port, args.baud_rate)?;
    let summary = LineDriver::new(serial)
        .run(&script)
        .await
        .context("Print aborted")?;

    info!(
        lines = summary.lines_sent,
        busy = summary.busy_replies,
        "Print finished"
    );
    Ok(())
}

fn devices() -> Result<()> {
    let devices = port::list_devices()?;
    anyhow::ensure!(!devices.is_empty(), "No serial ports found");
    for device in devices {
        println!("{device}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn print_requires_a_source() {
        assert!(Cli::try_parse_from(["print-relay", "print", "-p", "/dev/null"]).is_err());
        assert!(Cli::try_parse_from([
            "print-relay",
            "print",
            "-p",
            "/dev/null",
            "--builtin",
            "level-bed"
        ])
        .is_ok());
    }

    #[test]
    fn agent_flags_are_optional() {
        let cli = Cli::try_parse_from(["print-relay", "agent", "-w", "ws://broker/api/websocket"])
            .unwrap();
        let Command::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.websocket_url.as_deref(), Some("ws://broker/api/websocket"));
    }
}
