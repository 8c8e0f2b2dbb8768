//! Opening and enumerating serial devices.

use anyhow::{Context, Result};
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::debug;

/// Open `path` at `baud_rate` (8N1, no flow control) for async I/O.
pub fn open(path: &str, baud_rate: u32) -> Result<SerialStream> {
    debug!(device = %path, baud_rate, "Opening serial device");
    tokio_serial::new(path, baud_rate)
        .open_native_async()
        .with_context(|| format!("Failed to open serial device {path}"))
}

/// A serial port found on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub usb: Option<UsbDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDetails {
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Found port: {}", self.name)?;
        if let Some(usb) = &self.usb {
            write!(f, "\n   USB ID     {:04x}:{:04x}", usb.vid, usb.pid)?;
            if let Some(serial) = &usb.serial_number {
                write!(f, "\n   USB serial {serial}")?;
            }
        }
        Ok(())
    }
}

/// List the serial ports visible to this process.
pub fn list_devices() -> Result<Vec<Device>> {
    let ports = tokio_serial::available_ports().context("Failed to enumerate serial ports")?;
    Ok(ports
        .into_iter()
        .map(|port| Device {
            usb: match port.port_type {
                SerialPortType::UsbPort(info) => Some(UsbDetails {
                    vid: info.vid,
                    pid: info.pid,
                    serial_number: info.serial_number,
                }),
                _ => None,
            },
            name: port.port_name,
        })
        .collect())
}
