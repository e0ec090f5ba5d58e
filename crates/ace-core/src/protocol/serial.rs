//! Serial port handling
//!
//! Provides the duplex byte stream the device link runs over, plus port
//! discovery for ACE hubs.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use tracing::{debug, info};

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// USB VID:PID pairs reported by ACE hubs
const ACE_USB_IDS: &[(u16, u16)] = &[(0x28e9, 0x018a)];

/// Product strings reported by ACE hubs and their clones
const ACE_DESCRIPTIONS: &[&str] = &["ACE", "BunnyAce", "DuckAce"];

/// Duplex byte stream to one device
pub trait Transport: Send {
    /// Open (or re-open) the underlying stream
    fn open(&mut self) -> Result<(), ProtocolError>;

    /// Close the stream; closing a closed stream is a no-op
    fn close(&mut self);

    /// Whether the stream is open
    fn is_open(&self) -> bool;

    /// Read whatever is available without blocking; `Ok(0)` when nothing is
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError>;

    /// Write a complete frame
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError>;
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
            ),
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
        }
    }
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Whether this port looks like an ACE hub
    pub fn is_ace(&self) -> bool {
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            if ACE_USB_IDS.contains(&(vid, pid)) {
                return true;
            }
        }
        self.product
            .as_deref()
            .is_some_and(|p| ACE_DESCRIPTIONS.iter().any(|name| p.contains(name)))
    }
}

/// Sort key: ttyACM* first, then ttyUSB*, then everything else
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// First port that identifies as an ACE hub
pub fn find_ace_device() -> Option<String> {
    select_ace_port(&list_ports())
}

fn select_ace_port(ports: &[PortInfo]) -> Option<String> {
    match ports.iter().find(|p| p.is_ace()) {
        Some(port) => {
            info!(port = %port.name, "found ACE device");
            Some(port.name.clone())
        }
        None => {
            debug!("no ACE device found by auto-detection");
            None
        }
    }
}

/// [`Transport`] over a local serial port
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    write_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Closed transport for `port_name`; baud defaults to [`DEFAULT_BAUD_RATE`]
    pub fn new(port_name: impl Into<String>, baud_rate: Option<u32>, write_timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            write_timeout,
            port: None,
        }
    }

    /// Device path
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), ProtocolError> {
        self.port = None;
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.write_timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(self.port_name.clone()),
                _ => ProtocolError::SerialError(e.to_string()),
            })?;
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotConnected)?;
        let available = port
            .bytes_to_read()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))? as usize;
        if available == 0 {
            return Ok(0);
        }
        let to_read = available.min(buf.len());
        match port.read(&mut buf[..to_read]) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(ProtocolError::IoError(e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotConnected)?;
        port.write_all(data)?;
        Ok(())
    }
}
