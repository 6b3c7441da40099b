// Physical line access
//
// A transport moves raw bytes and nothing else: no framing, no retries.
// Exactly one bus owns a transport, so every method takes `&mut self`.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Default serial configuration for servo buses
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Errors raised while moving bytes on the line
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Port {port} is not open")]
    NotOpen { port: String },

    #[error("Timed out after {waited:?} waiting for {expected} bytes")]
    Timeout { expected: usize, waited: Duration },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-level access to a half-duplex line
pub trait Transport: Send {
    fn port_name(&self) -> &str;

    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn baudrate(&self) -> u32;

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError>;

    /// Write one complete frame
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `len` bytes or fail with `Timeout`
    fn receive(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drop any stale bytes waiting in the input buffer
    fn clear_input(&mut self) -> Result<(), TransportError>;
}

/// Transport over a local serial device
pub struct SerialTransport {
    port_name: String,
    baudrate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("baudrate", &self.baudrate)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baudrate,
            port: None,
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        let name = &self.port_name;
        self.port.as_mut().ok_or_else(|| TransportError::NotOpen {
            port: name.clone(),
        })
    }
}

impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        // 8N1, no flow control for both protocol families
        let port = serialport::new(&self.port_name, self.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        info!("Opened {} at {} baud", self.port_name, self.baudrate);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            info!("Closed {}", self.port_name);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn baudrate(&self) -> u32 {
        self.baudrate
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        if let Some(port) = self.port.as_mut() {
            port.set_baud_rate(baudrate)?;
        }
        debug!("{} baudrate set to {}", self.port_name, baudrate);
        self.baudrate = baudrate;
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(frame)?;
        port.flush()?;
        Ok(())
    }

    fn receive(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port_mut()?;
        port.set_timeout(timeout)?;

        let mut buf = vec![0u8; len];
        port.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TransportError::Timeout {
                    expected: len,
                    waited: timeout,
                }
            } else {
                TransportError::Io(e)
            }
        })?;
        Ok(buf)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port_mut()?.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Serial ports the OS currently exposes
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}
