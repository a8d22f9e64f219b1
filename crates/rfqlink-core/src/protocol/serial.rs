//! Serial port handling
//!
//! Provides the serial handle abstraction used by the session engine and
//! the native implementation backed by the `serialport` crate.

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::ConnectionError;

/// A serial device picked by the operator.
///
/// Port enumeration lives outside the core; the session engine only ever
/// receives descriptors it is asked to open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortDescriptor {
    /// Device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub device_path: String,

    /// Human readable description (e.g., "CP2102 USB to UART Bridge")
    pub description: String,
}

impl PortDescriptor {
    /// Create a descriptor
    pub fn new(device_path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.device_path)
        } else {
            write!(f, "{} ({})", self.device_path, self.description)
        }
    }
}

/// An open, non-blocking byte channel to the controller.
///
/// Reads must return immediately: `Ok(0)`, `TimedOut` or `WouldBlock` all
/// mean "nothing available yet".
pub trait SerialChannel: Read + Write + Send {
    /// Discard any bytes received but not yet read
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens serial channels for port descriptors
pub trait PortOpener: Send {
    /// Open `port` at `baud_rate` with zero read/write timeouts
    fn open(
        &self,
        port: &PortDescriptor,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialChannel>, ConnectionError>;
}

/// Serial port wrapper implementing SerialChannel
pub struct SerialPortChannel {
    port: Box<dyn SerialPort>,
}

impl SerialPortChannel {
    /// Wrap an already configured serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialPortChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialPortChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialChannel for SerialPortChannel {
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }
}

/// Opens real serial devices through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePortOpener;

impl PortOpener for NativePortOpener {
    fn open(
        &self,
        port: &PortDescriptor,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialChannel>, ConnectionError> {
        // Zero timeout: reads and writes return immediately instead of blocking
        let mut handle = serialport::new(&port.device_path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::ZERO)
            .open()
            .map_err(|e| ConnectionError::OpenFailed(describe_open_error(&port.device_path, &e)))?;

        // Keep DTR asserted so opening the port does not reset the controller
        if let Err(e) = handle.write_data_terminal_ready(true) {
            tracing::debug!("{}: failed to set DTR high: {} (continuing)", port.device_path, e);
        }

        handle
            .clear(serialport::ClearBuffer::Output)
            .map_err(|e| ConnectionError::OpenFailed(e.to_string()))?;

        tracing::info!("Opened {} at {} baud", port, baud_rate);
        Ok(Box::new(SerialPortChannel::new(handle)))
    }
}

/// Turn a serialport error into an operator-facing reason
fn describe_open_error(path: &str, err: &serialport::Error) -> String {
    match err.kind() {
        serialport::ErrorKind::NoDevice => format!("{}: device not found or busy", path),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            format!("{}: device not found", path)
        }
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            format!("{}: permission denied", path)
        }
        _ => format!("{}: {}", path, err),
    }
}

/// The live serial handle, shared between the foreground and the reader.
///
/// The reader only ever holds a [`ChannelReader`], the transmit path a
/// [`ChannelWriter`]. The underlying channel closes when the last of them
/// is dropped, so it can never be released underneath an active read.
pub(crate) struct SharedChannel {
    inner: Arc<Mutex<Box<dyn SerialChannel>>>,
}

impl SharedChannel {
    pub(crate) fn new(channel: Box<dyn SerialChannel>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    pub(crate) fn reader(&self) -> ChannelReader {
        ChannelReader {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn writer(&self) -> ChannelWriter {
        ChannelWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock(
    inner: &Mutex<Box<dyn SerialChannel>>,
) -> io::Result<MutexGuard<'_, Box<dyn SerialChannel>>> {
    inner
        .lock()
        .map_err(|_| io::Error::other("serial handle lock poisoned"))
}

/// Read-only view of the shared handle
pub(crate) struct ChannelReader {
    inner: Arc<Mutex<Box<dyn SerialChannel>>>,
}

impl ChannelReader {
    /// Non-blocking read of up to `buf.len()` bytes
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        lock(&self.inner)?.read(buf)
    }
}

/// Write-only view of the shared handle
pub(crate) struct ChannelWriter {
    inner: Arc<Mutex<Box<dyn SerialChannel>>>,
}

impl ChannelWriter {
    /// Write a complete payload in exactly one write call. A short write
    /// is reported as an error, never retried.
    pub(crate) fn write_payload(&self, payload: &[u8]) -> io::Result<()> {
        let written = lock(&self.inner)?.write(payload)?;
        if written < payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, payload.len()),
            ));
        }
        Ok(())
    }
}
