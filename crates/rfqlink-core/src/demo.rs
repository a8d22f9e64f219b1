//! Demo Mode - Simulated RFQ controller for running without hardware
//!
//! Speaks the same CR-delimited protocol as the real controller:
//! - `time=HH:MM:SS` sets the simulated clock and answers `ok`
//! - `time` answers with the simulated clock as `HH:MM:SS`
//! - anything else answers `ok <command>`

use chrono::{Local, NaiveTime};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::protocol::{
    ConnectionError, FrameAccumulator, PortDescriptor, PortOpener, SerialChannel,
    FRAME_DELIMITER,
};

/// Commands received by demo devices, shared with whoever created them
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    commands: Arc<Mutex<Vec<String>>>,
}

impl CommandLog {
    /// Copy of every command received so far, in order
    pub fn snapshot(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn record(&self, command: String) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }
}

/// Simulated controller implementing [`SerialChannel`]
pub struct DemoDevice {
    /// Bytes written by the host, not yet terminated
    inbound: FrameAccumulator,
    /// Replies waiting to be read by the host
    outbound: VecDeque<u8>,
    /// Clock value last set by the host and when it was set
    clock: Option<(NaiveTime, Instant)>,
    log: CommandLog,
}

impl Default for DemoDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoDevice {
    /// Create a device with its clock following local time
    pub fn new() -> Self {
        Self::with_log(CommandLog::default())
    }

    /// Create a device that records commands into `log`
    pub fn with_log(log: CommandLog) -> Self {
        Self {
            inbound: FrameAccumulator::new(),
            outbound: VecDeque::new(),
            clock: None,
            log,
        }
    }

    /// Current simulated clock
    pub fn clock(&self) -> NaiveTime {
        match self.clock {
            Some((set_to, set_at)) => {
                let elapsed = chrono::Duration::from_std(set_at.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                set_to + elapsed
            }
            None => Local::now().time(),
        }
    }

    fn handle_command(&mut self, command: String) {
        tracing::debug!("Demo device received {:?}", command);

        let reply = if command == "time" {
            self.clock().format("%H:%M:%S").to_string()
        } else if let Some(value) = command.strip_prefix("time=") {
            match NaiveTime::parse_from_str(value, "%H:%M:%S") {
                Ok(time) => {
                    self.clock = Some((time, Instant::now()));
                    "ok".to_string()
                }
                Err(_) => format!("err {}", command),
            }
        } else {
            format!("ok {}", command)
        };

        self.log.record(command);
        self.outbound.extend(reply.as_bytes());
        self.outbound.push_back(FRAME_DELIMITER);
    }
}

impl Read for DemoDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbound.is_empty() {
            // Same as a zero-timeout serial port with nothing pending
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }

        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for DemoDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for frame in self.inbound.push(buf) {
            self.handle_command(frame.to_text());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialChannel for DemoDevice {
    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.outbound.clear();
        Ok(())
    }
}

/// Port opener handing out [`DemoDevice`]s for any descriptor
#[derive(Debug, Clone, Default)]
pub struct DemoOpener {
    log: CommandLog,
}

impl DemoOpener {
    /// Create an opener
    pub fn new() -> Self {
        Self::default()
    }

    /// Log shared by every device this opener creates
    pub fn command_log(&self) -> CommandLog {
        self.log.clone()
    }
}

impl PortOpener for DemoOpener {
    fn open(
        &self,
        port: &PortDescriptor,
        baud_rate: u32,
    ) -> Result<Box<dyn SerialChannel>, ConnectionError> {
        tracing::info!("Opened demo device for {} at {} baud", port, baud_rate);
        Ok(Box::new(DemoDevice::with_log(self.log.clone())))
    }
}
