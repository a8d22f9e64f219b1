//! Serial Link Protocol
//!
//! Implements the CR-delimited ASCII command protocol spoken by the RFQ
//! test controller: framing, transmit, the startup clock handshake and the
//! connection lifecycle that ties them together.

mod connection;
mod error;
pub mod events;
pub mod framing;
pub mod handshake;
mod reader;
pub mod serial;
pub mod transmit;

pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ConnectionError, TransmitError};
pub use events::{Dispatcher, LinkEvent};
pub use framing::{Frame, FrameAccumulator};
pub use handshake::HandshakeReport;
pub use serial::{NativePortOpener, PortDescriptor, PortOpener, SerialChannel};
pub use transmit::{encode_command, Transmitter};

/// Byte terminating every command and response on the wire (carriage return)
pub const FRAME_DELIMITER: u8 = 0x0D;

/// Fixed line rate of the controller's UART
pub const BAUD_RATE: u32 = 460_800;

/// Default number of bytes requested per non-blocking read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Default sleep between empty reads in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

/// Default bound on how long `close` waits for the reader to exit
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1000;

/// Default pause between the two handshake commands.
/// The controller's parser merges commands that arrive in the same burst.
pub const DEFAULT_HANDSHAKE_DELAY_MS: u64 = 50;

/// Default capacity of the event queue
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
