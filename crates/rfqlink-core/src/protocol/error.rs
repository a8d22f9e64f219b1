//! Protocol errors

use thiserror::Error;

/// Errors raised by the connection lifecycle
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The port could not be opened
    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    /// A session is already active
    #[error("Already connected")]
    AlreadyConnected,

    /// No link is active
    #[error("Not connected to controller")]
    NotConnected,

    /// The reader thread could not be started
    #[error("Failed to start frame reader: {0}")]
    ReaderSpawn(String),
}

/// Errors raised on the transmit path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransmitError {
    /// No link is active
    #[error("Not connected to controller")]
    NotConnected,

    /// The command has a character outside 7-bit ASCII
    #[error("Command contains non-ASCII character {ch:?} at index {index}")]
    EncodingError {
        /// The offending character
        ch: char,
        /// Byte offset of `ch` in the command
        index: usize,
    },

    /// The handle rejected the write
    #[error("Serial write failed: {0}")]
    WriteFailed(String),
}
