//! Command transmit path

use super::serial::ChannelWriter;
use super::{TransmitError, FRAME_DELIMITER};

/// Encode a command for the wire: 7-bit ASCII followed by the delimiter.
///
/// Rejects the whole command if any character is outside ASCII.
pub fn encode_command(command: &str) -> Result<Vec<u8>, TransmitError> {
    if let Some((index, ch)) = command.char_indices().find(|(_, ch)| !ch.is_ascii()) {
        return Err(TransmitError::EncodingError { ch, index });
    }

    let mut payload = Vec::with_capacity(command.len() + 1);
    payload.extend_from_slice(command.as_bytes());
    payload.push(FRAME_DELIMITER);
    Ok(payload)
}

/// Writes framed commands through the session's handle
pub struct Transmitter {
    writer: ChannelWriter,
}

impl Transmitter {
    pub(crate) fn new(writer: ChannelWriter) -> Self {
        Self { writer }
    }

    /// Encode and write `command`.
    ///
    /// A write failure leaves the connection state alone; the caller
    /// decides whether to drop the link.
    pub fn send(&self, command: &str) -> Result<(), TransmitError> {
        let payload = encode_command(command)?;

        self.writer.write_payload(&payload).map_err(|e| {
            tracing::warn!("Failed to send {:?}: {}", command, e);
            TransmitError::WriteFailed(e.to_string())
        })?;

        tracing::debug!("Sent {:?} ({} bytes)", command, payload.len());
        Ok(())
    }
}
