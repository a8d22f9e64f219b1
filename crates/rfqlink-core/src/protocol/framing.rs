//! CR-delimited framing
//!
//! Splits the raw byte stream coming off the serial handle into frames.
//! Payloads are never interpreted here.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::FRAME_DELIMITER;

/// One complete message from the controller, delimiter stripped
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Create a frame from its payload bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the frame, returning its payload
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty (two delimiters back to back)
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:?})", String::from_utf8_lossy(&self.bytes))
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

/// Byte accumulator that turns arbitrary chunks into frames.
///
/// Always holds exactly the suffix of the stream that has not been emitted
/// as part of a completed frame.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to contain no delimiter
    scanned: usize,
}

impl FrameAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create an empty accumulator with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            scanned: 0,
        }
    }

    /// Append a chunk and return every frame it completes, in stream order
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;

        while let Some(offset) = self.buffer[cursor..]
            .iter()
            .position(|&b| b == FRAME_DELIMITER)
        {
            let end = cursor + offset;
            frames.push(Frame::new(self.buffer[start..end].to_vec()));
            start = end + 1;
            cursor = start;
        }

        // One shift per chunk rather than one per frame
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        frames
    }

    /// Bytes received after the last delimiter
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}
