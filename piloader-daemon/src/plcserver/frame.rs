// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Request framing of the binary PLC protocol.
//!
//! Every client frame is exactly 16 bytes:
//!
//! ```text
//! 0x01  op[2]  position:u16le  length:u16le  blob[8]  0x17
//! ```
//!
//! Short control replies reuse ASCII control bytes.

/// Frame start byte.
pub const STX: u8 = 0x01;
/// Frame stop byte.
pub const ETX: u8 = 0x17;

/// Positive acknowledgment (record separator).
pub const ACK: u8 = 0x1E;
/// Error reply.
pub const ERR: u8 = 0xFF;
/// Access denied for this opcode at the current level.
pub const DENIED: u8 = 0x18;
/// End of transmission for streamed replies.
pub const EOT: u8 = 0x04;

/// Size of a client frame on the wire.
pub const FRAME_LEN: usize = 16;

/// A parsed client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub opcode: [u8; 2],
    pub position: u16,
    pub length: u16,
    pub blob: [u8; 8],
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame start byte {0:#04x}")]
    BadStart(u8),
    #[error("invalid frame stop byte {0:#04x}")]
    BadStop(u8),
}

impl Request {
    pub fn parse(raw: &[u8; FRAME_LEN]) -> Result<Self, FrameError> {
        if raw[0] != STX {
            return Err(FrameError::BadStart(raw[0]));
        }
        if raw[15] != ETX {
            return Err(FrameError::BadStop(raw[15]));
        }
        Ok(Self {
            opcode: [raw[1], raw[2]],
            position: u16::from_le_bytes([raw[3], raw[4]]),
            length: u16::from_le_bytes([raw[5], raw[6]]),
            blob: raw[7..15].try_into().expect("8 blob bytes"),
        })
    }

    /// Build a wire frame; used by tests and client tooling.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut raw = [0u8; FRAME_LEN];
        raw[0] = STX;
        raw[1] = self.opcode[0];
        raw[2] = self.opcode[1];
        raw[3..5].copy_from_slice(&self.position.to_le_bytes());
        raw[5..7].copy_from_slice(&self.length.to_le_bytes());
        raw[7..15].copy_from_slice(&self.blob);
        raw[15] = ETX;
        raw
    }

    pub fn new(opcode: [u8; 2], position: u16, length: u16) -> Self {
        Self {
            opcode,
            position,
            length,
            blob: [0; 8],
        }
    }

    pub fn with_blob(mut self, blob: [u8; 8]) -> Self {
        self.blob = blob;
        self
    }
}
