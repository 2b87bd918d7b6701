//! Wire format encoding and decoding for the operation message header.
//!
//! Implements the 8-byte header that prefixes every frame:
//! ```text
//! ┌──────────┬──────────┬────────┬────────┬─────────┐
//! │ Size     │ Op ID    │ Type   │ Result │ Pad     │
//! │ 2 bytes  │ 2 bytes  │ 1 byte │ 1 byte │ 2 bytes │
//! │ u16 LE   │ u16 LE   │        │        │ zero    │
//! └──────────┴──────────┴────────┴────────┴─────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. `size` covers the whole
//! frame, header included. The high bit of `type` marks a response; the
//! low 7 bits are the request type code. `result` is meaningful only in
//! responses.

use crate::error::{GreybusError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Response flag in the type byte.
pub const TYPE_RESPONSE_FLAG: u8 = 0x80;

/// Reserved type code (never use).
pub const TYPE_INVALID: u8 = 0x00;

/// Version-negotiation request, run once per connection.
pub const TYPE_PROTOCOL_VERSION: u8 = 0x01;

/// One-way notification that the channel is attached and active.
///
/// 0x7e/0x7f sit at the top of the 7-bit type space, out of the way of
/// protocol-defined request types.
pub const TYPE_CONNECTED: u8 = 0x7e;

/// One-way notification sent during channel teardown.
pub const TYPE_DISCONNECTED: u8 = 0x7f;

/// Result code carried in the header of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationResult {
    Success = 0x00,
    Interrupted = 0x01,
    Timeout = 0x02,
    NoMemory = 0x03,
    ProtocolBad = 0x04,
    Overflow = 0x05,
    Invalid = 0x06,
    Retry = 0x07,
    Nonexistent = 0x08,
    Unknown = 0xfe,
    Internal = 0xff,
}

impl OperationResult {
    /// Decode a result byte; unrecognized values collapse to `Unknown`.
    pub fn from_byte(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::Interrupted,
            0x02 => Self::Timeout,
            0x03 => Self::NoMemory,
            0x04 => Self::ProtocolBad,
            0x05 => Self::Overflow,
            0x06 => Self::Invalid,
            0x07 => Self::Retry,
            0x08 => Self::Nonexistent,
            0xff => Self::Internal,
            _ => Self::Unknown,
        }
    }

    /// Result byte to report for a handler error on an incoming request.
    pub fn from_error(err: &GreybusError) -> Self {
        match err {
            GreybusError::Timeout => Self::Timeout,
            GreybusError::Cancelled => Self::Interrupted,
            GreybusError::ResourceExhausted(_) => Self::Overflow,
            GreybusError::MalformedFrame(_) => Self::Invalid,
            GreybusError::NotFound { .. } => Self::Nonexistent,
            GreybusError::IncompatibleVersion { .. } => Self::ProtocolBad,
            GreybusError::InvalidState(_) => Self::Retry,
            _ => Self::Unknown,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHeader {
    /// Total frame size in bytes, header included.
    pub size: u16,
    /// Operation identifier (0 = unidirectional, no response expected).
    pub operation_id: u16,
    /// Type byte: request type code in the low 7 bits, bit 7 = response.
    pub op_type: u8,
    /// Result code (responses only; zero in requests).
    pub result: u8,
}

impl OperationHeader {
    /// Create a request header for a payload of the given length.
    pub fn request(operation_id: u16, op_type: u8, payload_len: usize) -> Self {
        Self {
            size: (HEADER_SIZE + payload_len) as u16,
            operation_id,
            op_type,
            result: 0,
        }
    }

    /// Create the response header matching a request header.
    pub fn response(request: &OperationHeader, result: u8, payload_len: usize) -> Self {
        Self {
            size: (HEADER_SIZE + payload_len) as u16,
            operation_id: request.operation_id,
            op_type: request.op_type | TYPE_RESPONSE_FLAG,
            result,
        }
    }

    /// Encode header to bytes (Little Endian, pad zeroed).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.size.to_le_bytes());
        buf[2..4].copy_from_slice(&self.operation_id.to_le_bytes());
        buf[4] = self.op_type;
        buf[5] = self.result;
        buf
    }

    /// Decode header from bytes (Little Endian).
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([buf[0], buf[1]]),
            operation_id: u16::from_le_bytes([buf[2], buf[3]]),
            op_type: buf[4],
            result: buf[5],
        })
    }

    /// Validate the header against the transport's buffer limit.
    ///
    /// Checks:
    /// - Type code is not 0 (reserved)
    /// - `size` covers at least the header itself
    /// - `size` does not exceed the buffer limit
    pub fn validate(&self, buffer_size_max: usize) -> Result<()> {
        if self.op_type & !TYPE_RESPONSE_FLAG == TYPE_INVALID {
            return Err(GreybusError::MalformedFrame(
                "type code 0 is reserved".to_string(),
            ));
        }

        if (self.size as usize) < HEADER_SIZE {
            return Err(GreybusError::MalformedFrame(format!(
                "frame size {} shorter than header",
                self.size
            )));
        }

        if self.size as usize > buffer_size_max {
            return Err(GreybusError::MalformedFrame(format!(
                "frame size {} exceeds buffer limit {}",
                self.size, buffer_size_max
            )));
        }

        Ok(())
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.op_type & TYPE_RESPONSE_FLAG != 0
    }

    /// Request type code with the response flag stripped.
    #[inline]
    pub fn request_type(&self) -> u8 {
        self.op_type & !TYPE_RESPONSE_FLAG
    }

    /// Check if this is a unidirectional message (operation id 0).
    #[inline]
    pub fn is_unidirectional(&self) -> bool {
        self.operation_id == 0
    }
}
