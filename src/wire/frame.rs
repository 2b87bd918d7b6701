//! Frame struct with typed accessors and receive-path validation.
//!
//! The host transport delivers each cport message as one complete frame;
//! there is no partial-read reassembly here. `Frame::parse` is the single
//! place inbound bytes are validated; anything malformed is rejected
//! before it can reach operation matching.

use bytes::Bytes;

use super::header::{OperationHeader, HEADER_SIZE};
use crate::error::{GreybusError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: OperationHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: OperationHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Parse and validate one inbound frame.
    ///
    /// Rejects with `MalformedFrame` when:
    /// - the buffer is shorter than a header
    /// - the header's `size` disagrees with the delivered length
    /// - the frame exceeds the transport buffer limit
    /// - the type code is reserved
    /// - the pad bytes are non-zero
    pub fn parse(data: &[u8], buffer_size_max: usize) -> Result<Self> {
        let header = OperationHeader::decode(data).ok_or_else(|| {
            GreybusError::MalformedFrame(format!("short frame ({} bytes)", data.len()))
        })?;

        header.validate(buffer_size_max)?;

        if header.size as usize != data.len() {
            return Err(GreybusError::MalformedFrame(format!(
                "header size {} disagrees with delivered length {}",
                header.size,
                data.len()
            )));
        }

        if data[6] != 0 || data[7] != 0 {
            return Err(GreybusError::MalformedFrame(
                "non-zero pad bytes".to_string(),
            ));
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&data[HEADER_SIZE..]),
        })
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the operation id.
    #[inline]
    pub fn operation_id(&self) -> u16 {
        self.header.operation_id
    }

    /// Check if this is a response.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes the header and appends the payload into a contiguous buffer,
/// ready to hand to the host transport.
pub fn build_frame(header: &OperationHeader, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}
