//! Shared protocol message definitions.
//!
//! Every struct here is packed with explicit little-endian fields and a
//! `SIZE` constant; encode/decode are hand-written against byte offsets
//! so the layouts stay bit-exact.

use bytes::Bytes;

use crate::error::{GreybusError, Result};

fn short(what: &str, got: usize, want: usize) -> GreybusError {
    GreybusError::MalformedFrame(format!("{what} payload too small ({got} < {want})"))
}

/// Version-negotiation request and response payload.
///
/// Carries (protocol id, major, minor); requests advertise the sender's
/// supported version, responses report the peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub id: u8,
    pub major: u8,
    pub minor: u8,
}

impl VersionInfo {
    pub const SIZE: usize = 3;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        [self.id, self.major, self.minor]
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(short("version", buf.len(), Self::SIZE));
        }
        Ok(Self {
            id: buf[0],
            major: buf[1],
            minor: buf[2],
        })
    }
}

/// Connected/disconnected notification payload: the remote cport id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CportNotify {
    pub cport_id: u16,
}

impl CportNotify {
    pub const SIZE: usize = 2;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        self.cport_id.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(short("cport notify", buf.len(), Self::SIZE));
        }
        Ok(Self {
            cport_id: u16::from_le_bytes([buf[0], buf[1]]),
        })
    }
}

/// Raw-protocol send request: a length-prefixed byte blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSendRequest {
    pub data: Bytes,
}

impl RawSendRequest {
    /// Fixed prefix ahead of the data: `len: u32 LE`.
    pub const PREFIX_SIZE: usize = 4;

    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::PREFIX_SIZE + self.data.len());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        Bytes::from(buf)
    }

    /// Decode and validate: the length field must match the payload size
    /// exactly, and zero-length sends are an error, not a no-op.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::PREFIX_SIZE {
            return Err(short("raw send", buf.len(), Self::PREFIX_SIZE));
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len != buf.len() - Self::PREFIX_SIZE {
            return Err(GreybusError::MalformedFrame(format!(
                "raw send length field {} disagrees with payload size {}",
                len,
                buf.len() - Self::PREFIX_SIZE
            )));
        }
        if len == 0 {
            return Err(GreybusError::MalformedFrame(
                "raw send of 0 bytes".to_string(),
            ));
        }
        Ok(Self {
            data: Bytes::copy_from_slice(&buf[Self::PREFIX_SIZE..]),
        })
    }
}

/// SPI master configuration, fetched once at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpiMasterConfigResponse {
    pub mode: u16,
    pub flags: u16,
    pub bits_per_word_mask: u32,
    pub num_chipselect: u8,
    pub min_speed_hz: u32,
    pub max_speed_hz: u32,
}

impl SpiMasterConfigResponse {
    pub const SIZE: usize = 17;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.mode.to_le_bytes());
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.bits_per_word_mask.to_le_bytes());
        buf[8] = self.num_chipselect;
        buf[9..13].copy_from_slice(&self.min_speed_hz.to_le_bytes());
        buf[13..17].copy_from_slice(&self.max_speed_hz.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(short("spi master config", buf.len(), Self::SIZE));
        }
        Ok(Self {
            mode: u16::from_le_bytes([buf[0], buf[1]]),
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            bits_per_word_mask: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            num_chipselect: buf[8],
            min_speed_hz: u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]),
            max_speed_hz: u32::from_le_bytes([buf[13], buf[14], buf[15], buf[16]]),
        })
    }
}

/// SPI per-device configuration request: which chip select to describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiDeviceConfigRequest {
    pub chip_select: u8,
}

impl SpiDeviceConfigRequest {
    pub const SIZE: usize = 1;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        [self.chip_select]
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(short("spi device config", 0, Self::SIZE));
        }
        Ok(Self {
            chip_select: buf[0],
        })
    }
}

/// SPI per-device configuration response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiDeviceConfigResponse {
    pub mode: u16,
    pub bits_per_word: u8,
    pub max_speed_hz: u32,
    /// Device name, NUL-padded.
    pub name: [u8; 32],
}

impl SpiDeviceConfigResponse {
    pub const SIZE: usize = 39;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.mode.to_le_bytes());
        buf[2] = self.bits_per_word;
        buf[3..7].copy_from_slice(&self.max_speed_hz.to_le_bytes());
        buf[7..39].copy_from_slice(&self.name);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(short("spi device config", buf.len(), Self::SIZE));
        }
        let mut name = [0u8; 32];
        name.copy_from_slice(&buf[7..39]);
        Ok(Self {
            mode: u16::from_le_bytes([buf[0], buf[1]]),
            bits_per_word: buf[2],
            max_speed_hz: u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]),
            name,
        })
    }

    /// Name with NUL padding stripped.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(32);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Bit set in a transfer descriptor's `rdwr` for outbound data.
pub const SPI_XFER_WRITE: u8 = 0x01;
/// Bit set in a transfer descriptor's `rdwr` for inbound data.
pub const SPI_XFER_READ: u8 = 0x02;

/// One transfer descriptor inside a SPI transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiTransferDescriptor {
    pub speed_hz: u32,
    pub len: u32,
    pub delay_usecs: u16,
    pub cs_change: u8,
    pub bits_per_word: u8,
    pub rdwr: u8,
}

impl SpiTransferDescriptor {
    pub const SIZE: usize = 13;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.speed_hz.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..10].copy_from_slice(&self.delay_usecs.to_le_bytes());
        buf[10] = self.cs_change;
        buf[11] = self.bits_per_word;
        buf[12] = self.rdwr;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(short("spi transfer descriptor", buf.len(), Self::SIZE));
        }
        Ok(Self {
            speed_hz: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            delay_usecs: u16::from_le_bytes([buf[8], buf[9]]),
            cs_change: buf[10],
            bits_per_word: buf[11],
            rdwr: buf[12],
        })
    }
}

/// Fixed prefix of a SPI transfer request, ahead of the descriptor array
/// and the concatenated tx data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiTransferRequestHeader {
    pub count: u16,
    pub mode: u8,
    pub chip_select: u8,
}

impl SpiTransferRequestHeader {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.count.to_le_bytes());
        buf[2] = self.mode;
        buf[3] = self.chip_select;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(short("spi transfer request", buf.len(), Self::SIZE));
        }
        Ok(Self {
            count: u16::from_le_bytes([buf[0], buf[1]]),
            mode: buf[2],
            chip_select: buf[3],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info_roundtrip() {
        let v = VersionInfo {
            id: 0x02,
            major: 1,
            minor: 7,
        };
        assert_eq!(VersionInfo::decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn test_version_info_layout() {
        let v = VersionInfo {
            id: 0xfe,
            major: 0,
            minor: 1,
        };
        assert_eq!(v.encode(), [0xfe, 0x00, 0x01]);
    }

    #[test]
    fn test_version_info_short_rejected() {
        assert!(VersionInfo::decode(&[1, 2]).is_err());
    }

    #[test]
    fn test_raw_send_roundtrip() {
        let req = RawSendRequest {
            data: Bytes::from_static(b"payload"),
        };
        let encoded = req.encode();
        assert_eq!(&encoded[0..4], &7u32.to_le_bytes());
        assert_eq!(RawSendRequest::decode(&encoded).unwrap(), req);
    }

    #[test]
    fn test_raw_send_length_mismatch_rejected() {
        let mut encoded = RawSendRequest {
            data: Bytes::from_static(b"abc"),
        }
        .encode()
        .to_vec();
        encoded[0] = 9; // lie about the length
        assert!(RawSendRequest::decode(&encoded).is_err());
    }

    #[test]
    fn test_raw_send_zero_length_rejected() {
        let encoded = 0u32.to_le_bytes();
        assert!(RawSendRequest::decode(&encoded).is_err());
    }

    #[test]
    fn test_spi_master_config_roundtrip() {
        let cfg = SpiMasterConfigResponse {
            mode: 0x0003,
            flags: 0x0001,
            bits_per_word_mask: 0x0000_0080,
            num_chipselect: 2,
            min_speed_hz: 10_000,
            max_speed_hz: 48_000_000,
        };
        let encoded = cfg.encode();
        assert_eq!(encoded.len(), SpiMasterConfigResponse::SIZE);
        assert_eq!(SpiMasterConfigResponse::decode(&encoded).unwrap(), cfg);
    }

    #[test]
    fn test_spi_device_config_roundtrip() {
        let mut name = [0u8; 32];
        name[..7].copy_from_slice(b"flash-0");
        let cfg = SpiDeviceConfigResponse {
            mode: 0,
            bits_per_word: 8,
            max_speed_hz: 1_000_000,
            name,
        };
        let decoded = SpiDeviceConfigResponse::decode(&cfg.encode()).unwrap();
        assert_eq!(decoded, cfg);
        assert_eq!(decoded.name_str(), "flash-0");
    }

    #[test]
    fn test_spi_transfer_descriptor_roundtrip() {
        let desc = SpiTransferDescriptor {
            speed_hz: 500_000,
            len: 64,
            delay_usecs: 10,
            cs_change: 1,
            bits_per_word: 8,
            rdwr: SPI_XFER_WRITE | SPI_XFER_READ,
        };
        assert_eq!(
            SpiTransferDescriptor::decode(&desc.encode()).unwrap(),
            desc
        );
    }

    #[test]
    fn test_spi_transfer_request_header_layout() {
        let hdr = SpiTransferRequestHeader {
            count: 0x0201,
            mode: 3,
            chip_select: 1,
        };
        assert_eq!(hdr.encode(), [0x01, 0x02, 3, 1]);
        assert_eq!(
            SpiTransferRequestHeader::decode(&hdr.encode()).unwrap(),
            hdr
        );
    }
}
