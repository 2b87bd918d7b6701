//! Wire module - frame layout and shared protocol message definitions.
//!
//! This module implements the binary protocol carried over each cport:
//! - 8-byte operation header encoding/decoding
//! - Frame parsing with receive-path validation
//! - Packed little-endian message structs shared across protocols

mod frame;
mod header;
mod messages;

pub use frame::{build_frame, Frame};
pub use header::{
    OperationHeader, OperationResult, HEADER_SIZE, TYPE_CONNECTED, TYPE_DISCONNECTED,
    TYPE_INVALID, TYPE_PROTOCOL_VERSION, TYPE_RESPONSE_FLAG,
};
pub use messages::{
    CportNotify, RawSendRequest, SpiDeviceConfigRequest, SpiDeviceConfigResponse,
    SpiMasterConfigResponse, SpiTransferDescriptor, SpiTransferRequestHeader, VersionInfo,
    SPI_XFER_READ, SPI_XFER_WRITE,
};
