//! SPI bridge driver for the "generic" SPI module.
//!
//! Master configuration and per-device configuration are fetched with
//! synchronous operations at connection setup. Bulk transfers pack an
//! ordered sequence of transfer descriptors into one operation request;
//! when the combined header + descriptor + data size would exceed the
//! transport payload budget, the sequence is split across multiple
//! operations, at byte granularity inside a transfer if needed, and
//! the response data is demultiplexed back into the original
//! per-transfer boundaries.
//!
//! The packing contract: total bytes transferred across all split
//! operations equals the original transfer length, and boundaries are
//! reconstructed exactly on response decode.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{GreybusError, Result};
use crate::protocol::{BoxFuture, Protocol, ProtocolHandler};
use crate::wire::{
    SpiDeviceConfigRequest, SpiDeviceConfigResponse, SpiMasterConfigResponse,
    SpiTransferDescriptor, SpiTransferRequestHeader, SPI_XFER_READ, SPI_XFER_WRITE,
};

/// SPI protocol id.
pub const PROTOCOL_SPI: u8 = 0x0b;

/// SPI protocol version.
pub const SPI_VERSION_MAJOR: u8 = 0;
pub const SPI_VERSION_MINOR: u8 = 1;

/// Request type codes.
pub const SPI_TYPE_MASTER_CONFIG: u8 = 0x02;
pub const SPI_TYPE_DEVICE_CONFIG: u8 = 0x03;
pub const SPI_TYPE_TRANSFER: u8 = 0x04;

/// One transfer in a message: outbound data, inbound buffer, or both.
#[derive(Debug, Clone)]
pub struct SpiTransfer {
    pub speed_hz: u32,
    pub delay_usecs: u16,
    /// Deassert chip select after this transfer completes.
    pub cs_change: bool,
    pub bits_per_word: u8,
    /// Outbound bytes, if writing.
    pub tx: Option<Vec<u8>>,
    /// Inbound buffer, pre-sized, filled on completion if reading.
    pub rx: Option<Vec<u8>>,
}

impl SpiTransfer {
    /// A write-only transfer.
    pub fn write(data: Vec<u8>) -> Self {
        Self {
            speed_hz: 0,
            delay_usecs: 0,
            cs_change: false,
            bits_per_word: 8,
            tx: Some(data),
            rx: None,
        }
    }

    /// A read-only transfer of `len` bytes.
    pub fn read(len: usize) -> Self {
        Self {
            speed_hz: 0,
            delay_usecs: 0,
            cs_change: false,
            bits_per_word: 8,
            tx: None,
            rx: Some(vec![0; len]),
        }
    }

    /// A full-duplex transfer: write `data`, read the same length back.
    pub fn write_read(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            speed_hz: 0,
            delay_usecs: 0,
            cs_change: false,
            bits_per_word: 8,
            tx: Some(data),
            rx: Some(vec![0; len]),
        }
    }

    fn is_tx(&self) -> bool {
        self.tx.is_some()
    }

    fn is_rx(&self) -> bool {
        self.rx.is_some()
    }

    /// Transfer length in bytes.
    pub fn len(&self) -> usize {
        match (&self.tx, &self.rx) {
            (Some(tx), _) => tx.len(),
            (None, Some(rx)) => rx.len(),
            (None, None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self) -> Result<()> {
        if !self.is_tx() && !self.is_rx() {
            return Err(GreybusError::MalformedFrame(
                "bufferless transfer".to_string(),
            ));
        }
        if self.is_empty() {
            return Err(GreybusError::MalformedFrame(
                "zero-length transfer".to_string(),
            ));
        }
        if let (Some(tx), Some(rx)) = (&self.tx, &self.rx) {
            if tx.len() != rx.len() {
                return Err(GreybusError::MalformedFrame(format!(
                    "tx/rx length mismatch ({} vs {})",
                    tx.len(),
                    rx.len()
                )));
            }
        }
        Ok(())
    }

    fn rdwr(&self) -> u8 {
        let mut bits = 0;
        if self.is_tx() {
            bits |= SPI_XFER_WRITE;
        }
        if self.is_rx() {
            bits |= SPI_XFER_READ;
        }
        bits
    }
}

/// A byte range of one original transfer carried by one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    xfer: usize,
    offset: usize,
    len: usize,
}

/// The segments one operation carries.
#[derive(Debug, Default)]
struct Batch {
    segments: Vec<Segment>,
}

/// Split a transfer sequence into operation-sized batches.
///
/// Per batch: `request header + descriptors + tx bytes <= payload_max`
/// and `rx bytes <= payload_max`. Transfers are split at byte
/// granularity when the last one does not fully fit; per-transfer
/// boundaries are preserved in the segment list so the response decode
/// can reassemble them exactly.
fn pack_transfers(transfers: &[SpiTransfer], payload_max: usize) -> Result<Vec<Batch>> {
    const DESC: usize = SpiTransferDescriptor::SIZE;

    let request_budget = payload_max
        .checked_sub(SpiTransferRequestHeader::SIZE)
        .filter(|&budget| budget > DESC)
        .ok_or_else(|| {
            GreybusError::ResourceExhausted(format!(
                "payload budget {payload_max} cannot hold a transfer request"
            ))
        })?;
    let response_budget = payload_max;

    let mut batches = Vec::new();
    let mut current = Batch::default();
    let mut used_tx = 0usize;
    let mut used_rx = 0usize;

    for (index, transfer) in transfers.iter().enumerate() {
        transfer.validate()?;

        let total = transfer.len();
        let mut offset = 0;

        while offset < total {
            let remaining = total - offset;

            // Room for this segment's descriptor?
            let request_used = current.segments.len() * DESC + used_tx;
            let request_avail = request_budget.checked_sub(request_used + DESC);

            let max_by_tx = match request_avail {
                None => 0,
                Some(avail) if transfer.is_tx() => avail,
                Some(_) => usize::MAX,
            };
            let max_by_rx = if transfer.is_rx() {
                response_budget - used_rx
            } else {
                usize::MAX
            };

            let seg_len = remaining.min(max_by_tx).min(max_by_rx);
            if seg_len == 0 {
                // This batch is full; start a new one. A fresh batch
                // always makes progress because the budget fits at
                // least one descriptor plus one data byte.
                if current.segments.is_empty() {
                    return Err(GreybusError::ResourceExhausted(
                        "transfer cannot make progress within payload budget".to_string(),
                    ));
                }
                batches.push(std::mem::take(&mut current));
                used_tx = 0;
                used_rx = 0;
                continue;
            }

            current.segments.push(Segment {
                xfer: index,
                offset,
                len: seg_len,
            });
            if transfer.is_tx() {
                used_tx += seg_len;
            }
            if transfer.is_rx() {
                used_rx += seg_len;
            }
            offset += seg_len;
        }
    }

    if !current.segments.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

impl Batch {
    /// Inbound bytes this batch's response will carry.
    fn rx_len(&self, transfers: &[SpiTransfer]) -> usize {
        self.segments
            .iter()
            .filter(|seg| transfers[seg.xfer].is_rx())
            .map(|seg| seg.len)
            .sum()
    }

    /// Encode this batch as one transfer-request payload.
    fn encode(&self, transfers: &[SpiTransfer], mode: u8, chip_select: u8) -> Bytes {
        let header = SpiTransferRequestHeader {
            count: self.segments.len() as u16,
            mode,
            chip_select,
        };

        let tx_len: usize = self
            .segments
            .iter()
            .filter(|seg| transfers[seg.xfer].is_tx())
            .map(|seg| seg.len)
            .sum();
        let mut buf = Vec::with_capacity(
            SpiTransferRequestHeader::SIZE
                + self.segments.len() * SpiTransferDescriptor::SIZE
                + tx_len,
        );
        buf.extend_from_slice(&header.encode());

        for seg in &self.segments {
            let transfer = &transfers[seg.xfer];
            let final_segment = seg.offset + seg.len == transfer.len();
            let descriptor = SpiTransferDescriptor {
                speed_hz: transfer.speed_hz,
                len: seg.len as u32,
                // Delay and chip-select release apply where the original
                // transfer ends, not at split points inside it.
                delay_usecs: if final_segment { transfer.delay_usecs } else { 0 },
                cs_change: u8::from(final_segment && transfer.cs_change),
                bits_per_word: transfer.bits_per_word,
                rdwr: transfer.rdwr(),
            };
            buf.extend_from_slice(&descriptor.encode());
        }

        for seg in &self.segments {
            if let Some(tx) = &transfers[seg.xfer].tx {
                buf.extend_from_slice(&tx[seg.offset..seg.offset + seg.len]);
            }
        }

        Bytes::from(buf)
    }

    /// Demultiplex one response payload back into the original transfer
    /// rx buffers.
    fn decode_response(&self, transfers: &mut [SpiTransfer], payload: &[u8]) -> Result<()> {
        let expected = self.rx_len(transfers);
        if payload.len() != expected {
            return Err(GreybusError::MalformedFrame(format!(
                "transfer response carries {} bytes, expected {}",
                payload.len(),
                expected
            )));
        }

        let mut cursor = 0;
        for seg in &self.segments {
            let transfer = &mut transfers[seg.xfer];
            if let Some(rx) = &mut transfer.rx {
                rx[seg.offset..seg.offset + seg.len]
                    .copy_from_slice(&payload[cursor..cursor + seg.len]);
                cursor += seg.len;
            }
        }
        Ok(())
    }
}

/// Per-device configuration reported by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiDeviceConfig {
    pub chip_select: u8,
    pub mode: u16,
    pub bits_per_word: u8,
    pub max_speed_hz: u32,
    pub name: String,
}

/// The SPI master behind a connection, configured at setup time.
pub struct SpiMaster {
    connection: Arc<Connection>,
    config: SpiMasterConfigResponse,
    devices: Vec<SpiDeviceConfig>,
}

impl SpiMaster {
    /// The master bound to a connection by the SPI protocol driver.
    pub fn for_connection(connection: &Connection) -> Option<Arc<Self>> {
        connection.private::<SpiMaster>()
    }

    pub fn mode(&self) -> u16 {
        self.config.mode
    }

    pub fn flags(&self) -> u16 {
        self.config.flags
    }

    pub fn bits_per_word_mask(&self) -> u32 {
        self.config.bits_per_word_mask
    }

    pub fn num_chipselect(&self) -> u8 {
        self.config.num_chipselect
    }

    pub fn min_speed_hz(&self) -> u32 {
        self.config.min_speed_hz
    }

    pub fn max_speed_hz(&self) -> u32 {
        self.config.max_speed_hz
    }

    /// Device configurations fetched at setup, one per chip select.
    pub fn devices(&self) -> &[SpiDeviceConfig] {
        &self.devices
    }

    /// Run one message: pack the transfers, issue the operations, and
    /// demultiplex response data back into the rx buffers.
    ///
    /// Returns the total number of bytes moved.
    pub async fn transfer(
        &self,
        chip_select: u8,
        mode: u8,
        transfers: &mut [SpiTransfer],
    ) -> Result<usize> {
        let payload_max = self.connection.hd().payload_size_max();
        let batches = pack_transfers(transfers, payload_max)?;

        let mut moved = 0;
        for batch in &batches {
            let request = batch.encode(transfers, mode, chip_select);
            let rx_len = batch.rx_len(transfers);
            let response = self
                .connection
                .send_sync(SPI_TYPE_TRANSFER, request, rx_len)
                .await?;
            batch.decode_response(transfers, &response)?;
            moved += batch.segments.iter().map(|seg| seg.len).sum::<usize>();
        }
        Ok(moved)
    }
}

/// Protocol handler that fetches the bridge configuration at setup and
/// hangs a [`SpiMaster`] off the connection.
pub struct SpiProtocol;

impl ProtocolHandler for SpiProtocol {
    fn connection_init(&self, connection: Arc<Connection>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let bytes = connection
                .send_sync(
                    SPI_TYPE_MASTER_CONFIG,
                    Bytes::new(),
                    SpiMasterConfigResponse::SIZE,
                )
                .await?;
            let config = SpiMasterConfigResponse::decode(&bytes)?;

            let mut devices = Vec::with_capacity(config.num_chipselect as usize);
            for chip_select in 0..config.num_chipselect {
                let request = SpiDeviceConfigRequest { chip_select };
                let bytes = connection
                    .send_sync(
                        SPI_TYPE_DEVICE_CONFIG,
                        Bytes::copy_from_slice(&request.encode()),
                        SpiDeviceConfigResponse::SIZE,
                    )
                    .await?;
                let response = SpiDeviceConfigResponse::decode(&bytes)?;
                devices.push(SpiDeviceConfig {
                    chip_select,
                    mode: response.mode,
                    bits_per_word: response.bits_per_word,
                    max_speed_hz: response.max_speed_hz,
                    name: response.name_str().to_string(),
                });
            }

            let master = Arc::new(SpiMaster {
                connection: connection.clone(),
                config,
                devices,
            });
            connection.set_private(master);
            Ok(())
        })
    }
}

/// The SPI protocol descriptor, ready to register.
pub fn spi_protocol() -> Arc<Protocol> {
    Protocol::new(
        "spi",
        PROTOCOL_SPI,
        SPI_VERSION_MAJOR,
        SPI_VERSION_MINOR,
        0,
        Arc::new(SpiProtocol),
    )
}
