//! Raw protocol driver: an arbitrary byte pipe over one connection.
//!
//! Inbound data arrives as unidirectional or two-way send requests and
//! is queued per-connection, oldest first, bounded by a total-bytes
//! high-watermark; the producer is rejected on overflow rather than
//! growing without bound. Outbound writes are chunked at the packet
//! limit and sent as unidirectional operations. A single exclusive
//! handle is enforced per session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::connection::Connection;
use crate::error::{GreybusError, Result};
use crate::protocol::{BoxFuture, Protocol, ProtocolHandler};
use crate::wire::RawSendRequest;

/// Raw protocol id.
pub const PROTOCOL_RAW: u8 = 0xfe;

/// Raw protocol version.
pub const RAW_VERSION_MAJOR: u8 = 0;
pub const RAW_VERSION_MINOR: u8 = 1;

/// Send request type code.
pub const RAW_TYPE_SEND: u8 = 0x02;

/// Maximum size of any one send data buffer we support.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Maximum queued receive bytes before the producer is rejected.
pub const MAX_DATA_SIZE: usize = MAX_PACKET_SIZE * 8;

struct RawQueue {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
    shutdown: bool,
}

/// Per-connection raw session: the bounded receive queue and the
/// exclusive-open flag.
pub struct RawSession {
    connection: Arc<Connection>,
    queue: Mutex<RawQueue>,
    readable: Notify,
    open_excl: AtomicBool,
}

impl RawSession {
    fn new(connection: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            queue: Mutex::new(RawQueue {
                chunks: VecDeque::new(),
                total_bytes: 0,
                shutdown: false,
            }),
            readable: Notify::new(),
            open_excl: AtomicBool::new(false),
        })
    }

    /// The session bound to a connection by the raw protocol driver.
    pub fn for_connection(connection: &Connection) -> Option<Arc<Self>> {
        connection.private::<RawSession>()
    }

    /// Claim the single exclusive handle on this session.
    pub fn open(self: &Arc<Self>) -> Result<RawHandle> {
        if self.open_excl.swap(true, Ordering::AcqRel) {
            return Err(GreybusError::InvalidState(
                "raw session already open".to_string(),
            ));
        }
        Ok(RawHandle {
            session: self.clone(),
        })
    }

    /// Queue one received chunk.
    ///
    /// Rejects chunks over the packet limit and chunks that would push
    /// the queue past the high-watermark; earlier chunks stay readable
    /// in FIFO order either way.
    pub(crate) fn receive(&self, data: Bytes) -> Result<()> {
        if data.len() > MAX_PACKET_SIZE {
            tracing::warn!(
                connection = self.connection.name(),
                "too big of a data packet, rejected"
            );
            return Err(GreybusError::ResourceExhausted(format!(
                "packet of {} bytes exceeds limit {}",
                data.len(),
                MAX_PACKET_SIZE
            )));
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.total_bytes + data.len() > MAX_DATA_SIZE {
            tracing::warn!(
                connection = self.connection.name(),
                "too much data in receive buffer, dropping packets"
            );
            return Err(GreybusError::ResourceExhausted(format!(
                "receive buffer high-watermark {MAX_DATA_SIZE} reached"
            )));
        }

        queue.total_bytes += data.len();
        queue.chunks.push_back(data);
        drop(queue);

        self.readable.notify_one();
        Ok(())
    }

    /// Pop the oldest queued chunk without waiting.
    pub fn try_recv(&self) -> Option<Bytes> {
        let mut queue = self.queue.lock().unwrap();
        let chunk = queue.chunks.pop_front()?;
        queue.total_bytes -= chunk.len();
        Some(chunk)
    }

    /// Wait for the next chunk, oldest first.
    pub async fn recv(&self) -> Result<Bytes> {
        loop {
            let notified = self.readable.notified();
            {
                let mut queue = self.queue.lock().unwrap();
                if let Some(chunk) = queue.chunks.pop_front() {
                    queue.total_bytes -= chunk.len();
                    return Ok(chunk);
                }
                if queue.shutdown {
                    return Err(GreybusError::InvalidState(
                        "raw session destroyed".to_string(),
                    ));
                }
            }
            notified.await;
        }
    }

    /// Send bytes to the peer, chunked at the packet limit.
    ///
    /// A zero-length send is an error, not a no-op.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(GreybusError::MalformedFrame(
                "raw send of 0 bytes".to_string(),
            ));
        }

        let budget = self
            .connection
            .hd()
            .payload_size_max()
            .saturating_sub(RawSendRequest::PREFIX_SIZE);
        let chunk_max = MAX_PACKET_SIZE.min(budget);
        if chunk_max == 0 {
            return Err(GreybusError::ResourceExhausted(
                "transport payload budget too small for raw sends".to_string(),
            ));
        }

        for chunk in data.chunks(chunk_max) {
            let request = RawSendRequest {
                data: Bytes::copy_from_slice(chunk),
            };
            self.connection
                .send_unidirectional(RAW_TYPE_SEND, request.encode())?;
        }
        Ok(())
    }

    /// Bytes currently queued.
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().unwrap().total_bytes
    }

    fn shutdown(&self) {
        self.queue.lock().unwrap().shutdown = true;
        self.readable.notify_waiters();
    }
}

/// The exclusive reader/writer handle on a raw session.
pub struct RawHandle {
    session: Arc<RawSession>,
}

impl RawHandle {
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.session.send(data)
    }

    pub async fn recv(&self) -> Result<Bytes> {
        self.session.recv().await
    }

    pub fn try_recv(&self) -> Option<Bytes> {
        self.session.try_recv()
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        self.session.open_excl.store(false, Ordering::Release);
    }
}

/// Protocol handler wiring a `RawSession` onto each connection.
pub struct RawProtocol;

impl ProtocolHandler for RawProtocol {
    fn connection_init(&self, connection: Arc<Connection>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let session = RawSession::new(connection.clone());
            connection.set_private(session);
            Ok(())
        })
    }

    fn connection_exit(&self, connection: Arc<Connection>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Some(session) = RawSession::for_connection(&connection) {
                session.shutdown();
            }
        })
    }

    fn request_received(
        &self,
        connection: &Arc<Connection>,
        op_type: u8,
        payload: Bytes,
    ) -> Result<Bytes> {
        let session = RawSession::for_connection(connection).ok_or_else(|| {
            GreybusError::InvalidState("raw device initialization incomplete".to_string())
        })?;

        if op_type != RAW_TYPE_SEND {
            return Err(GreybusError::MalformedFrame(format!(
                "unknown request type 0x{op_type:02x}"
            )));
        }

        let request = RawSendRequest::decode(&payload)?;
        session.receive(request.data)?;
        Ok(Bytes::new())
    }
}

/// The raw protocol descriptor, ready to register.
pub fn raw_protocol() -> Arc<Protocol> {
    Protocol::new(
        "raw",
        PROTOCOL_RAW,
        RAW_VERSION_MAJOR,
        RAW_VERSION_MINOR,
        0,
        Arc::new(RawProtocol),
    )
}
