//! Operation lifecycle and matching.
//!
//! An operation is one request/response (or one-way) exchange on a
//! connection. The engine never blocks the transport-facing send path:
//! `submit` is a non-blocking handoff to the host transport, and
//! completion is driven by the asynchronous receive path (or a deadline)
//! signalling the operation's oneshot waiter. `send_sync` is the
//! blocking convenience wrapper drivers see; `wait` is an ordinary
//! future for callers that need to poll or race it themselves.
//!
//! # Identifiers
//!
//! Operation ids are 16-bit, scoped to one connection, allocated from a
//! wrapping cycle counter that skips 0 (reserved for unidirectional
//! messages) and any id still in flight. An id becomes reusable only
//! when its in-flight entry is removed, the same instant its waiter is
//! woken, so an id is never shared by two live operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{GreybusError, Result};
use crate::wire::{build_frame, OperationHeader, TYPE_INVALID, TYPE_RESPONSE_FLAG};

/// Completion state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationState {
    Pending = 0,
    Completed = 1,
    TimedOut = 2,
    Cancelled = 3,
}

impl OperationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Completed,
            2 => Self::TimedOut,
            3 => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// In-flight side of an operation: the waiter to wake and the state
/// cell shared with the driver-held `Operation`.
pub(crate) struct Waiter {
    tx: oneshot::Sender<Result<Bytes>>,
    state: Arc<AtomicU8>,
}

impl Waiter {
    /// Move the operation to a terminal state and wake the waiter.
    fn finish(self, state: OperationState, result: Result<Bytes>) {
        self.state.store(state as u8, Ordering::Release);
        // The receiver may already be gone (dropped operation); that is
        // not an error.
        let _ = self.tx.send(result);
    }
}

/// Per-connection in-flight operation set plus the id cycle counter.
/// Guarded by one mutex so allocation, insertion, completion, and
/// cancellation are mutually exclusive.
#[derive(Default)]
pub(crate) struct Inflight {
    ops: HashMap<u16, Waiter>,
    cycle: u16,
}

/// One request/response (or one-way) exchange in progress.
pub struct Operation {
    connection: Arc<Connection>,
    id: u16,
    op_type: u8,
    request: Bytes,
    response_capacity: usize,
    state: Arc<AtomicU8>,
    rx: Option<oneshot::Receiver<Result<Bytes>>>,
}

impl Operation {
    /// The operation id.
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The request type code.
    #[inline]
    pub fn op_type(&self) -> u8 {
        self.op_type
    }

    /// Current completion state.
    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Hand the request frame to the host transport.
    ///
    /// Non-blocking: transmission and completion happen asynchronously.
    /// A synchronous send failure removes the in-flight entry and is
    /// returned to the caller directly.
    pub fn submit(&mut self) -> Result<()> {
        if self.state() != OperationState::Pending {
            return Err(GreybusError::InvalidState(
                "operation already completed".to_string(),
            ));
        }

        let header = OperationHeader::request(self.id, self.op_type, self.request.len());
        let frame = build_frame(&header, &self.request);

        self.connection
            .hd()
            .driver()
            .message_send(self.connection.intf_cport_id(), frame)
            .map_err(|err| {
                if let Some(waiter) = self.connection.remove_waiter(self.id) {
                    waiter.state.store(OperationState::Cancelled as u8, Ordering::Release);
                }
                err
            })
    }

    /// Suspend until the operation completes, times out, or is
    /// cancelled; returns the response payload on success.
    ///
    /// A timeout removes the in-flight entry, asks the transport to
    /// abort the send if it still can, and feeds the host device's
    /// consecutive-timeout accounting.
    pub async fn wait(mut self) -> Result<Bytes> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(GreybusError::Cancelled),
        };

        let deadline = self.connection.hd().config().operation_timeout;
        let cport_id = self.connection.hd_cport_id();

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => {
                match &result {
                    // A response arrived (even a failure report), so the
                    // link is alive.
                    Ok(_) | Err(GreybusError::Remote(_)) => {
                        self.connection.hd().error_accounting(cport_id, false);
                    }
                    Err(_) => {}
                }
                let payload = result?;
                if payload.len() > self.response_capacity {
                    return Err(GreybusError::MalformedFrame(format!(
                        "response payload {} exceeds declared capacity {}",
                        payload.len(),
                        self.response_capacity
                    )));
                }
                Ok(payload)
            }
            // Waiter dropped without a completion: teardown raced us.
            Ok(Err(_)) => Err(GreybusError::Cancelled),
            Err(_) => {
                self.connection.remove_waiter(self.id);
                self.state
                    .store(OperationState::TimedOut as u8, Ordering::Release);
                self.connection
                    .hd()
                    .driver()
                    .message_cancel(self.connection.intf_cport_id(), self.id);
                self.connection.hd().error_accounting(cport_id, true);
                Err(GreybusError::Timeout)
            }
        }
    }

    /// Cancel this operation: best-effort abort of the in-flight send,
    /// logical transition to `Cancelled`, and the waiter is woken.
    pub fn cancel(&mut self) {
        if let Some(waiter) = self.connection.remove_waiter(self.id) {
            waiter.finish(OperationState::Cancelled, Err(GreybusError::Cancelled));
        }
        self.connection
            .hd()
            .driver()
            .message_cancel(self.connection.intf_cport_id(), self.id);
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        // A pending operation whose result was never consumed must not
        // leave its id in the in-flight set.
        if self.rx.is_some() && self.state() == OperationState::Pending {
            if let Some(waiter) = self.connection.remove_waiter(self.id) {
                waiter
                    .state
                    .store(OperationState::Cancelled as u8, Ordering::Release);
            }
        }
    }
}

fn validate_type(op_type: u8) -> Result<()> {
    if op_type == TYPE_INVALID || op_type & TYPE_RESPONSE_FLAG != 0 {
        return Err(GreybusError::MalformedFrame(format!(
            "reserved type code 0x{op_type:02x}"
        )));
    }
    Ok(())
}

impl Connection {
    /// Allocate a fresh operation with a unique id on this connection.
    ///
    /// Fails with `ResourceExhausted` when the id space or the in-flight
    /// limit is saturated, or when the request or declared response size
    /// exceeds the transport's maximum payload, checked before any
    /// allocation or transmission.
    pub fn operation_create(
        self: &Arc<Self>,
        op_type: u8,
        request: Bytes,
        response_capacity: usize,
    ) -> Result<Operation> {
        validate_type(op_type)?;
        self.ensure_sendable(false)?;

        let payload_max = self.hd().payload_size_max();
        if request.len() > payload_max {
            return Err(GreybusError::ResourceExhausted(format!(
                "request payload {} exceeds transport maximum {}",
                request.len(),
                payload_max
            )));
        }
        if response_capacity > payload_max {
            return Err(GreybusError::ResourceExhausted(format!(
                "response capacity {} exceeds transport maximum {}",
                response_capacity, payload_max
            )));
        }

        let (tx, rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(OperationState::Pending as u8));

        let id = {
            let mut inflight = self.inflight_mut();

            let limit = self.hd().config().max_in_flight.min(u16::MAX as usize);
            if inflight.ops.len() >= limit {
                return Err(GreybusError::ResourceExhausted(format!(
                    "in-flight operation limit {limit} reached"
                )));
            }

            let id = loop {
                inflight.cycle = inflight.cycle.wrapping_add(1);
                let candidate = inflight.cycle;
                if candidate == 0 {
                    continue;
                }
                if !inflight.ops.contains_key(&candidate) {
                    break candidate;
                }
            };

            inflight.ops.insert(
                id,
                Waiter {
                    tx,
                    state: state.clone(),
                },
            );
            id
        };

        Ok(Operation {
            connection: self.clone(),
            id,
            op_type,
            request,
            response_capacity,
            state,
            rx: Some(rx),
        })
    }

    /// Submit a request and suspend until its response, timeout, or
    /// cancellation. The blocking call drivers build on.
    pub async fn send_sync(
        self: &Arc<Self>,
        op_type: u8,
        request: Bytes,
        response_capacity: usize,
    ) -> Result<Bytes> {
        let mut operation = self.operation_create(op_type, request, response_capacity)?;
        operation.submit()?;
        operation.wait().await
    }

    /// Fire-and-forget message (operation id 0, no response expected).
    ///
    /// Delivery is best-effort but send-time errors are surfaced
    /// immediately.
    pub fn send_unidirectional(&self, op_type: u8, request: Bytes) -> Result<()> {
        validate_type(op_type)?;
        self.ensure_sendable(true)?;

        let payload_max = self.hd().payload_size_max();
        if request.len() > payload_max {
            return Err(GreybusError::ResourceExhausted(format!(
                "request payload {} exceeds transport maximum {}",
                request.len(),
                payload_max
            )));
        }

        let header = OperationHeader::request(0, op_type, request.len());
        self.hd()
            .driver()
            .message_send(self.intf_cport_id(), build_frame(&header, &request))
    }

    /// Cancel every pending operation on this connection.
    ///
    /// Each waiter is woken exactly once with `Cancelled`; no operation
    /// is left pending when this returns. Used on teardown and explicit
    /// caller cancellation.
    pub fn cancel_all(&self) {
        let drained: Vec<(u16, Waiter)> = self.inflight_mut().ops.drain().collect();
        for (id, waiter) in drained {
            waiter.finish(OperationState::Cancelled, Err(GreybusError::Cancelled));
            self.hd().driver().message_cancel(self.intf_cport_id(), id);
        }
    }

    /// Number of operations currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight_mut().ops.len()
    }

    /// Receive-path completion: match a response frame to its operation.
    ///
    /// A frame referencing an unknown or stale id is discarded without
    /// touching any other operation's state.
    pub(crate) fn complete_operation(&self, operation_id: u16, result: Result<Bytes>) {
        let waiter = self.inflight_mut().ops.remove(&operation_id);
        match waiter {
            Some(waiter) => waiter.finish(OperationState::Completed, result),
            None => {
                tracing::warn!(
                    connection = self.name(),
                    operation_id,
                    "response for unknown operation discarded"
                );
            }
        }
    }

    pub(crate) fn remove_waiter(&self, operation_id: u16) -> Option<Waiter> {
        self.inflight_mut().ops.remove(&operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostDevice, HostTransport};
    use crate::protocol::{flags, Protocol, ProtocolHandler, ProtocolRegistry};
    use crate::wire::{Frame, HEADER_SIZE};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    struct NullHandler;
    impl ProtocolHandler for NullHandler {}

    /// Loopback transport: echoes every two-way request back as a
    /// success response carrying the request payload. Unidirectional
    /// frames and responses are recorded.
    struct EchoTransport {
        hd: OnceLock<Arc<HostDevice>>,
        sent: Mutex<Vec<Bytes>>,
        cancels: AtomicUsize,
        /// When set, two-way requests get no response (timeout tests).
        mute: std::sync::atomic::AtomicBool,
    }

    impl EchoTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hd: OnceLock::new(),
                sent: Mutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
                mute: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl HostTransport for EchoTransport {
        fn message_send(&self, dest_cport_id: u16, frame: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push(frame.clone());

            let header = OperationHeader::decode(&frame).unwrap();
            if header.is_response()
                || header.is_unidirectional()
                || self.mute.load(Ordering::SeqCst)
            {
                return Ok(());
            }

            let response = OperationHeader::response(&header, 0, frame.len() - HEADER_SIZE);
            let bytes = build_frame(&response, &frame[HEADER_SIZE..]);
            if let Some(hd) = self.hd.get() {
                hd.data_received(dest_cport_id, &bytes);
            }
            Ok(())
        }

        fn message_cancel(&self, _dest_cport_id: u16, _operation_id: u16) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> HostConfig {
        HostConfig {
            operation_timeout: Duration::from_millis(50),
            ..HostConfig::default()
        }
    }

    async fn active_connection(
        transport: &Arc<EchoTransport>,
        cfg: HostConfig,
    ) -> Arc<Connection> {
        let hd = HostDevice::new(transport.clone(), cfg);
        let _ = transport.hd.set(hd.clone());

        let registry = ProtocolRegistry::new();
        registry
            .register(Protocol::new(
                "test",
                0x02,
                1,
                0,
                flags::SKIP_VERSION | flags::SKIP_CONNECTED | flags::SKIP_DISCONNECTED,
                Arc::new(NullHandler),
            ))
            .unwrap();

        let connection = Connection::create(&hd, Some(0), 0, 0x02).unwrap();
        connection.init(&registry).await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_send_sync_round_trip() {
        let transport = EchoTransport::new();
        let connection = active_connection(&transport, config()).await;

        let response = connection
            .send_sync(0x04, Bytes::from_static(b"ping"), 64)
            .await
            .unwrap();
        assert_eq!(&response[..], b"ping");
        assert_eq!(connection.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_operation_ids_unique_while_in_flight() {
        let transport = EchoTransport::new();
        transport.mute.store(true, Ordering::SeqCst);
        let connection = active_connection(&transport, config()).await;

        let ops: Vec<Operation> = (0..16)
            .map(|_| {
                connection
                    .operation_create(0x04, Bytes::from_static(b"x"), 16)
                    .unwrap()
            })
            .collect();

        let mut ids: Vec<u16> = ops.iter().map(|op| op.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert!(ids.iter().all(|&id| id != 0));

        drop(ops);
        assert_eq!(connection.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_id_reusable_only_after_terminal_state() {
        let transport = EchoTransport::new();
        transport.mute.store(true, Ordering::SeqCst);
        let connection = active_connection(&transport, config()).await;

        let first = connection
            .operation_create(0x04, Bytes::new(), 16)
            .unwrap();
        let first_id = first.id();

        // While in flight, new allocations avoid the id.
        let second = connection
            .operation_create(0x04, Bytes::new(), 16)
            .unwrap();
        assert_ne!(second.id(), first_id);

        // Complete the first; the cycle counter will lap the id space
        // before handing it out again, but the entry is gone.
        connection.complete_operation(first_id, Ok(Bytes::new()));
        assert_eq!(first.state(), OperationState::Completed);
        assert_eq!(connection.inflight_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_before_send() {
        let transport = EchoTransport::new();
        let connection = active_connection(&transport, config()).await;
        let before = transport.sent.lock().unwrap().len();

        let payload = Bytes::from(vec![0u8; connection.hd().payload_size_max() + 1]);
        let result = connection.operation_create(0x04, payload, 0);
        assert!(matches!(result, Err(GreybusError::ResourceExhausted(_))));

        // No partial frame went out.
        assert_eq!(transport.sent.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_oversized_response_capacity_rejected() {
        let transport = EchoTransport::new();
        let connection = active_connection(&transport, config()).await;

        let result = connection.operation_create(
            0x04,
            Bytes::new(),
            connection.hd().payload_size_max() + 1,
        );
        assert!(matches!(result, Err(GreybusError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_in_flight_limit_enforced() {
        let transport = EchoTransport::new();
        transport.mute.store(true, Ordering::SeqCst);
        let connection = active_connection(
            &transport,
            HostConfig {
                max_in_flight: 2,
                ..config()
            },
        )
        .await;

        let _a = connection
            .operation_create(0x04, Bytes::new(), 0)
            .unwrap();
        let _b = connection
            .operation_create(0x04, Bytes::new(), 0)
            .unwrap();
        let c = connection.operation_create(0x04, Bytes::new(), 0);
        assert!(matches!(c, Err(GreybusError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_stale_response_discarded() {
        let transport = EchoTransport::new();
        transport.mute.store(true, Ordering::SeqCst);
        let connection = active_connection(&transport, config()).await;

        let live = connection
            .operation_create(0x04, Bytes::new(), 16)
            .unwrap();

        // Response for an id nothing is waiting on.
        let stale = OperationHeader {
            size: HEADER_SIZE as u16,
            operation_id: live.id().wrapping_add(7),
            op_type: 0x04 | TYPE_RESPONSE_FLAG,
            result: 0,
        };
        connection
            .hd()
            .data_received(0, &build_frame(&stale, b""));

        // The live operation is untouched.
        assert_eq!(live.state(), OperationState::Pending);
        assert_eq!(connection.inflight_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_every_waiter_once() {
        let transport = EchoTransport::new();
        transport.mute.store(true, Ordering::SeqCst);
        let connection = active_connection(&transport, config()).await;

        let mut ops = Vec::new();
        for _ in 0..8 {
            let mut op = connection
                .operation_create(0x04, Bytes::new(), 16)
                .unwrap();
            op.submit().unwrap();
            ops.push(op);
        }
        assert_eq!(connection.inflight_count(), 8);

        connection.cancel_all();
        assert_eq!(connection.inflight_count(), 0);

        for op in ops {
            assert_eq!(op.state(), OperationState::Cancelled);
            assert!(matches!(op.wait().await, Err(GreybusError::Cancelled)));
        }
    }

    #[tokio::test]
    async fn test_timeout_marks_operation_and_cancels_send() {
        let transport = EchoTransport::new();
        transport.mute.store(true, Ordering::SeqCst);
        let connection = active_connection(&transport, config()).await;

        let result = connection.send_sync(0x04, Bytes::new(), 16).await;
        assert!(matches!(result, Err(GreybusError::Timeout)));
        assert_eq!(connection.inflight_count(), 0);
        assert!(transport.cancels.load(Ordering::SeqCst) >= 1);
        assert_eq!(connection.hd().timeout_count(), 1);
    }

    #[tokio::test]
    async fn test_unidirectional_send_and_error_surface() {
        let transport = EchoTransport::new();
        let connection = active_connection(&transport, config()).await;

        connection
            .send_unidirectional(0x04, Bytes::from_static(b"fire"))
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        let frame = Frame::parse(sent.last().unwrap(), 2048).unwrap();
        assert_eq!(frame.operation_id(), 0);
        assert_eq!(frame.payload(), b"fire");
    }

    #[tokio::test]
    async fn test_reserved_type_codes_rejected() {
        let transport = EchoTransport::new();
        let connection = active_connection(&transport, config()).await;

        assert!(connection
            .operation_create(0x00, Bytes::new(), 0)
            .is_err());
        assert!(connection
            .operation_create(0x84, Bytes::new(), 0)
            .is_err());
        assert!(connection
            .send_unidirectional(0x80, Bytes::new())
            .is_err());
    }

    #[tokio::test]
    async fn test_remote_error_result_surfaces() {
        struct FailTransport {
            hd: OnceLock<Arc<HostDevice>>,
        }
        impl HostTransport for FailTransport {
            fn message_send(&self, dest_cport_id: u16, frame: Bytes) -> Result<()> {
                let header = OperationHeader::decode(&frame).unwrap();
                if header.is_response() || header.is_unidirectional() {
                    return Ok(());
                }
                // Report protocol failure (result 0x04) with no payload.
                let response = OperationHeader::response(&header, 0x04, 0);
                if let Some(hd) = self.hd.get() {
                    hd.data_received(dest_cport_id, &build_frame(&response, b""));
                }
                Ok(())
            }
        }

        let transport = Arc::new(FailTransport {
            hd: OnceLock::new(),
        });
        let hd = HostDevice::new(transport.clone(), config());
        let _ = transport.hd.set(hd.clone());

        let registry = ProtocolRegistry::new();
        registry
            .register(Protocol::new(
                "test",
                0x02,
                1,
                0,
                flags::SKIP_VERSION | flags::SKIP_CONNECTED | flags::SKIP_DISCONNECTED,
                Arc::new(NullHandler),
            ))
            .unwrap();
        let connection = Connection::create(&hd, Some(0), 0, 0x02).unwrap();
        connection.init(&registry).await.unwrap();

        let result = connection.send_sync(0x04, Bytes::new(), 16).await;
        assert!(matches!(result, Err(GreybusError::Remote(_))));
        // An answered operation resets the timeout counter.
        assert_eq!(connection.hd().timeout_count(), 0);
    }
}
