//! Greybus connections.
//!
//! A connection is the bound pair of a local cport id and a remote cport
//! id layered over one host device, carrying one instance of a versioned
//! protocol. It owns the protocol binding, the negotiated version, the
//! in-flight operation set, and a private slot for the bound driver's
//! own state.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──init──▶ VersionPending ──negotiation──▶ Active
//!    ▲                                                │
//!    └───────── teardown on failure                   │ exit/destroy
//!                                                     ▼
//!                                 Disconnecting ──▶ Destroyed
//! ```
//!
//! `init` binds the newest registered protocol for the connection's
//! protocol id, enables the cport, runs version negotiation (unless the
//! protocol opts out), sends the connected notification, and hands the
//! connection to the protocol's `connection_init`. Teardown cancels all
//! in-flight operations first, always.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::error::{GreybusError, Result};
use crate::host::HostDevice;
use crate::operation::Inflight;
use crate::protocol::{version, ProtocolRegistry};
use crate::protocol::{Protocol, ProtocolRef};
use crate::wire::{
    build_frame, CportNotify, Frame, OperationHeader, OperationResult, VersionInfo,
    TYPE_CONNECTED, TYPE_DISCONNECTED,
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but not yet initialized.
    Created,
    /// Channel enabled, version exchange in progress.
    VersionPending,
    /// Negotiated and carrying driver traffic.
    Active,
    /// Teardown in progress.
    Disconnecting,
    /// Detached from the host device.
    Destroyed,
}

/// A bidirectional link between a local cport and a remote cport,
/// maintaining the state of operations sent over it.
pub struct Connection {
    hd: Arc<HostDevice>,
    hd_cport_id: u16,
    intf_cport_id: u16,
    name: String,
    protocol_id: u8,
    protocol: Mutex<Option<ProtocolRef>>,
    negotiated: Mutex<Option<VersionInfo>>,
    state: Mutex<ConnectionState>,
    inflight: Mutex<Inflight>,
    private: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Connection {
    /// Create a connection on the host device.
    ///
    /// `hd_cport_id` picks a specific local cport, or `None` for dynamic
    /// allocation. The local cport id stays unique on the device for the
    /// connection's lifetime; `ResourceExhausted` if taken or none free.
    pub fn create(
        hd: &Arc<HostDevice>,
        hd_cport_id: Option<u16>,
        intf_cport_id: u16,
        protocol_id: u8,
    ) -> Result<Arc<Self>> {
        hd.insert_connection(hd_cport_id, |cport_id| {
            Arc::new(Self {
                hd: hd.clone(),
                hd_cport_id: cport_id,
                intf_cport_id,
                name: format!("{cport_id}:{intf_cport_id}"),
                protocol_id,
                protocol: Mutex::new(None),
                negotiated: Mutex::new(None),
                state: Mutex::new(ConnectionState::Created),
                inflight: Mutex::new(Inflight::default()),
                private: Mutex::new(None),
            })
        })
    }

    /// The host device this connection runs over.
    pub fn hd(&self) -> &Arc<HostDevice> {
        &self.hd
    }

    /// Local cport id.
    #[inline]
    pub fn hd_cport_id(&self) -> u16 {
        self.hd_cport_id
    }

    /// Remote cport id.
    #[inline]
    pub fn intf_cport_id(&self) -> u16 {
        self.intf_cport_id
    }

    /// Display name, `local:remote`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The protocol id this connection was created for.
    #[inline]
    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// The bound protocol descriptor, if any.
    pub fn protocol(&self) -> Option<Arc<Protocol>> {
        self.protocol
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.protocol().clone())
    }

    /// The version agreed during negotiation.
    pub fn negotiated_version(&self) -> Option<VersionInfo> {
        *self.negotiated.lock().unwrap()
    }

    /// Stash driver-private state on the connection.
    pub fn set_private(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.private.lock().unwrap() = Some(value);
    }

    /// Fetch driver-private state, downcast to the driver's type.
    pub fn private<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.private
            .lock()
            .unwrap()
            .clone()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Drop the driver-private state. Teardown calls this after the
    /// protocol's exit callback so driver state referencing the
    /// connection does not keep it alive.
    pub fn clear_private(&self) {
        *self.private.lock().unwrap() = None;
    }

    /// Initialize the connection: bind protocol, enable the channel, run
    /// version negotiation, notify the peer, and start the driver.
    ///
    /// On failure everything done so far is unwound and the connection
    /// returns to `Created`; the caller reports the bind as failed.
    pub async fn init(self: &Arc<Self>, registry: &ProtocolRegistry) -> Result<()> {
        if self.state() != ConnectionState::Created {
            return Err(GreybusError::InvalidState(format!(
                "init on connection in state {:?}",
                self.state()
            )));
        }

        let protocol_ref = registry
            .get_latest(self.protocol_id, 0, false)
            .map_err(|err| {
                tracing::error!(
                    connection = self.name(),
                    "protocol 0x{:02x} not found",
                    self.protocol_id
                );
                err
            })?;
        let skip_version = protocol_ref.skip_version();
        *self.protocol.lock().unwrap() = Some(protocol_ref);

        if let Err(err) = self.hd.driver().cport_enable(self.hd_cport_id) {
            tracing::error!(connection = self.name(), "failed to enable host cport: {err}");
            self.unbind_protocol();
            return Err(err);
        }

        if skip_version {
            self.set_state(ConnectionState::Active);
        } else {
            self.set_state(ConnectionState::VersionPending);
            if let Err(err) = version::negotiate(self, registry).await {
                tracing::error!(connection = self.name(), "version negotiation failed: {err}");
                self.teardown(false).await;
                return Err(err);
            }
            self.set_state(ConnectionState::Active);
        }

        // Negotiation may have rebound the protocol; re-read the flags.
        let protocol = match self.protocol() {
            Some(protocol) => protocol,
            None => {
                self.teardown(false).await;
                return Err(GreybusError::InvalidState(
                    "protocol unbound during init".to_string(),
                ));
            }
        };

        if !protocol.skip_connected() {
            let notify = CportNotify {
                cport_id: self.intf_cport_id,
            };
            if let Err(err) =
                self.send_unidirectional(TYPE_CONNECTED, Bytes::copy_from_slice(&notify.encode()))
            {
                tracing::error!(connection = self.name(), "failed to connect cport: {err}");
                self.teardown(false).await;
                return Err(err);
            }
        }

        if let Err(err) = protocol.handler().clone().connection_init(self.clone()).await {
            tracing::error!(connection = self.name(), "protocol init failed: {err}");
            self.teardown(true).await;
            return Err(err);
        }

        Ok(())
    }

    /// Tear the connection down: cancel in-flight operations, stop the
    /// driver, notify the peer, and disable the channel. Idempotent.
    pub async fn exit(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Active | ConnectionState::VersionPending => {
                    *state = ConnectionState::Disconnecting;
                }
                _ => return,
            }
        }

        self.cancel_all();

        let protocol = self.protocol();
        if let Some(ref protocol) = protocol {
            protocol.handler().clone().connection_exit(self.clone()).await;
        }
        self.notify_disconnected(&protocol);
        self.clear_private();

        if let Err(err) = self.hd.driver().cport_disable(self.hd_cport_id) {
            tracing::warn!(connection = self.name(), "failed to disable host cport: {err}");
        }
        self.unbind_protocol();
    }

    /// Tear down and detach from the host device, freeing the cport id.
    pub async fn destroy(self: &Arc<Self>) {
        self.exit().await;
        self.hd.detach_connection(self.hd_cport_id);
        self.set_state(ConnectionState::Destroyed);
    }

    /// Unwind a partially initialized connection.
    async fn teardown(self: &Arc<Self>, notify_peer: bool) {
        self.set_state(ConnectionState::Disconnecting);
        self.cancel_all();
        if notify_peer {
            let protocol = self.protocol();
            self.notify_disconnected(&protocol);
        }
        self.clear_private();
        if let Err(err) = self.hd.driver().cport_disable(self.hd_cport_id) {
            tracing::warn!(connection = self.name(), "failed to disable host cport: {err}");
        }
        self.unbind_protocol();
        self.set_state(ConnectionState::Created);
    }

    fn notify_disconnected(&self, protocol: &Option<Arc<Protocol>>) {
        let skip = protocol
            .as_ref()
            .map(|p| p.skip_disconnected())
            .unwrap_or(true);
        if skip {
            return;
        }
        let notify = CportNotify {
            cport_id: self.intf_cport_id,
        };
        if let Err(err) =
            self.send_unidirectional(TYPE_DISCONNECTED, Bytes::copy_from_slice(&notify.encode()))
        {
            tracing::debug!(connection = self.name(), "failed to disconnect cport: {err}");
        }
    }

    /// Inbound frame from the host device.
    ///
    /// Malformed frames are rejected and logged here; they never reach
    /// operation matching. Responses are matched by operation id;
    /// requests are dispatched to the bound protocol handler.
    pub fn recv(self: &Arc<Self>, data: &[u8]) {
        let frame = match Frame::parse(data, self.hd.buffer_size_max()) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(connection = self.name(), "rejected inbound frame: {err}");
                return;
            }
        };

        if frame.is_response() {
            let result = match OperationResult::from_byte(frame.header.result) {
                OperationResult::Success => Ok(frame.payload),
                failure => Err(GreybusError::Remote(failure)),
            };
            self.complete_operation(frame.header.operation_id, result);
        } else {
            self.dispatch_request(frame);
        }
    }

    /// Dispatch an incoming request to the protocol handler and, for
    /// two-way requests, send the response frame echoing the id.
    fn dispatch_request(self: &Arc<Self>, frame: Frame) {
        match self.state() {
            ConnectionState::Active | ConnectionState::VersionPending => {}
            state => {
                tracing::warn!(
                    connection = self.name(),
                    "request 0x{:02x} dropped in state {:?}",
                    frame.header.request_type(),
                    state
                );
                return;
            }
        }

        let handler = {
            self.protocol
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.handler().clone())
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                tracing::warn!(connection = self.name(), "request on unbound connection");
                return;
            }
        };

        let op_type = frame.header.request_type();
        let outcome = handler.request_received(self, op_type, frame.payload.clone());

        if frame.header.is_unidirectional() {
            if let Err(err) = outcome {
                tracing::warn!(
                    connection = self.name(),
                    "unidirectional request 0x{op_type:02x} failed: {err}"
                );
            }
            return;
        }

        let (result, payload) = match outcome {
            Ok(payload) => (OperationResult::Success, payload),
            Err(err) => {
                tracing::warn!(
                    connection = self.name(),
                    "request 0x{op_type:02x} failed: {err}"
                );
                (OperationResult::from_error(&err), Bytes::new())
            }
        };

        let header = OperationHeader::response(&frame.header, result as u8, payload.len());
        if let Err(err) = self
            .hd
            .driver()
            .message_send(self.intf_cport_id, build_frame(&header, &payload))
        {
            tracing::error!(connection = self.name(), "failed to send response: {err}");
        }
    }

    pub(crate) fn inflight_mut(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub(crate) fn set_negotiated_version(&self, version: VersionInfo) {
        *self.negotiated.lock().unwrap() = Some(version);
    }

    pub(crate) fn rebind_protocol(&self, replacement: ProtocolRef) {
        *self.protocol.lock().unwrap() = Some(replacement);
    }

    pub(crate) fn unbind_protocol(&self) {
        *self.protocol.lock().unwrap() = None;
    }

    /// Check the connection may carry a new message right now.
    pub(crate) fn ensure_sendable(&self, allow_disconnecting: bool) -> Result<()> {
        let state = self.state();
        let ok = matches!(
            state,
            ConnectionState::Active | ConnectionState::VersionPending
        ) || (allow_disconnecting && state == ConnectionState::Disconnecting);
        if ok {
            Ok(())
        } else {
            Err(GreybusError::InvalidState(format!(
                "connection {} not enabled (state {state:?})",
                self.name
            )))
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("protocol_id", &self.protocol_id)
            .field("state", &self.state())
            .finish()
    }
}
