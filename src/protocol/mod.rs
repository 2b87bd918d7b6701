//! Protocol module - descriptors, handlers, and the registry.
//!
//! A [`Protocol`] describes one versioned protocol implementation:
//! identity (id, major, minor), capability flags, and the
//! [`ProtocolHandler`] a connection drives once bound. Protocols having
//! the same id but different major and/or minor version numbers are
//! treated as distinct protocols.
//!
//! Lookups hand out [`ProtocolRef`] guards that keep the descriptor's
//! usage count raised until dropped; deregistration refuses while any
//! guard is alive.

mod registry;
pub(crate) mod version;

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{GreybusError, Result};

pub use registry::ProtocolRegistry;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capability flags for protocol drivers.
pub mod flags {
    /// Don't send the connected notification after negotiation.
    pub const SKIP_CONNECTED: u32 = 1 << 0;
    /// Don't send the disconnected notification during teardown.
    pub const SKIP_DISCONNECTED: u32 = 1 << 1;
    /// Don't run the version exchange; the connection goes straight to
    /// active.
    pub const SKIP_VERSION: u32 = 1 << 3;
}

/// Callbacks a protocol driver hangs off a connection.
///
/// `connection_init`/`connection_exit` run during connection setup and
/// teardown and may issue operations. `request_received` runs on the
/// transport's receive path and must not block: return the response
/// payload (or an error mapped to a result code) and let the engine send
/// the response frame.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Called once the connection is active, before driver traffic.
    fn connection_init(&self, _connection: Arc<Connection>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Called during connection teardown, after in-flight operations are
    /// cancelled.
    fn connection_exit(&self, _connection: Arc<Connection>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }

    /// Handle an incoming request from the peer.
    fn request_received(
        &self,
        _connection: &Arc<Connection>,
        op_type: u8,
        _payload: Bytes,
    ) -> Result<Bytes> {
        Err(GreybusError::MalformedFrame(format!(
            "unsupported request type 0x{op_type:02x}"
        )))
    }
}

/// A registered protocol descriptor.
pub struct Protocol {
    name: String,
    id: u8,
    major: u8,
    minor: u8,
    flags: u32,
    handler: Arc<dyn ProtocolHandler>,
    /// Live `ProtocolRef` count; deregistration fails while non-zero.
    usage: AtomicUsize,
}

impl Protocol {
    /// Create a new protocol descriptor.
    pub fn new(
        name: impl Into<String>,
        id: u8,
        major: u8,
        minor: u8,
        flags: u32,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            id,
            major,
            minor,
            flags,
            handler,
            usage: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn handler(&self) -> &Arc<dyn ProtocolHandler> {
        &self.handler
    }

    /// Number of live references handed out by the registry.
    pub fn usage_count(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    pub(crate) fn skip_version(&self) -> bool {
        self.flags & flags::SKIP_VERSION != 0
    }

    pub(crate) fn skip_connected(&self) -> bool {
        self.flags & flags::SKIP_CONNECTED != 0
    }

    pub(crate) fn skip_disconnected(&self) -> bool {
        self.flags & flags::SKIP_DISCONNECTED != 0
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("major", &self.major)
            .field("minor", &self.minor)
            .field("flags", &self.flags)
            .field("usage", &self.usage_count())
            .finish()
    }
}

/// RAII guard over a protocol descriptor.
///
/// Holds the descriptor's usage count raised for its lifetime, making
/// the release symmetric with the lookup that produced it.
pub struct ProtocolRef {
    protocol: Arc<Protocol>,
}

impl ProtocolRef {
    pub(crate) fn new(protocol: Arc<Protocol>) -> Self {
        protocol.usage.fetch_add(1, Ordering::AcqRel);
        Self { protocol }
    }

    /// The underlying descriptor.
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }
}

impl Deref for ProtocolRef {
    type Target = Protocol;

    fn deref(&self) -> &Protocol {
        &self.protocol
    }
}

impl Clone for ProtocolRef {
    fn clone(&self) -> Self {
        Self::new(self.protocol.clone())
    }
}

impl Drop for ProtocolRef {
    fn drop(&mut self) {
        self.protocol.usage.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ProtocolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProtocolRef").field(&self.protocol).finish()
    }
}
