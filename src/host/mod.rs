//! Host module - the transport adapter boundary.
//!
//! The core never touches the physical link. A link driver implements
//! [`HostTransport`] (enable/disable a cport, hand off a frame, best-effort
//! cancel, link recovery) and delivers inbound frames through
//! [`HostDevice::data_received`]. A [`HostDevice`] layers on top of one
//! driver instance: it owns the connection arena keyed by local cport id
//! and the consecutive-timeout accounting that decides when the link
//! itself is presumed unhealthy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{GreybusError, Result};
use crate::wire::HEADER_SIZE;

/// Default number of cports supported by the link.
pub const DEFAULT_NUM_CPORTS: u16 = 256;

/// Default maximum buffer size (one frame, header included).
pub const DEFAULT_BUFFER_SIZE_MAX: usize = 2048;

/// Default consecutive-timeout count that triggers link recovery.
pub const DEFAULT_MAX_TIMEOUTS: u32 = 8;

/// Default per-operation response deadline.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(1);

/// Default cap on concurrently in-flight operations per connection.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Capability set implemented by a physical-link driver.
///
/// All methods are non-blocking handoffs: `message_send` queues the frame
/// for transmission and returns; delivery happens asynchronously and
/// inbound frames come back through [`HostDevice::data_received`].
pub trait HostTransport: Send + Sync + 'static {
    /// Enable a cport before traffic flows on it.
    fn cport_enable(&self, _cport_id: u16) -> Result<()> {
        Ok(())
    }

    /// Disable a cport during connection teardown.
    fn cport_disable(&self, _cport_id: u16) -> Result<()> {
        Ok(())
    }

    /// Hand one complete frame to the link for transmission.
    ///
    /// Errors are surfaced synchronously to the sender; there is no
    /// delivery confirmation.
    fn message_send(&self, dest_cport_id: u16, frame: Bytes) -> Result<()>;

    /// Best-effort abort of a frame already handed over. The transport
    /// may or may not still be able to stop it.
    fn message_cancel(&self, _dest_cport_id: u16, _operation_id: u16) {}

    /// Invoked when consecutive timeouts exceed the configured limit and
    /// the link is presumed unhealthy.
    fn recovery(&self, _cport_id: u16) {}
}

/// Configuration for a host device.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Number of cports supported by the link.
    pub num_cports: u16,
    /// Maximum frame size (header + payload) the link can carry.
    pub buffer_size_max: usize,
    /// Consecutive timeouts before `recovery` fires; 0 disables accounting.
    pub max_timeouts: u32,
    /// Deadline applied to each two-way operation.
    pub operation_timeout: Duration,
    /// Cap on concurrently in-flight operations per connection.
    pub max_in_flight: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            num_cports: DEFAULT_NUM_CPORTS,
            buffer_size_max: DEFAULT_BUFFER_SIZE_MAX,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// One host-side instance of the link: a transport driver plus the
/// connections multiplexed over it.
pub struct HostDevice {
    driver: Arc<dyn HostTransport>,
    config: HostConfig,
    /// Connection arena keyed by local cport id. Doubles as the cport
    /// allocator: an id is taken iff a connection holds it.
    connections: Mutex<HashMap<u16, Arc<Connection>>>,
    timeout_counter: AtomicU32,
}

impl HostDevice {
    /// Create a host device over the given transport driver.
    pub fn new(driver: Arc<dyn HostTransport>, config: HostConfig) -> Arc<Self> {
        Arc::new(Self {
            driver,
            config,
            connections: Mutex::new(HashMap::new()),
            timeout_counter: AtomicU32::new(0),
        })
    }

    /// The transport driver this device runs over.
    pub fn driver(&self) -> &Arc<dyn HostTransport> {
        &self.driver
    }

    /// Device configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Maximum frame size (header + payload).
    #[inline]
    pub fn buffer_size_max(&self) -> usize {
        self.config.buffer_size_max
    }

    /// Maximum payload size for one operation message.
    #[inline]
    pub fn payload_size_max(&self) -> usize {
        self.config.buffer_size_max - HEADER_SIZE
    }

    /// Look up the connection bound to a local cport id.
    pub fn connection_find(&self, cport_id: u16) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(&cport_id).cloned()
    }

    /// Number of live connections on this device.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Callback from the transport driver: a frame arrived on a cport.
    ///
    /// Frames for a cport with no connection are dropped and logged.
    pub fn data_received(&self, cport_id: u16, data: &[u8]) {
        match self.connection_find(cport_id) {
            Some(connection) => connection.recv(data),
            None => {
                tracing::warn!(
                    cport_id,
                    "nonexistent connection ({} bytes dropped)",
                    data.len()
                );
            }
        }
    }

    /// Allocate a cport id and insert the connection built for it, as one
    /// atomic step under the arena lock.
    pub(crate) fn insert_connection<F>(
        &self,
        requested: Option<u16>,
        make: F,
    ) -> Result<Arc<Connection>>
    where
        F: FnOnce(u16) -> Arc<Connection>,
    {
        let mut connections = self.connections.lock().unwrap();

        let cport_id = match requested {
            Some(id) => {
                if id >= self.config.num_cports {
                    return Err(GreybusError::ResourceExhausted(format!(
                        "cport {} not available (device has {})",
                        id, self.config.num_cports
                    )));
                }
                if connections.contains_key(&id) {
                    return Err(GreybusError::ResourceExhausted(format!(
                        "cport {id} already connected"
                    )));
                }
                id
            }
            None => (0..self.config.num_cports)
                .find(|id| !connections.contains_key(id))
                .ok_or_else(|| {
                    GreybusError::ResourceExhausted("no free cport".to_string())
                })?,
        };

        let connection = make(cport_id);
        connections.insert(cport_id, connection.clone());
        Ok(connection)
    }

    /// Remove a connection from the arena, freeing its cport id.
    pub(crate) fn detach_connection(&self, cport_id: u16) {
        self.connections.lock().unwrap().remove(&cport_id);
    }

    /// Track operation outcomes for link-health accounting.
    ///
    /// Anything other than a timeout means the link answered and resets
    /// the counter. Hitting `max_timeouts` consecutive timeouts invokes
    /// the driver's recovery callback once and starts over.
    pub(crate) fn error_accounting(&self, cport_id: u16, timed_out: bool) {
        if self.config.max_timeouts == 0 {
            return;
        }

        if !timed_out {
            self.timeout_counter.store(0, Ordering::Release);
            return;
        }

        if self.timeout_counter.fetch_add(1, Ordering::AcqRel) + 1 < self.config.max_timeouts {
            return;
        }

        tracing::error!(
            cport_id,
            max_timeouts = self.config.max_timeouts,
            "maximum number of sequential timeouts; recovering"
        );
        self.driver.recovery(cport_id);
        self.timeout_counter.store(0, Ordering::Release);
    }

    /// Current consecutive-timeout count.
    pub fn timeout_count(&self) -> u32 {
        self.timeout_counter.load(Ordering::Acquire)
    }
}
