//! # greybus-core
//!
//! Connection/operation engine for the Greybus RPC-style transport: a
//! host processor talking to a removable hardware module over a
//! multiplexed UniPro-style link.
//!
//! One physical link carries many independent cports; each cport is
//! bound to a [`Connection`] running one instance of a versioned
//! protocol. The engine multiplexes concurrent request/response
//! exchanges and fire-and-forget messages over those cports, tracks
//! in-flight [`Operation`]s, matches responses to requests by id,
//! negotiates protocol versions, and gives protocol drivers a
//! synchronous-looking call interface over an asynchronous transport.
//!
//! ## Architecture
//!
//! - **Host boundary** ([`host`]): the [`HostTransport`] capability set a
//!   physical-link driver implements, and the [`HostDevice`] that owns
//!   the connection arena and link-health accounting.
//! - **Connections** ([`connection`]): cport pairs with a lifecycle of
//!   `Created → VersionPending → Active → Disconnecting → Destroyed`.
//! - **Operations** ([`operation`]): request/response exchanges with
//!   unique 16-bit ids, deadlines, and cooperative cancellation.
//! - **Protocols** ([`protocol`]): the registry mapping (id, major,
//!   minor) to handlers, and per-connection version negotiation.
//! - **Drivers** ([`raw`], [`spi`]): the raw byte pipe and the SPI
//!   bridge, consumers of the engine.
//! - **Binding** ([`bundle`]): matching discovered bundles to drivers by
//!   (vendor, product, class) rules.
//!
//! ## Example
//!
//! ```ignore
//! use greybus_core::{Connection, HostConfig, HostDevice, ProtocolRegistry};
//!
//! let registry = ProtocolRegistry::new();
//! registry.register(greybus_core::raw::raw_protocol())?;
//!
//! let hd = HostDevice::new(link_driver, HostConfig::default());
//! let connection = Connection::create(&hd, None, remote_cport, 0xfe)?;
//! connection.init(&registry).await?;
//!
//! let response = connection.send_sync(0x04, request, 64).await?;
//! ```

pub mod bundle;
pub mod connection;
pub mod error;
pub mod host;
pub mod operation;
pub mod protocol;
pub mod raw;
pub mod spi;
pub mod wire;

pub use connection::{Connection, ConnectionState};
pub use error::{GreybusError, Result};
pub use host::{HostConfig, HostDevice, HostTransport};
pub use operation::{Operation, OperationState};
pub use protocol::{Protocol, ProtocolHandler, ProtocolRegistry};
