//! Error types for greybus-core.

use thiserror::Error;

use crate::wire::OperationResult;

/// Main error type for all greybus-core operations.
#[derive(Debug, Error)]
pub enum GreybusError {
    /// A protocol with the same (id, major, minor) triple is already registered.
    #[error("duplicate protocol 0x{id:02x} v{major}.{minor}")]
    DuplicateProtocol { id: u8, major: u8, minor: u8 },

    /// Deregistration of a protocol still referenced by a connection.
    #[error("protocol 0x{id:02x} v{major}.{minor} is in use")]
    InUse { id: u8, major: u8, minor: u8 },

    /// Lookup miss in the protocol registry.
    #[error("protocol 0x{id:02x} not found")]
    NotFound { id: u8 },

    /// Version negotiation could not find a mutually supported version.
    #[error("incompatible protocol version (peer reported v{peer_major}.{peer_minor})")]
    IncompatibleVersion { peer_major: u8, peer_minor: u8 },

    /// Operation id space, in-flight limit, or payload size budget exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No response arrived before the operation deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// Send/receive error reported by the host transport adapter.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Size/field validation failure on a frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer completed the operation with a non-success result code.
    #[error("remote error: {0:?}")]
    Remote(OperationResult),

    /// Operation attempted on a connection in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using GreybusError.
pub type Result<T> = std::result::Result<T, GreybusError>;
