//! Protocol registry: lookup by exact version or latest compatible.
//!
//! The registry is an explicit instance, not a process-wide singleton,
//! so tests construct isolated registries. The list is kept sorted by
//! protocol id (low to high), then by major version (high to low), and
//! finally by minor version (high to low), so searching only by protocol
//! id therefore produces the newest registered version.

use std::sync::{Arc, Mutex};

use super::{Protocol, ProtocolRef};
use crate::error::{GreybusError, Result};

/// Registry of protocol descriptors.
#[derive(Default)]
pub struct ProtocolRegistry {
    protocols: Mutex<Vec<Arc<Protocol>>>,
}

impl ProtocolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol descriptor.
    ///
    /// Fails with `DuplicateProtocol` if an identical (id, major, minor)
    /// triple is already present.
    pub fn register(&self, protocol: Arc<Protocol>) -> Result<()> {
        let mut protocols = self.protocols.lock().unwrap();

        let key = sort_key(&protocol);
        let position = protocols.partition_point(|existing| sort_key(existing) < key);

        if let Some(existing) = protocols.get(position) {
            if existing.id() == protocol.id()
                && existing.major() == protocol.major()
                && existing.minor() == protocol.minor()
            {
                tracing::error!(
                    name = protocol.name(),
                    "duplicate {} protocol v{}.{}",
                    protocol.name(),
                    protocol.major(),
                    protocol.minor()
                );
                return Err(GreybusError::DuplicateProtocol {
                    id: protocol.id(),
                    major: protocol.major(),
                    minor: protocol.minor(),
                });
            }
        }

        tracing::info!(
            "registered {} protocol v{}.{}",
            protocol.name(),
            protocol.major(),
            protocol.minor()
        );
        protocols.insert(position, protocol);
        Ok(())
    }

    /// De-register a previously registered protocol.
    ///
    /// Fails with `InUse` while any connection still holds a reference,
    /// `NotFound` if the triple was never registered.
    pub fn deregister(&self, protocol: &Protocol) -> Result<()> {
        let mut protocols = self.protocols.lock().unwrap();

        let position = protocols
            .iter()
            .position(|p| {
                p.id() == protocol.id()
                    && p.major() == protocol.major()
                    && p.minor() == protocol.minor()
            })
            .ok_or(GreybusError::NotFound { id: protocol.id() })?;

        if protocols[position].usage_count() != 0 {
            return Err(GreybusError::InUse {
                id: protocol.id(),
                major: protocol.major(),
                minor: protocol.minor(),
            });
        }

        let removed = protocols.remove(position);
        tracing::info!("deregistered {} protocol", removed.name());
        Ok(())
    }

    /// Exact-version lookup.
    ///
    /// On success the returned guard keeps the descriptor referenced
    /// until dropped.
    pub fn get(&self, id: u8, major: u8, minor: u8) -> Result<ProtocolRef> {
        let protocols = self.protocols.lock().unwrap();
        protocols
            .iter()
            .find(|p| p.id() == id && p.major() == major && p.minor() == minor)
            .cloned()
            .map(ProtocolRef::new)
            .ok_or(GreybusError::NotFound { id })
    }

    /// Latest-version lookup.
    ///
    /// Returns the descriptor with the highest (major, minor) for `id`;
    /// with `match_exact_major` set, restricted to that major. Because
    /// the list is sorted, the first id hit (optionally narrowed to the
    /// major) is the answer.
    pub fn get_latest(&self, id: u8, major: u8, match_exact_major: bool) -> Result<ProtocolRef> {
        let protocols = self.protocols.lock().unwrap();
        protocols
            .iter()
            .find(|p| p.id() == id && (!match_exact_major || p.major() == major))
            .cloned()
            .map(ProtocolRef::new)
            .ok_or(GreybusError::NotFound { id })
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.protocols.lock().unwrap().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.protocols.lock().unwrap().is_empty()
    }
}

/// Sort key implementing id ascending, then major/minor descending.
fn sort_key(protocol: &Protocol) -> (u8, u8, u8) {
    (
        protocol.id(),
        u8::MAX - protocol.major(),
        u8::MAX - protocol.minor(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolHandler;

    struct NullHandler;
    impl ProtocolHandler for NullHandler {}

    fn protocol(id: u8, major: u8, minor: u8) -> Arc<Protocol> {
        Protocol::new(
            format!("proto-{id:02x}-{major}.{minor}"),
            id,
            major,
            minor,
            0,
            Arc::new(NullHandler),
        )
    }

    #[test]
    fn test_register_and_get_exact() {
        let registry = ProtocolRegistry::new();
        registry.register(protocol(0x02, 1, 0)).unwrap();

        let found = registry.get(0x02, 1, 0).unwrap();
        assert_eq!(found.id(), 0x02);
        assert_eq!(found.major(), 1);
        assert_eq!(found.minor(), 0);
    }

    #[test]
    fn test_get_miss_is_not_found() {
        let registry = ProtocolRegistry::new();
        registry.register(protocol(0x02, 1, 0)).unwrap();

        assert!(matches!(
            registry.get(0x02, 2, 0),
            Err(GreybusError::NotFound { id: 0x02 })
        ));
        assert!(matches!(
            registry.get(0x03, 1, 0),
            Err(GreybusError::NotFound { id: 0x03 })
        ));
    }

    #[test]
    fn test_duplicate_triple_rejected() {
        let registry = ProtocolRegistry::new();
        registry.register(protocol(0x02, 1, 0)).unwrap();

        let result = registry.register(protocol(0x02, 1, 0));
        assert!(matches!(
            result,
            Err(GreybusError::DuplicateProtocol {
                id: 0x02,
                major: 1,
                minor: 0
            })
        ));
    }

    #[test]
    fn test_same_major_different_minor_allowed() {
        let registry = ProtocolRegistry::new();
        registry.register(protocol(0x02, 1, 0)).unwrap();
        registry.register(protocol(0x02, 1, 1)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_get_latest_highest_major_then_minor() {
        let registry = ProtocolRegistry::new();
        registry.register(protocol(0x02, 1, 0)).unwrap();
        registry.register(protocol(0x02, 2, 1)).unwrap();
        registry.register(protocol(0x02, 2, 3)).unwrap();
        registry.register(protocol(0x02, 1, 7)).unwrap();
        // Another id in the mix must not interfere.
        registry.register(protocol(0x05, 9, 9)).unwrap();

        let latest = registry.get_latest(0x02, 0, false).unwrap();
        assert_eq!((latest.major(), latest.minor()), (2, 3));
    }

    #[test]
    fn test_get_latest_exact_major_restricts() {
        let registry = ProtocolRegistry::new();
        registry.register(protocol(0x02, 1, 0)).unwrap();
        registry.register(protocol(0x02, 1, 4)).unwrap();
        registry.register(protocol(0x02, 2, 0)).unwrap();

        let latest = registry.get_latest(0x02, 1, true).unwrap();
        assert_eq!((latest.major(), latest.minor()), (1, 4));

        assert!(registry.get_latest(0x02, 3, true).is_err());
    }

    #[test]
    fn test_get_raises_usage_and_drop_releases() {
        let registry = ProtocolRegistry::new();
        let proto = protocol(0x02, 1, 0);
        registry.register(proto.clone()).unwrap();

        let guard = registry.get(0x02, 1, 0).unwrap();
        assert_eq!(proto.usage_count(), 1);
        drop(guard);
        assert_eq!(proto.usage_count(), 0);
    }

    #[test]
    fn test_deregister_in_use_rejected() {
        let registry = ProtocolRegistry::new();
        let proto = protocol(0x02, 1, 0);
        registry.register(proto.clone()).unwrap();

        let guard = registry.get_latest(0x02, 0, false).unwrap();
        assert!(matches!(
            registry.deregister(&proto),
            Err(GreybusError::InUse { .. })
        ));

        drop(guard);
        registry.deregister(&proto).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_unknown_is_not_found() {
        let registry = ProtocolRegistry::new();
        let proto = protocol(0x02, 1, 0);
        assert!(matches!(
            registry.deregister(&proto),
            Err(GreybusError::NotFound { .. })
        ));
    }
}
