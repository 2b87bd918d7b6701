//! Per-connection version negotiation.
//!
//! Run once right after channel establishment unless the bound protocol
//! opts out. The exchange advertises the locally registered version and
//! compares it against the peer's report: equal majors agree on
//! `min(local.minor, peer.minor)`; a differing major triggers one rebind
//! attempt to the newest locally registered descriptor for the peer's
//! major before the connection is declared incompatible.

use std::sync::Arc;

use bytes::Bytes;

use super::ProtocolRegistry;
use crate::connection::Connection;
use crate::error::{GreybusError, Result};
use crate::wire::{VersionInfo, TYPE_PROTOCOL_VERSION};

/// Retries on a timed-out version exchange before giving up.
const VERSION_RETRIES: u32 = 2;

pub(crate) async fn negotiate(
    connection: &Arc<Connection>,
    registry: &ProtocolRegistry,
) -> Result<()> {
    let mut local = {
        let protocol = connection.protocol().ok_or_else(|| {
            GreybusError::InvalidState("version exchange on unbound connection".to_string())
        })?;
        VersionInfo {
            id: protocol.id(),
            major: protocol.major(),
            minor: protocol.minor(),
        }
    };

    let mut rebound = false;
    let mut retries = 0;

    loop {
        let peer = match exchange(connection, local).await {
            Ok(peer) => peer,
            Err(GreybusError::Timeout) if retries < VERSION_RETRIES => {
                retries += 1;
                tracing::debug!(
                    connection = connection.name(),
                    retries,
                    "version exchange timed out, retrying"
                );
                continue;
            }
            Err(err) => return Err(err),
        };

        if retries > 0 {
            tracing::warn!(
                connection = connection.name(),
                retries,
                "recovered version exchange after retries"
            );
        }

        if peer.major == local.major {
            let agreed = VersionInfo {
                id: local.id,
                major: local.major,
                minor: local.minor.min(peer.minor),
            };
            connection.set_negotiated_version(agreed);
            tracing::debug!(
                connection = connection.name(),
                "protocol 0x{:02x} v{}.{} negotiated",
                agreed.id,
                agreed.major,
                agreed.minor
            );
            return Ok(());
        }

        if rebound {
            return Err(GreybusError::IncompatibleVersion {
                peer_major: peer.major,
                peer_minor: peer.minor,
            });
        }

        tracing::info!(
            connection = connection.name(),
            "protocol 0x{:02x} v{}.{} mismatch v{}.{}",
            local.id,
            local.major,
            local.minor,
            peer.major,
            peer.minor
        );

        // Try the newest local descriptor for the peer's major.
        let replacement = registry
            .get_latest(local.id, peer.major, true)
            .map_err(|_| GreybusError::IncompatibleVersion {
                peer_major: peer.major,
                peer_minor: peer.minor,
            })?;

        local = VersionInfo {
            id: replacement.id(),
            major: replacement.major(),
            minor: replacement.minor(),
        };
        connection.rebind_protocol(replacement);
        rebound = true;
        retries = 0;
    }
}

/// One version request/response round trip.
async fn exchange(connection: &Arc<Connection>, local: VersionInfo) -> Result<VersionInfo> {
    let request = Bytes::copy_from_slice(&local.encode());
    let response = connection
        .send_sync(TYPE_PROTOCOL_VERSION, request, VersionInfo::SIZE)
        .await?;
    VersionInfo::decode(&response)
}
