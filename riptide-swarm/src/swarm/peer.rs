//! Peer records tracked per torrent

use std::net::SocketAddr;

use serde::Serialize;
use tokio::time::Instant;

use crate::network::EncryptionTypes;
use crate::protocol::PeerId;

/// A remote peer known to a torrent.
///
/// Lives in exactly one of the torrent's peer sets. Counters survive across
/// connection attempts so reuse can be capped.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: SocketAddr,
    pub last_connection_attempt: Option<Instant>,
    pub failed_connection_attempts: u32,
    pub cleaned_up_count: u32,
    /// Encryption kinds this peer may be offered
    pub encryption: EncryptionTypes,
    pub peer_id: Option<PeerId>,
    /// Remote advertised every piece
    pub is_seeder: bool,
}

impl Peer {
    /// Creates a newly discovered peer with every encryption kind enabled.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            last_connection_attempt: None,
            failed_connection_attempts: 0,
            cleaned_up_count: 0,
            encryption: EncryptionTypes::ALL,
            peer_id: None,
            is_seeder: false,
        }
    }

    pub fn with_encryption(mut self, encryption: EncryptionTypes) -> Self {
        self.encryption = encryption;
        self
    }

    /// Stops offering RC4 to this peer after a failed negotiation.
    pub fn disable_rc4(&mut self) {
        self.encryption.remove(EncryptionTypes::RC4_ALL);
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            address: self.address,
            failed_connection_attempts: self.failed_connection_attempts,
            cleaned_up_count: self.cleaned_up_count,
            encryption: self.encryption,
            peer_id: self.peer_id,
            is_seeder: self.is_seeder,
        }
    }
}

/// Serializable view of a [`Peer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub failed_connection_attempts: u32,
    pub cleaned_up_count: u32,
    pub encryption: EncryptionTypes,
    pub peer_id: Option<PeerId>,
    pub is_seeder: bool,
}
