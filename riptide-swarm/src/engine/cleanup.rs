//! Connection teardown.
//!
//! Every failure path funnels into [`ConnectionEngine::schedule_cleanup`].
//! Scheduling only flips the connection to `Closing` and posts a
//! completion; the actual teardown runs later on the actor so a callback
//! never tears down state its caller is still holding.

use std::fmt;
use std::net::SocketAddr;

use super::connection::{ConnectionKey, ConnectionState};
use super::core::{Completion, ConnectionEngine};
use crate::SwarmError;
use crate::network::EncryptionError;
use crate::protocol::{InfoHash, ProtocolError};

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    TooManyConnections,
    HandshakeFailed,
    SendFailed,
    ReceiveFailed,
    Protocol(ProtocolError),
    Encryption(EncryptionError),
    SendException { message: String },
    Requested { reason: String },
    TorrentRemoved,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::TooManyConnections => write!(f, "too many connections"),
            DisconnectReason::HandshakeFailed => write!(f, "handshaking failed"),
            DisconnectReason::SendFailed => write!(f, "could not send message"),
            DisconnectReason::ReceiveFailed => write!(f, "could not receive a message"),
            DisconnectReason::Protocol(e) => write!(f, "{e}"),
            DisconnectReason::Encryption(e) => write!(f, "{e}"),
            DisconnectReason::SendException { message } => {
                write!(f, "exception calling send: {message}")
            }
            DisconnectReason::Requested { reason } => write!(f, "{reason}"),
            DisconnectReason::TorrentRemoved => write!(f, "torrent removed"),
        }
    }
}

impl ConnectionEngine {
    /// Marks the connection closing and queues its teardown.
    ///
    /// Repeated calls for the same connection are no-ops.
    pub(crate) fn schedule_cleanup(&mut self, key: ConnectionKey, reason: DisconnectReason) {
        let Some(connection) = self.open_connection_mut(key) else {
            return;
        };
        connection.state = ConnectionState::Closing;
        tracing::debug!("Scheduling cleanup of {}: {}", connection.address, reason);
        self.post(Completion::Cleanup { key, reason });
    }

    /// Tears the connection down, then refills the freed slot.
    pub(crate) fn cleanup_now(&mut self, key: ConnectionKey, reason: DisconnectReason) {
        if self.teardown(key, reason) {
            self.try_connect_all();
        }
    }

    /// Removes the connection and decides whether its peer is reusable.
    fn teardown(&mut self, key: ConnectionKey, reason: DisconnectReason) -> bool {
        let max_cleanups = self.config.connection.max_cleanups;
        let local_peer_id = self.local_peer_id;
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            return false;
        };
        let Some(mut connection) = torrent.connected.remove(&key.id) else {
            return false;
        };
        let address = connection.address;

        let can_reconnect = connection
            .transport
            .as_ref()
            .is_some_and(|transport| transport.can_reconnect());
        let reusable = can_reconnect && !torrent.inactive_peers.contains(&address);

        let cancelled = torrent.picker.cancel_requests(address);
        if cancelled > 0 {
            tracing::debug!("Cancelled {} requests to {}", cancelled, address);
        }

        let peer = torrent.active.remove(&address).map(|mut peer| {
            peer.cleaned_up_count += 1;
            peer
        });

        if let Some(mut exchange) = connection.peer_exchange.take() {
            exchange.dispose();
        }
        if !connection.am_choking {
            torrent.uploading_to = torrent.uploading_to.saturating_sub(1);
        }
        if let Some(transport) = connection.transport.take() {
            transport.dispose();
        }
        connection.state = ConnectionState::Closed;

        if let Some(peer) = peer
            && reusable
            && peer.peer_id != Some(local_peer_id)
            && peer.cleaned_up_count < max_cleanups
            && !torrent.available.iter().any(|p| p.address == address)
        {
            torrent.available.push_front(peer);
        }

        tracing::debug!(
            "Cleaned up {} connection {} to {}: {}",
            connection.direction,
            connection.id,
            address,
            reason
        );
        self.notifier
            .notify_peer_disconnected(key.info_hash, address, reason);
        true
    }

    /// Closes the connection to `address` on host request.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    /// - `SwarmError::PeerNotConnected` - No open connection to `address`
    pub fn disconnect_peer(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        reason: String,
    ) -> Result<(), SwarmError> {
        let id = self
            .torrent_mut(info_hash)?
            .connection_by_address(&address)
            .ok_or(SwarmError::PeerNotConnected { address })?;
        self.schedule_cleanup(
            ConnectionKey { info_hash, id },
            DisconnectReason::Requested { reason },
        );
        Ok(())
    }

    /// Cancels pending connects, tears down every connection and forgets
    /// the torrent.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub fn remove_torrent(&mut self, info_hash: InfoHash) -> Result<(), SwarmError> {
        let ids: Vec<_> = self.torrent_mut(info_hash)?.connected.keys().copied().collect();
        self.cancel_pending(info_hash);
        for id in ids {
            self.teardown(ConnectionKey { info_hash, id }, DisconnectReason::TorrentRemoved);
        }
        self.registry.remove_torrent(&info_hash);
        tracing::debug!("Torrent {} removed from connection engine", info_hash);
        self.fill_connection_slots();
        Ok(())
    }
}
