//! Encryption negotiation and handshake exchange for fresh connections.

use std::sync::Arc;

use tokio::time::Instant;

use super::cleanup::DisconnectReason;
use super::connection::{AfterSend, Connection, ConnectionKey, Outbound};
use super::core::{Completion, ConnectionEngine};
use super::pump::{ReceiveError, receive_handshake};
use crate::SwarmError;
use crate::network::{Cipher, EncryptionError, EncryptionTypes, Negotiated, PeerTransport};
use crate::protocol::{Direction, InfoHash, PeerHandshake, ProtocolError};
use crate::swarm::Peer;

/// Reserved-bit marking support for the extension protocol (BEP 10).
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;

impl ConnectionEngine {
    /// Registers an open transport and starts encryption negotiation.
    pub(crate) fn on_fresh_connection(&mut self, key: ConnectionKey, mut connection: Connection) {
        let max_open = self.config.connection.max_open_connections;
        let open = self.registry.open_connections();
        let engine_allowed = self.config.encryption.allowed;

        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            if let Some(transport) = connection.transport.take() {
                transport.dispose();
            }
            return;
        };

        let over_limit =
            open + 1 > max_open || torrent.open_connections() + 1 > torrent.max_connections;

        let now = Instant::now();
        connection.processing_queue = true;
        connection.connected_at = Some(now);
        connection.last_block_received = Some(now);

        let address = connection.address;
        let direction = connection.direction;
        let transport = connection.transport.clone();
        let allowed = torrent
            .active
            .get(&address)
            .map_or(EncryptionTypes::ALL, |peer| peer.encryption)
            .intersection(engine_allowed)
            .intersection(torrent.allowed_encryption.unwrap_or(EncryptionTypes::ALL));
        torrent.connected.insert(key.id, connection);

        if over_limit {
            tracing::debug!("Rejecting {}: too many connections", address);
            self.schedule_cleanup(key, DisconnectReason::TooManyConnections);
            return;
        }

        let Some(transport) = transport else {
            return;
        };
        let negotiator = Arc::clone(&self.negotiator);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = negotiator
                .negotiate(transport, key.info_hash, direction, allowed)
                .await;
            let _ = completions.send(Completion::EncryptionChecked { key, result });
        });
    }

    pub(crate) fn on_encryption_checked(
        &mut self,
        key: ConnectionKey,
        result: Result<Negotiated, EncryptionError>,
    ) {
        let engine_allowed = self.config.encryption.allowed;
        let local_peer_id = self.local_peer_id;
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            return;
        };
        let allowed =
            engine_allowed.intersection(torrent.allowed_encryption.unwrap_or(EncryptionTypes::ALL));
        let Some(connection) = torrent.connected.get_mut(&key.id).filter(|c| c.is_open()) else {
            return;
        };
        let address = connection.address;

        let negotiated = match result {
            Ok(negotiated) if !negotiated.leftover.is_empty() => Err(EncryptionError::LeftoverBytes {
                count: negotiated.leftover.len(),
            }),
            other => other,
        };

        match negotiated {
            Err(e) => {
                if let Some(peer) = torrent.active.get_mut(&address) {
                    peer.disable_rc4();
                }
                tracing::debug!("Encryption negotiation with {} failed: {}", address, e);
                self.schedule_cleanup(key, DisconnectReason::Encryption(e));
            }
            Ok(negotiated) if !allowed.contains(negotiated.kind()) => {
                let kind = negotiated.kind();
                tracing::debug!("Peer {} negotiated disallowed encryption {}", address, kind);
                self.schedule_cleanup(
                    key,
                    DisconnectReason::Encryption(EncryptionError::Disallowed { kind }),
                );
            }
            Ok(negotiated) => {
                connection.encryption = Some(negotiated.kind());
                connection.encryptor = Some(negotiated.encryptor);
                connection.decryptor = Some(negotiated.decryptor);
                let handshake = PeerHandshake::new(key.info_hash, local_peer_id);
                self.send(key, Outbound::Handshake(handshake), AfterSend::ReceiveHandshake);
            }
        }
    }

    /// Arms the single receive for the remote handshake.
    pub(crate) fn start_handshake_receive(&mut self, key: ConnectionKey) {
        let Some(connection) = self.open_connection_mut(key) else {
            return;
        };
        if connection.receive_in_flight {
            return;
        }
        let (Some(transport), Some(mut decryptor)) =
            (connection.transport.clone(), connection.decryptor.take())
        else {
            return;
        };
        connection.receive_in_flight = true;

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = receive_handshake(transport.as_ref(), decryptor.as_mut()).await;
            let _ = completions.send(Completion::HandshakeReceived {
                key,
                result,
                decryptor,
            });
        });
    }

    pub(crate) fn on_handshake_received(
        &mut self,
        key: ConnectionKey,
        result: Result<PeerHandshake, ReceiveError>,
        decryptor: Box<dyn Cipher>,
    ) {
        let Some(connection) = self.open_connection_mut(key) else {
            return;
        };
        connection.receive_in_flight = false;
        connection.decryptor = Some(decryptor);

        let handshake = match result {
            Ok(handshake) => handshake,
            Err(ReceiveError::Transport(e)) => {
                tracing::debug!("Handshake receive from {} failed: {}", connection.address, e);
                self.schedule_cleanup(key, DisconnectReason::HandshakeFailed);
                return;
            }
            Err(ReceiveError::Protocol(e)) => {
                self.schedule_cleanup(key, DisconnectReason::Protocol(e));
                return;
            }
        };

        if let Err(e) = self.apply_handshake(key, &handshake) {
            tracing::debug!("Rejecting handshake: {}", e);
            self.schedule_cleanup(key, DisconnectReason::Protocol(e));
            return;
        }

        let Some(connection) = self.open_connection_mut(key) else {
            return;
        };
        let address = connection.address;
        let direction = connection.direction;
        let has_queued = !connection.queue.is_empty();
        if !has_queued {
            connection.processing_queue = false;
        }

        if has_queued {
            self.process_queue(key);
        }
        if self.open_connection_mut(key).is_none() {
            return;
        }
        self.start_receive(key);

        tracing::debug!("Peer {} connected ({})", address, direction);
        self.notifier
            .notify_peer_connected(key.info_hash, address, direction);
    }

    fn apply_handshake(
        &mut self,
        key: ConnectionKey,
        handshake: &PeerHandshake,
    ) -> Result<(), ProtocolError> {
        if handshake.info_hash != key.info_hash {
            return Err(ProtocolError::InfoHashMismatch {
                expected: key.info_hash,
                received: handshake.info_hash,
            });
        }

        let local_peer_id = self.local_peer_id;
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            return Ok(());
        };
        let Some(connection) = torrent.connected.get_mut(&key.id) else {
            return Ok(());
        };
        if let Some(peer) = torrent.active.get_mut(&connection.address) {
            if let Some(expected) = peer.peer_id
                && expected != handshake.peer_id
            {
                return Err(ProtocolError::PeerIdMismatch {
                    expected,
                    received: handshake.peer_id,
                });
            }
            // Recorded before the self check so cleanup never requeues ourselves.
            peer.peer_id = Some(handshake.peer_id);
        }
        if handshake.peer_id == local_peer_id {
            return Err(ProtocolError::SelfConnection);
        }

        connection.remote_peer_id = Some(handshake.peer_id);
        connection.handshake_complete = true;
        if handshake.reserved[5] & EXTENSION_PROTOCOL_BIT != 0
            && let Some(factory) = &torrent.peer_exchange
        {
            connection.peer_exchange = Some(factory.create(key.info_hash, connection.address));
        }
        Ok(())
    }

    /// Feeds an already-connected incoming transport into the pipeline.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    /// - `SwarmError::ConnectionRejected` - Mode refuses connections or peer already connected
    pub fn accept_incoming(
        &mut self,
        info_hash: InfoHash,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(), SwarmError> {
        let address = transport.address();
        let rejection = match self.registry.torrent_mut(&info_hash) {
            None => Some(SwarmError::TorrentNotFound { info_hash }),
            Some(torrent) if !torrent.mode.can_accept_connections() => {
                Some(SwarmError::ConnectionRejected {
                    address,
                    reason: format!("torrent is {}", torrent.mode.name()),
                })
            }
            Some(torrent)
                if torrent.connecting.contains_key(&address)
                    || torrent.active.contains_key(&address) =>
            {
                Some(SwarmError::ConnectionRejected {
                    address,
                    reason: "peer already connected".to_string(),
                })
            }
            Some(_) => None,
        };
        if let Some(error) = rejection {
            transport.dispose();
            return Err(error);
        }

        let id = self.next_connection_id();
        let torrent = self.torrent_mut(info_hash)?;
        let peer = torrent
            .take_idle_peer(&address)
            .unwrap_or_else(|| Peer::new(address));
        torrent.active.insert(address, peer);
        let connection = Connection::new(id, Direction::Incoming, transport, torrent.piece_count);

        tracing::debug!("Accepted incoming connection from {}", address);
        self.on_fresh_connection(ConnectionKey { info_hash, id }, connection);
        Ok(())
    }
}
