//! Connection engine state and completion dispatch.
//!
//! Everything here runs on the actor task. Spawned I/O tasks never touch
//! engine state; they post a [`Completion`] and the actor applies it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;

use super::cleanup::DisconnectReason;
use super::commands::EngineStats;
use super::connection::{BlockRequest, Connection, ConnectionId, ConnectionKey};
use super::events::{BanPolicy, EventNotifier, SwarmEvent};
use super::pump::ReceiveError;
use super::registry::Registry;
use crate::SwarmError;
use crate::config::SwarmConfig;
use crate::network::{
    Cipher, EncryptionError, EncryptionNegotiator, Negotiated, RateLimiter, TransportConnector,
    TransportError,
};
use crate::protocol::{InfoHash, PeerHandshake, PeerId, PeerMessage};
use crate::storage::{BufferPool, DiskError, DiskReader};
use crate::swarm::{Peer, TorrentContext, TorrentMode, TorrentSnapshot};

/// Result of an asynchronous operation, applied on the actor.
pub(crate) enum Completion {
    ConnectFinished {
        info_hash: InfoHash,
        id: ConnectionId,
        address: SocketAddr,
        result: Result<(), TransportError>,
    },
    EncryptionChecked {
        key: ConnectionKey,
        result: Result<Negotiated, EncryptionError>,
    },
    SendFinished {
        key: ConnectionKey,
        result: Result<usize, TransportError>,
        frame: BytesMut,
    },
    HandshakeReceived {
        key: ConnectionKey,
        result: Result<PeerHandshake, ReceiveError>,
        decryptor: Box<dyn Cipher>,
    },
    MessageReceived {
        key: ConnectionKey,
        result: Result<PeerMessage, ReceiveError>,
        decryptor: Box<dyn Cipher>,
    },
    BlockRead {
        key: ConnectionKey,
        request: BlockRequest,
        result: Result<(), DiskError>,
        frame: BytesMut,
    },
    Cleanup {
        key: ConnectionKey,
        reason: DisconnectReason,
    },
}

/// Owns every torrent context and drives the connection state machine.
pub(crate) struct ConnectionEngine {
    pub(crate) config: SwarmConfig,
    pub(crate) local_peer_id: PeerId,
    pub(crate) registry: Registry,
    pub(crate) notifier: EventNotifier,
    pub(crate) connector: Arc<dyn TransportConnector>,
    pub(crate) negotiator: Arc<dyn EncryptionNegotiator>,
    pub(crate) disk: Arc<dyn DiskReader>,
    pub(crate) buffers: BufferPool,
    pub(crate) upload_limiter: Arc<RateLimiter>,
    pub(crate) download_limiter: Arc<RateLimiter>,
    pub(crate) completions: mpsc::UnboundedSender<Completion>,
    next_connection_id: u64,
}

impl ConnectionEngine {
    /// Creates the engine and the receiver its completions arrive on.
    pub fn new(
        config: SwarmConfig,
        local_peer_id: PeerId,
        connector: Arc<dyn TransportConnector>,
        negotiator: Arc<dyn EncryptionNegotiator>,
        disk: Arc<dyn DiskReader>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, receiver) = mpsc::unbounded_channel();
        let upload_limiter = Arc::new(RateLimiter::from_limit(config.bandwidth.upload_limit));
        let download_limiter = Arc::new(RateLimiter::from_limit(config.bandwidth.download_limit));

        let engine = Self {
            config,
            local_peer_id,
            registry: Registry::default(),
            notifier: EventNotifier::default(),
            connector,
            negotiator,
            disk,
            buffers: BufferPool::new(),
            upload_limiter,
            download_limiter,
            completions,
            next_connection_id: 0,
        };
        (engine, receiver)
    }

    pub(crate) fn next_connection_id(&mut self) -> ConnectionId {
        self.next_connection_id += 1;
        ConnectionId(self.next_connection_id)
    }

    pub(crate) fn post(&self, completion: Completion) {
        // The receiver lives as long as the actor loop that owns this engine.
        let _ = self.completions.send(completion);
    }

    /// Connection for `key` if it is still open.
    pub(crate) fn open_connection_mut(&mut self, key: ConnectionKey) -> Option<&mut Connection> {
        self.registry
            .torrent_mut(&key.info_hash)?
            .connected
            .get_mut(&key.id)
            .filter(|connection| connection.is_open())
    }

    /// Applies one completion.
    pub fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::ConnectFinished {
                info_hash,
                id,
                address,
                result,
            } => self.on_connect_complete(info_hash, id, address, result),
            Completion::EncryptionChecked { key, result } => self.on_encryption_checked(key, result),
            Completion::SendFinished { key, result, frame } => {
                self.on_send_complete(key, result, frame)
            }
            Completion::HandshakeReceived {
                key,
                result,
                decryptor,
            } => self.on_handshake_received(key, result, decryptor),
            Completion::MessageReceived {
                key,
                result,
                decryptor,
            } => self.on_message_received(key, result, decryptor),
            Completion::BlockRead {
                key,
                request,
                result,
                frame,
            } => self.on_block_read(key, request, result, frame),
            Completion::Cleanup { key, reason } => self.cleanup_now(key, reason),
        }
    }

    /// Registers a torrent and starts connecting to its peers.
    ///
    /// # Errors
    /// - `SwarmError::DuplicateTorrent` - Info hash already registered
    pub fn add_torrent(&mut self, torrent: TorrentContext) -> Result<(), SwarmError> {
        let info_hash = torrent.info_hash;
        self.registry
            .add_torrent(torrent)
            .map_err(|_| SwarmError::DuplicateTorrent { info_hash })?;
        tracing::debug!("Torrent {} registered with connection engine", info_hash);
        self.fill_connection_slots();
        Ok(())
    }

    /// Adds discovered peers to a torrent's available set.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub fn add_peers(&mut self, info_hash: InfoHash, peers: Vec<Peer>) -> Result<usize, SwarmError> {
        let torrent = self.torrent_mut(info_hash)?;
        let added = torrent.add_peers(peers);
        tracing::debug!("Added {} new peers to torrent {}", added, info_hash);
        self.fill_connection_slots();
        Ok(added)
    }

    /// Gives peers that failed to connect another chance.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub fn requeue_busy_peers(&mut self, info_hash: InfoHash) -> Result<usize, SwarmError> {
        let requeued = self.torrent_mut(info_hash)?.requeue_busy_peers();
        self.fill_connection_slots();
        Ok(requeued)
    }

    /// Replaces the torrent's mode.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub fn set_mode(
        &mut self,
        info_hash: InfoHash,
        mode: Box<dyn TorrentMode>,
    ) -> Result<(), SwarmError> {
        let torrent = self.torrent_mut(info_hash)?;
        tracing::debug!(
            "Torrent {} switching mode {} -> {}",
            info_hash,
            torrent.mode.name(),
            mode.name()
        );
        torrent.mode = mode;
        self.fill_connection_slots();
        Ok(())
    }

    /// Excludes `address` from reuse after its next cleanup.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub fn mark_inactive(&mut self, info_hash: InfoHash, address: SocketAddr) -> Result<(), SwarmError> {
        self.torrent_mut(info_hash)?.inactive_peers.insert(address);
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            open_connections: self.registry.open_connections(),
            half_open_connections: self.registry.half_open(),
            max_open_connections: self.config.connection.max_open_connections,
            max_half_open_connections: self.config.connection.max_half_open_connections,
            torrents: self.registry.torrent_count(),
        }
    }

    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub fn torrent_snapshot(&self, info_hash: InfoHash) -> Result<TorrentSnapshot, SwarmError> {
        self.registry
            .torrent(&info_hash)
            .map(TorrentContext::snapshot)
            .ok_or(SwarmError::TorrentNotFound { info_hash })
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SwarmEvent> {
        self.notifier.subscribe()
    }

    pub fn add_ban_policy(&mut self, policy: Box<dyn BanPolicy>) {
        self.notifier.add_ban_policy(policy);
    }

    pub(crate) fn torrent_mut(
        &mut self,
        info_hash: InfoHash,
    ) -> Result<&mut TorrentContext, SwarmError> {
        self.registry
            .torrent_mut(&info_hash)
            .ok_or(SwarmError::TorrentNotFound { info_hash })
    }
}
