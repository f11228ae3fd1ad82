//! Handle for communicating with the swarm engine actor.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::commands::{EngineStats, SwarmCommand};
use super::events::{BanPolicy, SwarmEvent};
use crate::SwarmError;
use crate::network::PeerTransport;
use crate::protocol::{InfoHash, PeerMessage};
use crate::swarm::{Peer, TorrentContext, TorrentMode, TorrentSnapshot};

/// Cloneable async API over the swarm engine actor.
///
/// Every call returns `SwarmError::EngineShutdown` once the actor has stopped.
#[derive(Clone)]
pub struct SwarmHandle {
    sender: mpsc::Sender<SwarmCommand>,
}

impl SwarmHandle {
    /// Creates a new handle with the given command sender.
    pub fn new(sender: mpsc::Sender<SwarmCommand>) -> Self {
        Self { sender }
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> SwarmCommand,
    ) -> Result<R, SwarmError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(command(responder))
            .await
            .map_err(|_| SwarmError::EngineShutdown)?;

        rx.await.map_err(|_| SwarmError::EngineShutdown)
    }

    /// Registers a torrent and starts connecting to its peers.
    ///
    /// # Errors
    /// - `SwarmError::DuplicateTorrent` - Info hash already registered
    pub async fn add_torrent(&self, torrent: TorrentContext) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::AddTorrent { torrent, responder })
            .await?
    }

    /// Cancels pending connects and closes every connection of the torrent.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::RemoveTorrent {
            info_hash,
            responder,
        })
        .await?
    }

    /// Adds peers to the torrent. Returns how many were new.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub async fn add_peers(&self, info_hash: InfoHash, peers: Vec<Peer>) -> Result<usize, SwarmError> {
        self.request(|responder| SwarmCommand::AddPeers {
            info_hash,
            peers,
            responder,
        })
        .await?
    }

    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub async fn requeue_busy_peers(&self, info_hash: InfoHash) -> Result<usize, SwarmError> {
        self.request(|responder| SwarmCommand::RequeueBusyPeers {
            info_hash,
            responder,
        })
        .await?
    }

    /// Hands an accepted incoming transport to the engine.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    /// - `SwarmError::ConnectionRejected` - Torrent refuses the connection
    pub async fn accept_incoming(
        &self,
        info_hash: InfoHash,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::AcceptIncoming {
            info_hash,
            transport,
            responder,
        })
        .await?
    }

    /// Queues a message for the peer at `address`.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    /// - `SwarmError::PeerNotConnected` - No open connection to `address`
    pub async fn send_message(
        &self,
        info_hash: InfoHash,
        address: SocketAddr,
        message: PeerMessage,
    ) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::SendMessage {
            info_hash,
            address,
            message,
            responder,
        })
        .await?
    }

    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    /// - `SwarmError::PeerNotConnected` - No open connection to `address`
    pub async fn disconnect_peer(
        &self,
        info_hash: InfoHash,
        address: SocketAddr,
        reason: impl Into<String>,
    ) -> Result<(), SwarmError> {
        let reason = reason.into();
        self.request(|responder| SwarmCommand::DisconnectPeer {
            info_hash,
            address,
            reason,
            responder,
        })
        .await?
    }

    /// Aborts in-flight connects of the torrent. Returns how many were cancelled.
    pub async fn cancel_pending(&self, info_hash: InfoHash) -> Result<usize, SwarmError> {
        self.request(|responder| SwarmCommand::CancelPending {
            info_hash,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub async fn mark_inactive(&self, info_hash: InfoHash, address: SocketAddr) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::MarkInactive {
            info_hash,
            address,
            responder,
        })
        .await?
    }

    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub async fn set_mode(
        &self,
        info_hash: InfoHash,
        mode: Box<dyn TorrentMode>,
    ) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::SetMode {
            info_hash,
            mode,
            responder,
        })
        .await?
    }

    /// Runs one scheduler pass. Returns true if a connect was started.
    pub async fn try_connect_all(&self) -> Result<bool, SwarmError> {
        self.request(|responder| SwarmCommand::TryConnectAll { responder })
            .await
    }

    pub async fn stats(&self) -> Result<EngineStats, SwarmError> {
        self.request(|responder| SwarmCommand::Stats { responder })
            .await
    }

    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    pub async fn torrent_snapshot(&self, info_hash: InfoHash) -> Result<TorrentSnapshot, SwarmError> {
        self.request(|responder| SwarmCommand::TorrentSnapshot {
            info_hash,
            responder,
        })
        .await?
    }

    /// Subscribes to engine events from this point on.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SwarmEvent>, SwarmError> {
        self.request(|responder| SwarmCommand::Subscribe { responder })
            .await
    }

    pub async fn add_ban_policy(&self, policy: Box<dyn BanPolicy>) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::AddBanPolicy { policy, responder })
            .await
    }

    /// Stops the actor and waits for confirmation.
    pub async fn shutdown(&self) -> Result<(), SwarmError> {
        self.request(|responder| SwarmCommand::Shutdown { responder })
            .await
    }

    /// Returns true while the actor is accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
