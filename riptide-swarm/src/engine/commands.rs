//! Command definitions for the swarm engine actor.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::events::{BanPolicy, SwarmEvent};
use crate::SwarmError;
use crate::network::PeerTransport;
use crate::protocol::{InfoHash, PeerMessage};
use crate::swarm::{Peer, TorrentContext, TorrentMode, TorrentSnapshot};

/// Commands accepted by the swarm engine actor.
///
/// Each command carries a response channel; the actor applies commands one
/// at a time, interleaved with I/O completions.
pub enum SwarmCommand {
    /// Register a torrent with the engine.
    AddTorrent {
        torrent: TorrentContext,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// Tear down every connection of a torrent and forget it.
    RemoveTorrent {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// Add discovered peers to a torrent.
    AddPeers {
        info_hash: InfoHash,
        peers: Vec<Peer>,
        responder: oneshot::Sender<Result<usize, SwarmError>>,
    },
    /// Move peers that failed to connect back to `available`.
    RequeueBusyPeers {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<usize, SwarmError>>,
    },
    /// Hand an accepted incoming transport to the engine.
    AcceptIncoming {
        info_hash: InfoHash,
        transport: Arc<dyn PeerTransport>,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// Queue a message on an open connection.
    SendMessage {
        info_hash: InfoHash,
        address: SocketAddr,
        message: PeerMessage,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// Close the connection to a peer.
    DisconnectPeer {
        info_hash: InfoHash,
        address: SocketAddr,
        reason: String,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// Abort every in-flight connect of a torrent.
    CancelPending {
        info_hash: InfoHash,
        responder: oneshot::Sender<usize>,
    },
    /// Exclude a peer from reuse after its next cleanup.
    MarkInactive {
        info_hash: InfoHash,
        address: SocketAddr,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// Replace a torrent's mode.
    SetMode {
        info_hash: InfoHash,
        mode: Box<dyn TorrentMode>,
        responder: oneshot::Sender<Result<(), SwarmError>>,
    },
    /// Run one scheduler pass immediately.
    TryConnectAll { responder: oneshot::Sender<bool> },
    /// Engine-wide connection counts.
    Stats {
        responder: oneshot::Sender<EngineStats>,
    },
    /// Point-in-time view of one torrent.
    TorrentSnapshot {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<TorrentSnapshot, SwarmError>>,
    },
    /// Register an event subscriber.
    Subscribe {
        responder: oneshot::Sender<mpsc::UnboundedReceiver<SwarmEvent>>,
    },
    /// Register a ban policy consulted before outbound connects.
    AddBanPolicy {
        policy: Box<dyn BanPolicy>,
        responder: oneshot::Sender<()>,
    },
    /// Stop the actor.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Engine-wide connection counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub open_connections: usize,
    pub half_open_connections: usize,
    pub max_open_connections: usize,
    pub max_half_open_connections: usize,
    pub torrents: usize,
}
