//! Riptide Swarm - peer connection engine
//!
//! Drives every peer connection of every torrent through one actor: the
//! outbound scheduler, encryption negotiation and handshake, the
//! one-send/one-receive message pump, and connection cleanup.

pub mod config;
pub mod engine;
pub mod network;
pub mod protocol;
pub mod storage;
pub mod swarm;
pub mod tracing_setup;

use std::net::SocketAddr;

pub use config::SwarmConfig;
pub use engine::{SwarmEvent, SwarmHandle, spawn_swarm_engine};
pub use protocol::{InfoHash, PeerId, ProtocolError};
pub use swarm::{Peer, TorrentContext, TorrentSettings};

/// Errors returned to the host by the swarm engine.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("swarm engine has shut down")]
    EngineShutdown,

    #[error("torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("torrent {info_hash} already registered")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("no open connection to {address}")]
    PeerNotConnected { address: SocketAddr },

    #[error("connection from {address} rejected: {reason}")]
    ConnectionRejected { address: SocketAddr, reason: String },
}
