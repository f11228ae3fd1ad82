//! Torrent modes controlling connection policy.

use super::peer::Peer;

/// Per-torrent connection policy consulted by the scheduler.
pub trait TorrentMode: Send {
    /// Whether the torrent takes new connections at all.
    fn can_accept_connections(&self) -> bool;

    /// Whether an outbound connect to `peer` is worthwhile.
    fn should_connect(&self, peer: &Peer) -> bool;

    fn name(&self) -> &'static str;
}

/// Connects to every peer while pieces are still missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownloadingMode;

impl TorrentMode for DownloadingMode {
    fn can_accept_connections(&self) -> bool {
        true
    }

    fn should_connect(&self, _peer: &Peer) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "downloading"
    }
}

/// Complete torrent: other seeders have nothing to gain from us.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeedingMode;

impl TorrentMode for SeedingMode {
    fn can_accept_connections(&self) -> bool {
        true
    }

    fn should_connect(&self, peer: &Peer) -> bool {
        !peer.is_seeder
    }

    fn name(&self) -> &'static str {
        "seeding"
    }
}

/// Paused torrent. No connections are made or accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoppedMode;

impl TorrentMode for StoppedMode {
    fn can_accept_connections(&self) -> bool {
        false
    }

    fn should_connect(&self, _peer: &Peer) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "stopped"
    }
}
