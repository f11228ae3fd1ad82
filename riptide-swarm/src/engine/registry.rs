//! Owned registry of torrent contexts and in-flight connects.

use std::net::SocketAddr;
use std::sync::Arc;

use super::connection::ConnectionId;
use crate::network::PeerTransport;
use crate::protocol::InfoHash;
use crate::swarm::TorrentContext;

/// An outbound connect that has not resolved yet.
pub(crate) struct PendingConnect {
    pub id: ConnectionId,
    pub info_hash: InfoHash,
    pub address: SocketAddr,
    pub transport: Arc<dyn PeerTransport>,
}

/// Torrents in scheduling order plus every pending connect.
///
/// Connection counts are derived from the contexts on demand so they can
/// never drift from the sets they describe.
#[derive(Default)]
pub(crate) struct Registry {
    torrents: Vec<TorrentContext>,
    pending: Vec<PendingConnect>,
    /// Round-robin position of the scheduler
    pub cursor: usize,
}

impl Registry {
    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.torrents.iter().any(|t| t.info_hash == *info_hash)
    }

    /// Appends a torrent. Returns it back if the info hash is already known.
    pub fn add_torrent(&mut self, torrent: TorrentContext) -> Result<(), TorrentContext> {
        if self.contains(&torrent.info_hash) {
            return Err(torrent);
        }
        self.torrents.push(torrent);
        Ok(())
    }

    pub fn remove_torrent(&mut self, info_hash: &InfoHash) -> Option<TorrentContext> {
        let index = self
            .torrents
            .iter()
            .position(|t| t.info_hash == *info_hash)?;
        let torrent = self.torrents.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.torrents.len() {
            self.cursor = 0;
        }
        Some(torrent)
    }

    pub fn torrent(&self, info_hash: &InfoHash) -> Option<&TorrentContext> {
        self.torrents.iter().find(|t| t.info_hash == *info_hash)
    }

    pub fn torrent_mut(&mut self, info_hash: &InfoHash) -> Option<&mut TorrentContext> {
        self.torrents.iter_mut().find(|t| t.info_hash == *info_hash)
    }

    pub fn torrent_at_mut(&mut self, index: usize) -> Option<&mut TorrentContext> {
        self.torrents.get_mut(index)
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    /// Open connections across every torrent.
    pub fn open_connections(&self) -> usize {
        self.torrents.iter().map(TorrentContext::open_connections).sum()
    }

    /// Outbound connects still in flight.
    pub fn half_open(&self) -> usize {
        self.pending.len()
    }

    pub fn push_pending(&mut self, pending: PendingConnect) {
        self.pending.push(pending);
    }

    pub fn take_pending(&mut self, id: ConnectionId) -> Option<PendingConnect> {
        let index = self.pending.iter().position(|p| p.id == id)?;
        Some(self.pending.swap_remove(index))
    }

    /// Removes every pending connect belonging to `info_hash`.
    pub fn take_pending_for(&mut self, info_hash: &InfoHash) -> Vec<PendingConnect> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.info_hash == *info_hash);
        self.pending = kept;
        taken
    }
}
