//! Outbound connection scheduling across torrents.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;

use super::connection::{Connection, ConnectionId, ConnectionKey};
use super::core::{Completion, ConnectionEngine};
use super::registry::PendingConnect;
use crate::network::TransportError;
use crate::protocol::{Direction, InfoHash};

impl ConnectionEngine {
    /// Starts at most one outbound connect, visiting torrents round-robin.
    ///
    /// Returns true if a connect was initiated.
    pub fn try_connect_all(&mut self) -> bool {
        let limits = &self.config.connection;
        if self.registry.open_connections() >= limits.max_open_connections
            || self.registry.half_open() >= limits.max_half_open_connections
        {
            return false;
        }

        let count = self.registry.torrent_count();
        if count == 0 {
            return false;
        }

        let start = self.registry.cursor % count;
        for step in 0..count {
            let index = (start + step) % count;
            if self.try_connect_one(index) {
                self.registry.cursor = (index + 1) % count;
                return true;
            }
        }
        false
    }

    /// Calls [`try_connect_all`](Self::try_connect_all) until no slot or peer is left.
    pub fn fill_connection_slots(&mut self) -> usize {
        let mut started = 0;
        while self.try_connect_all() {
            started += 1;
        }
        started
    }

    fn try_connect_one(&mut self, index: usize) -> bool {
        let Some(torrent) = self.registry.torrent_at_mut(index) else {
            return false;
        };
        if !torrent.mode.can_accept_connections()
            || torrent.open_connections() >= torrent.max_connections
        {
            return false;
        }

        let info_hash = torrent.info_hash;
        let mut peer = loop {
            let Some(peer) = torrent.take_connectable_peer() else {
                return false;
            };
            if !self.notifier.should_ban_peer(&info_hash, &peer) {
                break peer;
            }
            tracing::debug!("Peer {} banned for torrent {}, dropping", peer.address, info_hash);
        };

        let id = self.next_connection_id();
        let address = peer.address;
        let transport = self.connector.create(address);
        peer.last_connection_attempt = Some(Instant::now());

        let Some(torrent) = self.registry.torrent_at_mut(index) else {
            return false;
        };
        torrent.connecting.insert(address, peer);
        self.registry.push_pending(PendingConnect {
            id,
            info_hash,
            address,
            transport: Arc::clone(&transport),
        });

        tracing::debug!("Connecting to {} for torrent {}", address, info_hash);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = transport.connect().await;
            let _ = completions.send(Completion::ConnectFinished {
                info_hash,
                id,
                address,
                result,
            });
        });
        true
    }

    pub(crate) fn on_connect_complete(
        &mut self,
        info_hash: InfoHash,
        id: ConnectionId,
        address: SocketAddr,
        result: Result<(), TransportError>,
    ) {
        let Some(pending) = self.registry.take_pending(id) else {
            // Cancelled while in flight; the transport is already disposed.
            self.try_connect_all();
            return;
        };

        let local_piece_count;
        match self.registry.torrent_mut(&info_hash) {
            None => {
                pending.transport.dispose();
                self.try_connect_all();
                return;
            }
            Some(torrent) if !torrent.mode.can_accept_connections() => {
                pending.transport.dispose();
                if let Some(peer) = torrent.connecting.remove(&address) {
                    torrent.available.push_back(peer);
                }
                self.try_connect_all();
                return;
            }
            Some(torrent) => match result {
                Err(e) => {
                    tracing::debug!("Connection to {} failed: {}", address, e);
                    pending.transport.dispose();
                    if let Some(mut peer) = torrent.connecting.remove(&address) {
                        peer.failed_connection_attempts += 1;
                        torrent.busy.push(peer);
                    }
                    self.notifier
                        .notify_connection_attempt_failed(info_hash, address, e.to_string());
                    self.try_connect_all();
                    return;
                }
                Ok(()) => {
                    if let Some(peer) = torrent.connecting.remove(&address) {
                        torrent.active.insert(address, peer);
                    }
                    local_piece_count = torrent.piece_count;
                }
            },
        }

        tracing::debug!("Connected to {} for torrent {}", address, info_hash);
        let connection = Connection::new(
            id,
            Direction::Outgoing,
            pending.transport,
            local_piece_count,
        );
        self.on_fresh_connection(ConnectionKey { info_hash, id }, connection);
        self.try_connect_all();
    }

    /// Disposes every in-flight connect of a torrent and returns the peers
    /// to `available`.
    pub fn cancel_pending(&mut self, info_hash: InfoHash) -> usize {
        let cancelled = self.registry.take_pending_for(&info_hash);
        let torrent = self.registry.torrent_mut(&info_hash);
        let count = cancelled.len();

        if let Some(torrent) = torrent {
            for pending in &cancelled {
                if let Some(peer) = torrent.connecting.remove(&pending.address) {
                    torrent.available.push_back(peer);
                }
            }
        }
        for pending in cancelled {
            pending.transport.dispose();
        }

        if count > 0 {
            tracing::debug!("Cancelled {} pending connects for torrent {}", count, info_hash);
        }
        count
    }
}
