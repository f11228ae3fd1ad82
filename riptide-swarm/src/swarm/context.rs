//! Per-torrent connection state owned by the engine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use super::mode::{DownloadingMode, TorrentMode};
use super::peer::{Peer, PeerInfo};
use crate::engine::connection::{Connection, ConnectionId, ConnectionInfo, ConnectionState};
use crate::network::{EncryptionTypes, RateLimiter, TransferMonitor};
use crate::protocol::{InfoHash, PieceIndex};

/// Piece selection collaborator.
///
/// The engine reports what peers have and deliver; choosing what to
/// request is left entirely to the implementation.
pub trait PiecePicker: Send {
    /// Forgets every outstanding request made to `address`.
    ///
    /// Returns the number of requests dropped.
    fn cancel_requests(&mut self, address: SocketAddr) -> usize;

    /// A requested block arrived. Returns false if it was not expected.
    fn block_received(
        &mut self,
        address: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: &Bytes,
    ) -> bool;

    fn peer_has(&mut self, _address: SocketAddr, _piece_index: PieceIndex) {}

    fn peer_bitfield(&mut self, _address: SocketAddr, _pieces: &[bool]) {}
}

/// Picker for torrents that never download.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPicker;

impl PiecePicker for NullPicker {
    fn cancel_requests(&mut self, _address: SocketAddr) -> usize {
        0
    }

    fn block_received(
        &mut self,
        _address: SocketAddr,
        _piece_index: PieceIndex,
        _offset: u32,
        _data: &Bytes,
    ) -> bool {
        false
    }
}

/// Peer exchange sub-session attached to an extension-capable connection.
pub trait PeerExchange: Send {
    fn dispose(&mut self);
}

/// Creates peer exchange sessions for connections that advertise the
/// extension protocol.
pub trait PeerExchangeFactory: Send + Sync {
    fn create(&self, info_hash: InfoHash, address: SocketAddr) -> Box<dyn PeerExchange>;
}

/// Static description of a torrent registered with the engine.
#[derive(Debug, Clone)]
pub struct TorrentSettings {
    pub info_hash: InfoHash,
    pub piece_length: u32,
    pub piece_count: u32,
    pub max_connections: usize,
    /// Narrows the engine-wide allowed encryption for this torrent
    pub allowed_encryption: Option<EncryptionTypes>,
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
}

impl TorrentSettings {
    pub fn new(info_hash: InfoHash, piece_length: u32, piece_count: u32) -> Self {
        Self {
            info_hash,
            piece_length,
            piece_count,
            max_connections: 50,
            allowed_encryption: None,
            upload_limit: None,
            download_limit: None,
        }
    }
}

/// Connection bookkeeping for one torrent.
///
/// Every known peer sits in exactly one of `available`, `connecting`,
/// `active` or `busy`. Open sockets live in `connected`.
pub struct TorrentContext {
    pub(crate) info_hash: InfoHash,
    pub(crate) piece_length: u32,
    pub(crate) piece_count: u32,
    pub(crate) max_connections: usize,
    pub(crate) available: VecDeque<Peer>,
    pub(crate) connecting: HashMap<SocketAddr, Peer>,
    pub(crate) active: HashMap<SocketAddr, Peer>,
    pub(crate) busy: Vec<Peer>,
    pub(crate) connected: HashMap<ConnectionId, Connection>,
    pub(crate) picker: Box<dyn PiecePicker>,
    pub(crate) mode: Box<dyn TorrentMode>,
    pub(crate) peer_exchange: Option<Arc<dyn PeerExchangeFactory>>,
    pub(crate) upload_limiter: Arc<RateLimiter>,
    pub(crate) download_limiter: Arc<RateLimiter>,
    pub(crate) allowed_encryption: Option<EncryptionTypes>,
    pub(crate) inactive_peers: HashSet<SocketAddr>,
    pub(crate) uploading_to: usize,
    pub(crate) pieces_sent: u64,
    pub(crate) monitor: Arc<TransferMonitor>,
}

impl TorrentContext {
    /// Creates a context in downloading mode with no picker.
    pub fn new(settings: TorrentSettings) -> Self {
        Self {
            info_hash: settings.info_hash,
            piece_length: settings.piece_length,
            piece_count: settings.piece_count,
            max_connections: settings.max_connections,
            available: VecDeque::new(),
            connecting: HashMap::new(),
            active: HashMap::new(),
            busy: Vec::new(),
            connected: HashMap::new(),
            picker: Box::new(NullPicker),
            mode: Box::new(DownloadingMode),
            peer_exchange: None,
            upload_limiter: Arc::new(RateLimiter::from_limit(settings.upload_limit)),
            download_limiter: Arc::new(RateLimiter::from_limit(settings.download_limit)),
            allowed_encryption: settings.allowed_encryption,
            inactive_peers: HashSet::new(),
            uploading_to: 0,
            pieces_sent: 0,
            monitor: Arc::new(TransferMonitor::new()),
        }
    }

    pub fn with_picker(mut self, picker: Box<dyn PiecePicker>) -> Self {
        self.picker = picker;
        self
    }

    pub fn with_mode(mut self, mode: Box<dyn TorrentMode>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_peer_exchange(mut self, factory: Arc<dyn PeerExchangeFactory>) -> Self {
        self.peer_exchange = Some(factory);
        self
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Connections counted against limits. Closing connections are excluded.
    pub fn open_connections(&self) -> usize {
        self.connected
            .values()
            .filter(|c| c.state == ConnectionState::Open)
            .count()
    }

    /// Returns true if any peer set already holds `address`.
    pub fn knows(&self, address: &SocketAddr) -> bool {
        self.connecting.contains_key(address)
            || self.active.contains_key(address)
            || self.available.iter().any(|p| p.address == *address)
            || self.busy.iter().any(|p| p.address == *address)
    }

    /// Appends unknown peers to `available`, returning how many were added.
    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = Peer>) -> usize {
        let mut added = 0;
        for peer in peers {
            if !self.knows(&peer.address) {
                self.available.push_back(peer);
                added += 1;
            }
        }
        added
    }

    /// Removes and returns the first available peer the mode wants.
    pub(crate) fn take_connectable_peer(&mut self) -> Option<Peer> {
        let index = self
            .available
            .iter()
            .position(|peer| self.mode.should_connect(peer))?;
        self.available.remove(index)
    }

    /// Takes `address` out of `available` or `busy`.
    pub(crate) fn take_idle_peer(&mut self, address: &SocketAddr) -> Option<Peer> {
        if let Some(index) = self.available.iter().position(|p| p.address == *address) {
            return self.available.remove(index);
        }
        let index = self.busy.iter().position(|p| p.address == *address)?;
        Some(self.busy.remove(index))
    }

    /// Moves every busy peer to the back of `available`.
    pub fn requeue_busy_peers(&mut self) -> usize {
        let count = self.busy.len();
        self.available.extend(self.busy.drain(..));
        count
    }

    pub(crate) fn connection_by_address(&self, address: &SocketAddr) -> Option<ConnectionId> {
        self.connected
            .values()
            .find(|c| c.address == *address && c.state == ConnectionState::Open)
            .map(|c| c.id)
    }

    pub fn snapshot(&self) -> TorrentSnapshot {
        let mut connections: Vec<ConnectionInfo> =
            self.connected.values().map(Connection::info).collect();
        connections.sort_by_key(|c| c.id);

        TorrentSnapshot {
            info_hash: self.info_hash,
            mode: self.mode.name(),
            available: self.available.iter().map(Peer::info).collect(),
            connecting: self.connecting.values().map(Peer::info).collect(),
            active: self.active.values().map(Peer::info).collect(),
            busy: self.busy.iter().map(Peer::info).collect(),
            connections,
            uploading_to: self.uploading_to,
            pieces_sent: self.pieces_sent,
            bytes_uploaded: self.monitor.bytes_uploaded(),
            bytes_downloaded: self.monitor.bytes_downloaded(),
        }
    }
}

/// Serializable view of a torrent's peers and connections.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentSnapshot {
    pub info_hash: InfoHash,
    pub mode: &'static str,
    pub available: Vec<PeerInfo>,
    pub connecting: Vec<PeerInfo>,
    pub active: Vec<PeerInfo>,
    pub busy: Vec<PeerInfo>,
    pub connections: Vec<ConnectionInfo>,
    pub uploading_to: usize,
    pub pieces_sent: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl TorrentSnapshot {
    /// Peer record for `address` in whichever set holds it.
    pub fn peer(&self, address: SocketAddr) -> Option<&PeerInfo> {
        self.available
            .iter()
            .chain(&self.connecting)
            .chain(&self.active)
            .chain(&self.busy)
            .find(|p| p.address == address)
    }

    /// Tracked connection to `address`, if any.
    pub fn connection(&self, address: SocketAddr) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| c.address == address)
    }
}
