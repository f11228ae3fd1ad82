//! Live peer connections and their outbound queues.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;

use crate::network::{Cipher, EncryptionKind, PeerTransport, TransferMonitor};
use crate::protocol::{
    Direction, InfoHash, PeerHandshake, PeerId, PeerMessage, PieceIndex, ProtocolError,
};
use crate::swarm::PeerExchange;

/// Engine-unique identifier of a connection or connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Locates a connection inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub info_hash: InfoHash,
    pub id: ConnectionId,
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Open,
    /// Cleanup has been queued; no further I/O is started
    Closing,
    Closed,
}

/// A peer request waiting to be served from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRequest {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug)]
pub(crate) enum QueuedMessage {
    Message(PeerMessage),
    Block(BlockRequest),
}

/// Something the pump writes to the socket.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Handshake(PeerHandshake),
    Message(PeerMessage),
}

impl Outbound {
    pub fn byte_length(&self) -> usize {
        match self {
            Outbound::Handshake(handshake) => handshake.byte_length(),
            Outbound::Message(message) => message.byte_length(),
        }
    }

    pub fn encode(&self, buffer: &mut [u8], offset: usize) -> Result<usize, ProtocolError> {
        match self {
            Outbound::Handshake(handshake) => handshake.encode(buffer, offset),
            Outbound::Message(message) => message.encode(buffer, offset),
        }
    }

    /// Block payload size for piece messages, used for rate limiting.
    pub fn piece_payload(&self) -> Option<usize> {
        match self {
            Outbound::Message(PeerMessage::Piece { data, .. }) => Some(data.len()),
            _ => None,
        }
    }
}

/// What the pump does once the in-flight send completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AfterSend {
    ReceiveHandshake,
    ContinueQueue,
}

#[derive(Debug)]
pub(crate) struct InFlightSend {
    pub outbound: Outbound,
    pub then: AfterSend,
}

/// One open socket to a remote peer.
///
/// Owned by its torrent's `connected` set and torn down only by the
/// cleanup coordinator.
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) address: SocketAddr,
    pub(crate) direction: Direction,
    pub(crate) state: ConnectionState,
    pub(crate) transport: Option<Arc<dyn PeerTransport>>,
    pub(crate) encryptor: Option<Box<dyn Cipher>>,
    /// Moved into the in-flight receive and handed back on completion
    pub(crate) decryptor: Option<Box<dyn Cipher>>,
    pub(crate) encryption: Option<EncryptionKind>,
    pub(crate) receive_in_flight: bool,
    pub(crate) handshake_complete: bool,
    pub(crate) remote_peer_id: Option<PeerId>,
    pub(crate) connected_at: Option<Instant>,
    pub(crate) last_message_sent: Option<Instant>,
    pub(crate) last_message_received: Option<Instant>,
    pub(crate) last_block_received: Option<Instant>,
    pub(crate) queue: VecDeque<QueuedMessage>,
    pub(crate) current_send: Option<InFlightSend>,
    pub(crate) processing_queue: bool,
    pub(crate) am_choking: bool,
    pub(crate) am_interested: bool,
    pub(crate) peer_choking: bool,
    pub(crate) peer_interested: bool,
    pub(crate) our_requests_in_flight: usize,
    pub(crate) peer_requests_pending: usize,
    pub(crate) remote_pieces: Vec<bool>,
    pub(crate) dht_port: Option<u16>,
    pub(crate) peer_exchange: Option<Box<dyn PeerExchange>>,
    pub(crate) monitor: Arc<TransferMonitor>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        direction: Direction,
        transport: Arc<dyn PeerTransport>,
        piece_count: u32,
    ) -> Self {
        Self {
            id,
            address: transport.address(),
            direction,
            state: ConnectionState::Open,
            transport: Some(transport),
            encryptor: None,
            decryptor: None,
            encryption: None,
            receive_in_flight: false,
            handshake_complete: false,
            remote_peer_id: None,
            connected_at: None,
            last_message_sent: None,
            last_message_received: None,
            last_block_received: None,
            queue: VecDeque::new(),
            current_send: None,
            processing_queue: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            our_requests_in_flight: 0,
            peer_requests_pending: 0,
            remote_pieces: vec![false; piece_count as usize],
            dht_port: None,
            peer_exchange: None,
            monitor: Arc::new(TransferMonitor::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address,
            direction: self.direction,
            state: self.state,
            encryption: self.encryption,
            remote_peer_id: self.remote_peer_id,
            handshake_complete: self.handshake_complete,
            am_choking: self.am_choking,
            am_interested: self.am_interested,
            peer_choking: self.peer_choking,
            peer_interested: self.peer_interested,
            queued_messages: self.queue.len(),
            our_requests_in_flight: self.our_requests_in_flight,
            peer_requests_pending: self.peer_requests_pending,
            receive_in_flight: self.receive_in_flight,
            pieces_available: self.remote_pieces.iter().filter(|&&has| has).count(),
            dht_port: self.dht_port,
            bytes_uploaded: self.monitor.bytes_uploaded(),
            bytes_downloaded: self.monitor.bytes_downloaded(),
        }
    }
}

/// Serializable view of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub address: SocketAddr,
    pub direction: Direction,
    pub state: ConnectionState,
    pub encryption: Option<EncryptionKind>,
    pub remote_peer_id: Option<PeerId>,
    pub handshake_complete: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub queued_messages: usize,
    pub our_requests_in_flight: usize,
    pub peer_requests_pending: usize,
    pub receive_in_flight: bool,
    pub pieces_available: usize,
    pub dht_port: Option<u16>,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}
