//! Core identifiers and message types for the BitTorrent wire protocol

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Protocol identifier carried in every BEP 3 handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Client prefix embedded in generated peer ids.
pub const CLIENT_PREFIX: &[u8; 8] = b"-RS0001-";

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file. Used as
/// the key of every torrent context registered with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for InfoHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(s, &mut hash).map_err(|e| ProtocolError::MalformedMessage {
            message: format!("invalid info hash '{s}': {e}"),
        })?;
        Ok(Self(hash))
    }
}

/// BitTorrent peer identifier.
///
/// 20-byte identifier exchanged in handshakes. The engine's own id is
/// compared against every remote id to reject connections to ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a random peer ID carrying the client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0[..8]))?;
        f.write_str(&hex::encode(&self.0[8..]))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// We dialed the remote peer.
    Outgoing,
    /// The remote peer dialed us.
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outgoing => write!(f, "outgoing"),
            Direction::Incoming => write!(f, "incoming"),
        }
    }
}

/// BitTorrent wire protocol messages.
///
/// The BEP 3 message set plus `Bundle`, an internal aggregate that is
/// written to the socket as consecutive framed messages and reported to
/// observers one sub-message at a time. A bundle is never decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    /// Sender is choking the receiver
    Choke,
    /// Sender is no longer choking the receiver
    Unchoke,
    /// Sender wants pieces the receiver has
    Interested,
    /// Sender no longer wants pieces from the receiver
    NotInterested,
    /// Sender has acquired a piece
    Have {
        /// Index of the piece the sender now has
        piece_index: PieceIndex,
    },
    /// Sender's complete piece availability bitmap
    Bitfield {
        /// Bitmap indicating which pieces the sender has
        bitfield: Bytes,
    },
    /// Request for a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// A block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The block payload
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
    /// Sender's DHT listen port
    Port {
        /// UDP port for DHT communication
        port: u16,
    },
    /// Internal aggregate of several messages sent as one write
    Bundle(Vec<PeerMessage>),
}

impl PeerMessage {
    /// Wire id of this message, `None` for keep-alives and bundles.
    pub fn message_id(&self) -> Option<u8> {
        match self {
            PeerMessage::KeepAlive | PeerMessage::Bundle(_) => None,
            PeerMessage::Choke => Some(0),
            PeerMessage::Unchoke => Some(1),
            PeerMessage::Interested => Some(2),
            PeerMessage::NotInterested => Some(3),
            PeerMessage::Have { .. } => Some(4),
            PeerMessage::Bitfield { .. } => Some(5),
            PeerMessage::Request { .. } => Some(6),
            PeerMessage::Piece { .. } => Some(7),
            PeerMessage::Cancel { .. } => Some(8),
            PeerMessage::Port { .. } => Some(9),
        }
    }

    /// Returns true for block payload messages.
    pub fn is_piece(&self) -> bool {
        matches!(self, PeerMessage::Piece { .. })
    }

    /// Flattens bundles (recursively) into their individual messages.
    pub fn into_individual(self) -> Vec<PeerMessage> {
        match self {
            PeerMessage::Bundle(messages) => messages
                .into_iter()
                .flat_map(PeerMessage::into_individual)
                .collect(),
            message => vec![message],
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers establishing protocol compatibility and
/// the torrent both sides are talking about.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL_STRING.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
