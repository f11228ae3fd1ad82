//! BitTorrent wire protocol abstractions and message types.
//!
//! BEP 3 framing for the peer wire: every message knows its own encoded
//! length and writes itself into a caller-provided buffer, so the engine can
//! encode into pooled send buffers without intermediate allocations.

pub mod handshake;
pub mod messages;
pub mod types;

pub use handshake::{HANDSHAKE_LEN, HandshakeCodec};
pub use messages::{MessageCodec, MessageHeader, PIECE_HEADER_LEN};
pub use types::{Direction, InfoHash, PeerHandshake, PeerId, PeerMessage, PieceIndex};

/// Violations of the peer wire protocol.
///
/// The `Display` text is what ends up as a connection's disconnect reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("info hash mismatch: expected {expected}, received {received}")]
    InfoHashMismatch {
        expected: InfoHash,
        received: InfoHash,
    },

    #[error("connected to self")]
    SelfConnection,

    #[error("peer id mismatch: expected {expected}, received {received}")]
    PeerIdMismatch { expected: PeerId, received: PeerId },

    #[error("malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("unknown message id {id}")]
    UnknownMessageId { id: u8 },

    #[error("buffer too small: need {needed} bytes, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("invalid handshake: {reason}")]
    InvalidHandshake { reason: String },

    #[error("piece index {index} out of range")]
    InvalidPieceIndex { index: u32 },

    #[error("message of {length} bytes exceeds limit of {max}")]
    MessageTooLong { length: usize, max: usize },
}
