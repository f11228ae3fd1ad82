//! BitTorrent handshake serialization and deserialization

use bytes::BufMut;

use super::ProtocolError;
use super::types::{InfoHash, PROTOCOL_STRING, PeerHandshake, PeerId};

/// Fixed part of a handshake: pstrlen, reserved, info hash and peer id.
const FIXED_LEN: usize = 1 + 8 + 20 + 20;

/// Encoded size of a handshake carrying the standard protocol string.
pub const HANDSHAKE_LEN: usize = FIXED_LEN + PROTOCOL_STRING.len();

impl PeerHandshake {
    /// Encoded size in bytes.
    pub fn byte_length(&self) -> usize {
        FIXED_LEN + self.protocol.len()
    }

    /// Encodes the handshake into `buffer` starting at `offset`.
    ///
    /// # Errors
    /// - `ProtocolError::BufferTooSmall` - Not enough room after `offset`
    /// - `ProtocolError::InvalidHandshake` - Protocol string longer than 255 bytes
    pub fn encode(&self, buffer: &mut [u8], offset: usize) -> Result<usize, ProtocolError> {
        let needed = self.byte_length();
        let available = buffer.len().saturating_sub(offset);
        if available < needed {
            return Err(ProtocolError::BufferTooSmall { needed, available });
        }
        let protocol_len =
            u8::try_from(self.protocol.len()).map_err(|_| ProtocolError::InvalidHandshake {
                reason: "protocol string too long".to_string(),
            })?;

        let mut dst = &mut buffer[offset..offset + needed];
        dst.put_u8(protocol_len);
        dst.put_slice(self.protocol.as_bytes());
        dst.put_slice(&self.reserved);
        dst.put_slice(self.info_hash.as_bytes());
        dst.put_slice(self.peer_id.as_bytes());

        Ok(needed)
    }
}

/// Handshake deserialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `ProtocolError::InvalidHandshake` - Invalid handshake format or length
    pub fn decode(data: &[u8]) -> Result<PeerHandshake, ProtocolError> {
        let Some((&protocol_len, rest)) = data.split_first() else {
            return Err(ProtocolError::InvalidHandshake {
                reason: "empty handshake".to_string(),
            });
        };

        let protocol_len = protocol_len as usize;
        if rest.len() < protocol_len + 8 + 20 + 20 {
            return Err(ProtocolError::InvalidHandshake {
                reason: format!("handshake too short ({} bytes)", data.len()),
            });
        }

        let (protocol, rest) = rest.split_at(protocol_len);
        if protocol != PROTOCOL_STRING.as_bytes() {
            return Err(ProtocolError::InvalidHandshake {
                reason: format!(
                    "unexpected protocol string {:?}",
                    String::from_utf8_lossy(protocol)
                ),
            });
        }
        let (reserved_bytes, rest) = rest.split_at(8);
        let (hash_bytes, rest) = rest.split_at(20);
        let peer_id_bytes = &rest[..20];

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(reserved_bytes);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(hash_bytes);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(peer_id_bytes);

        Ok(PeerHandshake {
            protocol: PROTOCOL_STRING.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}
