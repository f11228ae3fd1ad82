//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::ProtocolError;
use super::types::{PeerMessage, PieceIndex};

/// Size of the big-endian length prefix in front of every message.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Length prefix plus id byte.
pub const MESSAGE_HEADER_LEN: usize = LENGTH_PREFIX_LEN + 1;

/// Bytes in front of the block payload of a piece message.
pub const PIECE_HEADER_LEN: usize = MESSAGE_HEADER_LEN + 8;

/// Wire id of the piece message.
pub const PIECE_MESSAGE_ID: u8 = 7;

/// Leading length/id header of a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Declared body length (everything after the length prefix)
    pub length: u32,
    /// Message id, `None` for keep-alives
    pub message_id: Option<u8>,
}

impl MessageHeader {
    /// Total on-wire size of the message including its prefix.
    pub fn frame_len(&self) -> usize {
        LENGTH_PREFIX_LEN + self.length as usize
    }

    /// Returns true when the header announces a block payload.
    pub fn is_piece(&self) -> bool {
        self.message_id == Some(PIECE_MESSAGE_ID)
    }
}

impl PeerMessage {
    /// Encoded size in bytes, length prefix included.
    pub fn byte_length(&self) -> usize {
        let body = match self {
            PeerMessage::KeepAlive => 0,
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => 1,
            PeerMessage::Have { .. } => 5,
            PeerMessage::Bitfield { bitfield } => 1 + bitfield.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
            PeerMessage::Piece { data, .. } => 9 + data.len(),
            PeerMessage::Port { .. } => 3,
            PeerMessage::Bundle(messages) => {
                return messages.iter().map(PeerMessage::byte_length).sum();
            }
        };
        LENGTH_PREFIX_LEN + body
    }

    /// Encodes the message into `buffer` starting at `offset`.
    ///
    /// Returns the number of bytes written, which always equals
    /// [`byte_length`](Self::byte_length).
    ///
    /// # Errors
    /// - `ProtocolError::BufferTooSmall` - Not enough room after `offset`
    pub fn encode(&self, buffer: &mut [u8], offset: usize) -> Result<usize, ProtocolError> {
        let needed = self.byte_length();
        let available = buffer.len().saturating_sub(offset);
        if available < needed {
            return Err(ProtocolError::BufferTooSmall { needed, available });
        }

        if let PeerMessage::Bundle(messages) = self {
            let mut written = 0;
            for message in messages {
                written += message.encode(buffer, offset + written)?;
            }
            return Ok(written);
        }

        let mut dst = &mut buffer[offset..offset + needed];
        dst.put_u32((needed - LENGTH_PREFIX_LEN) as u32);
        if let Some(id) = self.message_id() {
            dst.put_u8(id);
        }

        match self {
            PeerMessage::Have { piece_index } => dst.put_u32(piece_index.as_u32()),
            PeerMessage::Bitfield { bitfield } => dst.put_slice(bitfield),
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            }
            | PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                dst.put_u32(piece_index.as_u32());
                dst.put_u32(*offset);
                dst.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                dst.put_u32(piece_index.as_u32());
                dst.put_u32(*offset);
                dst.put_slice(data);
            }
            PeerMessage::Port { port } => dst.put_u16(*port),
            _ => {}
        }

        Ok(needed)
    }
}

/// Message deserialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Reads the length prefix and, when present, the id byte.
    ///
    /// Accepts the first 4 bytes alone for keep-alives; any other message
    /// needs its id byte as well.
    ///
    /// # Errors
    /// - `ProtocolError::MalformedMessage` - Fewer bytes than the header needs
    pub fn read_header(data: &[u8]) -> Result<MessageHeader, ProtocolError> {
        if data.len() < LENGTH_PREFIX_LEN {
            return Err(ProtocolError::MalformedMessage {
                message: "Message too short".to_string(),
            });
        }

        let mut buf = data;
        let length = buf.get_u32();
        if length == 0 {
            return Ok(MessageHeader {
                length,
                message_id: None,
            });
        }

        if buf.is_empty() {
            return Err(ProtocolError::MalformedMessage {
                message: "Missing message id".to_string(),
            });
        }

        Ok(MessageHeader {
            length,
            message_id: Some(buf.get_u8()),
        })
    }

    /// Decodes one complete framed message (length prefix included).
    ///
    /// # Errors
    /// - `ProtocolError::MalformedMessage` - Truncated input or bad field sizes
    /// - `ProtocolError::UnknownMessageId` - Id outside the BEP 3 set
    pub fn decode(data: &[u8]) -> Result<PeerMessage, ProtocolError> {
        let header = Self::read_header(data)?;
        let Some(message_id) = header.message_id else {
            return Ok(PeerMessage::KeepAlive);
        };

        if data.len() < header.frame_len() {
            return Err(ProtocolError::MalformedMessage {
                message: "Incomplete message".to_string(),
            });
        }

        let length = header.length;
        let mut buf = &data[MESSAGE_HEADER_LEN..header.frame_len()];

        let expect_len = |expected: u32, name: &str| {
            if length == expected {
                Ok(())
            } else {
                Err(ProtocolError::MalformedMessage {
                    message: format!("Invalid {name} message length {length}"),
                })
            }
        };

        match message_id {
            0 => expect_len(1, "Choke").map(|_| PeerMessage::Choke),
            1 => expect_len(1, "Unchoke").map(|_| PeerMessage::Unchoke),
            2 => expect_len(1, "Interested").map(|_| PeerMessage::Interested),
            3 => expect_len(1, "NotInterested").map(|_| PeerMessage::NotInterested),
            4 => {
                expect_len(5, "Have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(buf),
            }),
            6 | 8 => {
                expect_len(13, if message_id == 6 { "Request" } else { "Cancel" })?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(if message_id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            PIECE_MESSAGE_ID => {
                if length < 9 {
                    return Err(ProtocolError::MalformedMessage {
                        message: "Invalid Piece message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            9 => {
                expect_len(3, "Port")?;
                Ok(PeerMessage::Port {
                    port: buf.get_u16(),
                })
            }
            id => Err(ProtocolError::UnknownMessageId { id }),
        }
    }
}
