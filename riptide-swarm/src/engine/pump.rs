//! Steady-state message pump: one send and one receive in flight per
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use super::cleanup::DisconnectReason;
use super::connection::{AfterSend, BlockRequest, ConnectionKey, Outbound, QueuedMessage};
use super::core::{Completion, ConnectionEngine};
use crate::SwarmError;
use crate::network::{Cipher, PeerTransport, RateLimiter, TransportError};
use crate::protocol::messages::{LENGTH_PREFIX_LEN, MESSAGE_HEADER_LEN, PIECE_MESSAGE_ID};
use crate::protocol::{
    HandshakeCodec, InfoHash, MessageCodec, PIECE_HEADER_LEN, PeerHandshake, PeerMessage,
    ProtocolError,
};
use crate::storage::DiskError;

/// Largest block a peer may request.
pub const MAX_BLOCK_LENGTH: u32 = 128 * 1024;

/// Why an inbound read did not produce a message.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ReceiveError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reads one handshake: the pstrlen byte, then the rest of the frame.
pub(crate) async fn receive_handshake(
    transport: &dyn PeerTransport,
    decryptor: &mut dyn Cipher,
) -> Result<PeerHandshake, ReceiveError> {
    let mut length = [0u8; 1];
    transport.receive(&mut length).await?;
    decryptor.apply(&mut length);

    let mut frame = vec![0u8; 1 + length[0] as usize + 48];
    frame[0] = length[0];
    transport.receive(&mut frame[1..]).await?;
    decryptor.apply(&mut frame[1..]);

    Ok(HandshakeCodec::decode(&frame)?)
}

/// Reads one framed message, paying the download limiters for block data
/// before the payload is pulled off the socket.
async fn receive_message(
    transport: &dyn PeerTransport,
    decryptor: &mut dyn Cipher,
    max_length: usize,
    limiters: [&RateLimiter; 2],
) -> Result<PeerMessage, ReceiveError> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    transport.receive(&mut prefix).await?;
    decryptor.apply(&mut prefix);

    let length = u32::from_be_bytes(prefix) as usize;
    if length == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if length > max_length {
        return Err(ProtocolError::MessageTooLong {
            length,
            max: max_length,
        }
        .into());
    }

    let mut frame = vec![0u8; LENGTH_PREFIX_LEN + length];
    frame[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);
    transport
        .receive(&mut frame[LENGTH_PREFIX_LEN..MESSAGE_HEADER_LEN])
        .await?;
    decryptor.apply(&mut frame[LENGTH_PREFIX_LEN..MESSAGE_HEADER_LEN]);

    let header = MessageCodec::read_header(&frame[..MESSAGE_HEADER_LEN])?;
    if header.is_piece() {
        let payload = length.saturating_sub(PIECE_HEADER_LEN - LENGTH_PREFIX_LEN) as u64;
        for limiter in limiters {
            limiter.acquire(payload).await;
        }
    }

    transport.receive(&mut frame[MESSAGE_HEADER_LEN..]).await?;
    decryptor.apply(&mut frame[MESSAGE_HEADER_LEN..]);

    Ok(MessageCodec::decode(&frame)?)
}

/// Writes the 13-byte piece header in front of a block read from disk.
fn write_piece_header(frame: &mut [u8], request: &BlockRequest) {
    let mut header = &mut frame[..PIECE_HEADER_LEN];
    header.put_u32(9 + request.length);
    header.put_u8(PIECE_MESSAGE_ID);
    header.put_u32(request.piece_index.as_u32());
    header.put_u32(request.offset);
}

impl ConnectionEngine {
    /// Encodes `outbound` into a pooled frame and puts it on the wire.
    pub(crate) fn send(&mut self, key: ConnectionKey, outbound: Outbound, then: AfterSend) {
        if self.open_connection_mut(key).is_none() {
            return;
        }

        let mut frame = self.buffers.acquire(outbound.byte_length());
        if let Err(e) = outbound.encode(&mut frame, 0) {
            self.buffers.release(frame);
            self.schedule_cleanup(
                key,
                DisconnectReason::SendException {
                    message: e.to_string(),
                },
            );
            return;
        }
        self.dispatch_frame(key, outbound, frame, then);
    }

    fn dispatch_frame(
        &mut self,
        key: ConnectionKey,
        outbound: Outbound,
        mut frame: BytesMut,
        then: AfterSend,
    ) {
        let engine_limiter = Arc::clone(&self.upload_limiter);
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            self.buffers.release(frame);
            return;
        };
        let torrent_limiter = Arc::clone(&torrent.upload_limiter);
        let torrent_monitor = Arc::clone(&torrent.monitor);
        let Some(connection) = torrent.connected.get_mut(&key.id).filter(|c| c.is_open()) else {
            self.buffers.release(frame);
            return;
        };
        let Some(transport) = connection.transport.clone() else {
            self.buffers.release(frame);
            return;
        };

        if let Some(encryptor) = connection.encryptor.as_mut() {
            encryptor.apply(&mut frame);
        }
        let payload = outbound.piece_payload();
        let connection_monitor = Arc::clone(&connection.monitor);
        connection.current_send = Some(super::connection::InFlightSend { outbound, then });

        let completions = self.completions.clone();
        tokio::spawn(async move {
            if let Some(bytes) = payload {
                engine_limiter.acquire(bytes as u64).await;
                torrent_limiter.acquire(bytes as u64).await;
            }
            let result = transport.send(&frame).await;
            if let (Ok(_), Some(bytes)) = (&result, payload) {
                connection_monitor.record_upload(bytes as u64);
                torrent_monitor.record_upload(bytes as u64);
            }
            let _ = completions.send(Completion::SendFinished { key, result, frame });
        });
    }

    pub(crate) fn on_send_complete(
        &mut self,
        key: ConnectionKey,
        result: Result<usize, TransportError>,
        frame: BytesMut,
    ) {
        self.buffers.release(frame);

        let Some(connection) = self.open_connection_mut(key) else {
            return;
        };
        let Some(sent) = connection.current_send.take() else {
            tracing::warn!("Send completed for {} with nothing in flight", connection.address);
            return;
        };
        if sent.outbound.piece_payload().is_some() {
            connection.peer_requests_pending = connection.peer_requests_pending.saturating_sub(1);
        }

        if let Err(e) = result {
            tracing::debug!("Send to {} failed: {}", connection.address, e);
            self.schedule_cleanup(key, DisconnectReason::SendFailed);
            return;
        }

        match (sent.then, sent.outbound) {
            (AfterSend::ReceiveHandshake, _) => self.start_handshake_receive(key),
            (AfterSend::ContinueQueue, outbound) => {
                connection.last_message_sent = Some(Instant::now());
                let address = connection.address;
                if let Outbound::Message(message) = &outbound {
                    self.notifier.notify_message_transferred(
                        key.info_hash,
                        address,
                        crate::protocol::Direction::Outgoing,
                        message,
                    );
                }
                self.process_queue(key);
            }
        }
    }

    /// Sends the next queued entry, or marks the connection idle.
    pub(crate) fn process_queue(&mut self, key: ConnectionKey) {
        let Some(connection) = self.open_connection_mut(key) else {
            return;
        };
        let Some(entry) = connection.queue.pop_front() else {
            connection.processing_queue = false;
            return;
        };
        connection.processing_queue = true;

        match entry {
            QueuedMessage::Message(message) => {
                self.send(key, Outbound::Message(message), AfterSend::ContinueQueue)
            }
            QueuedMessage::Block(request) => self.read_block(key, request),
        }
    }

    /// Reads a requested block straight into a pooled piece frame.
    fn read_block(&mut self, key: ConnectionKey, request: BlockRequest) {
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            return;
        };
        let offset = u64::from(request.piece_index.as_u32()) * u64::from(torrent.piece_length)
            + u64::from(request.offset);

        let mut frame = self
            .buffers
            .acquire(PIECE_HEADER_LEN + request.length as usize);
        write_piece_header(&mut frame, &request);

        let disk = Arc::clone(&self.disk);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = disk
                .read(key.info_hash, offset, &mut frame[PIECE_HEADER_LEN..])
                .await;
            let _ = completions.send(Completion::BlockRead {
                key,
                request,
                result,
                frame,
            });
        });
    }

    pub(crate) fn on_block_read(
        &mut self,
        key: ConnectionKey,
        request: BlockRequest,
        result: Result<(), DiskError>,
        frame: BytesMut,
    ) {
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            self.buffers.release(frame);
            return;
        };
        if !torrent.connected.get(&key.id).is_some_and(|c| c.is_open()) {
            self.buffers.release(frame);
            return;
        }

        if let Err(e) = result {
            self.buffers.release(frame);
            tracing::warn!("Disk read for block {:?} failed: {}", request, e);
            self.schedule_cleanup(
                key,
                DisconnectReason::SendException {
                    message: e.to_string(),
                },
            );
            return;
        }

        torrent.pieces_sent += 1;
        let message = PeerMessage::Piece {
            piece_index: request.piece_index,
            offset: request.offset,
            data: Bytes::copy_from_slice(&frame[PIECE_HEADER_LEN..]),
        };
        self.dispatch_frame(key, Outbound::Message(message), frame, AfterSend::ContinueQueue);
    }

    /// Arms exactly one receive for the connection.
    pub(crate) fn start_receive(&mut self, key: ConnectionKey) {
        let max_length = self.config.connection.max_message_length;
        let engine_limiter = Arc::clone(&self.download_limiter);
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            return;
        };
        let torrent_limiter = Arc::clone(&torrent.download_limiter);
        let Some(connection) = torrent.connected.get_mut(&key.id).filter(|c| c.is_open()) else {
            return;
        };
        if connection.receive_in_flight {
            return;
        }
        let (Some(transport), Some(mut decryptor)) =
            (connection.transport.clone(), connection.decryptor.take())
        else {
            return;
        };
        connection.receive_in_flight = true;

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = receive_message(
                transport.as_ref(),
                decryptor.as_mut(),
                max_length,
                [engine_limiter.as_ref(), torrent_limiter.as_ref()],
            )
            .await;
            let _ = completions.send(Completion::MessageReceived {
                key,
                result,
                decryptor,
            });
        });
    }

    pub(crate) fn on_message_received(
        &mut self,
        key: ConnectionKey,
        result: Result<PeerMessage, ReceiveError>,
        decryptor: Box<dyn Cipher>,
    ) {
        let Some(connection) = self.open_connection_mut(key) else {
            return;
        };
        connection.receive_in_flight = false;
        connection.decryptor = Some(decryptor);
        let address = connection.address;

        let message = match result {
            Ok(message) => message,
            Err(ReceiveError::Transport(e)) => {
                tracing::debug!("Receive from {} failed: {}", address, e);
                self.schedule_cleanup(key, DisconnectReason::ReceiveFailed);
                return;
            }
            Err(ReceiveError::Protocol(e)) => {
                tracing::debug!("Protocol violation from {}: {}", address, e);
                self.schedule_cleanup(key, DisconnectReason::Protocol(e));
                return;
            }
        };

        self.notifier.notify_message_transferred(
            key.info_hash,
            address,
            crate::protocol::Direction::Incoming,
            &message,
        );

        if let Err(e) = self.apply_message(key, message) {
            tracing::debug!("Protocol violation from {}: {}", address, e);
            self.schedule_cleanup(key, DisconnectReason::Protocol(e));
            return;
        }

        if let Some(connection) = self.open_connection_mut(key) {
            connection.last_message_received = Some(Instant::now());
        }
        self.start_receive(key);
    }

    /// Applies an inbound message to connection and torrent state.
    fn apply_message(&mut self, key: ConnectionKey, message: PeerMessage) -> Result<(), ProtocolError> {
        let Some(torrent) = self.registry.torrent_mut(&key.info_hash) else {
            return Ok(());
        };
        let piece_count = torrent.piece_count;
        let piece_length = torrent.piece_length;
        let Some(connection) = torrent.connected.get_mut(&key.id) else {
            return Ok(());
        };
        let address = connection.address;
        let mut start_queue = false;

        let check_index = |index: u32| {
            if index < piece_count {
                Ok(index as usize)
            } else {
                Err(ProtocolError::InvalidPieceIndex { index })
            }
        };

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                connection.peer_choking = true;
                connection.our_requests_in_flight = 0;
                let cancelled = torrent.picker.cancel_requests(address);
                tracing::debug!("Choked by {}, {} requests cancelled", address, cancelled);
            }
            PeerMessage::Unchoke => connection.peer_choking = false,
            PeerMessage::Interested => connection.peer_interested = true,
            PeerMessage::NotInterested => connection.peer_interested = false,
            PeerMessage::Have { piece_index } => {
                let index = check_index(piece_index.as_u32())?;
                connection.remote_pieces[index] = true;
                torrent.picker.peer_has(address, piece_index);
                if connection.remote_pieces.iter().all(|&has| has)
                    && let Some(peer) = torrent.active.get_mut(&address)
                {
                    peer.is_seeder = true;
                }
            }
            PeerMessage::Bitfield { bitfield } => {
                let expected = (piece_count as usize).div_ceil(8);
                if bitfield.len() != expected {
                    return Err(ProtocolError::MalformedMessage {
                        message: format!(
                            "bitfield of {} bytes, expected {}",
                            bitfield.len(),
                            expected
                        ),
                    });
                }
                for (index, has) in connection.remote_pieces.iter_mut().enumerate() {
                    *has = bitfield[index / 8] & (0x80 >> (index % 8)) != 0;
                }
                torrent.picker.peer_bitfield(address, &connection.remote_pieces);
                if let Some(peer) = torrent.active.get_mut(&address) {
                    peer.is_seeder =
                        piece_count > 0 && connection.remote_pieces.iter().all(|&has| has);
                }
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                check_index(piece_index.as_u32())?;
                if length == 0
                    || length > MAX_BLOCK_LENGTH
                    || u64::from(offset) + u64::from(length) > u64::from(piece_length)
                {
                    return Err(ProtocolError::MalformedMessage {
                        message: format!(
                            "invalid request for piece {piece_index} offset {offset} length {length}"
                        ),
                    });
                }
                if connection.am_choking {
                    tracing::debug!("Ignoring request from choked peer {}", address);
                } else {
                    connection.queue.push_back(QueuedMessage::Block(BlockRequest {
                        piece_index,
                        offset,
                        length,
                    }));
                    connection.peer_requests_pending += 1;
                    start_queue = !connection.processing_queue;
                }
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                check_index(piece_index.as_u32())?;
                connection.last_block_received = Some(Instant::now());
                connection.our_requests_in_flight =
                    connection.our_requests_in_flight.saturating_sub(1);
                connection.monitor.record_download(data.len() as u64);
                torrent.monitor.record_download(data.len() as u64);
                if !torrent
                    .picker
                    .block_received(address, piece_index, offset, &data)
                {
                    tracing::debug!(
                        "Unexpected block {}:{} from {}",
                        piece_index,
                        offset,
                        address
                    );
                }
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                let target = BlockRequest {
                    piece_index,
                    offset,
                    length,
                };
                if let Some(position) = connection
                    .queue
                    .iter()
                    .position(|entry| matches!(entry, QueuedMessage::Block(r) if *r == target))
                {
                    connection.queue.remove(position);
                    connection.peer_requests_pending =
                        connection.peer_requests_pending.saturating_sub(1);
                }
            }
            PeerMessage::Port { port } => connection.dht_port = Some(port),
            PeerMessage::Bundle(messages) => {
                for message in messages {
                    self.apply_message(key, message)?;
                }
            }
        }

        if start_queue {
            self.process_queue(key);
        }
        Ok(())
    }

    /// Queues a host message on the connection to `address`.
    ///
    /// # Errors
    /// - `SwarmError::TorrentNotFound` - Info hash not registered
    /// - `SwarmError::PeerNotConnected` - No open connection to `address`
    pub fn send_message(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        message: PeerMessage,
    ) -> Result<(), SwarmError> {
        let torrent = self.torrent_mut(info_hash)?;
        let id = torrent
            .connection_by_address(&address)
            .ok_or(SwarmError::PeerNotConnected { address })?;
        let Some(connection) = torrent.connected.get_mut(&id) else {
            return Err(SwarmError::PeerNotConnected { address });
        };

        for part in message.clone().into_individual() {
            match part {
                PeerMessage::Unchoke if connection.am_choking => {
                    connection.am_choking = false;
                    torrent.uploading_to += 1;
                }
                PeerMessage::Choke if !connection.am_choking => {
                    connection.am_choking = true;
                    torrent.uploading_to = torrent.uploading_to.saturating_sub(1);
                    let before = connection.queue.len();
                    connection
                        .queue
                        .retain(|entry| !matches!(entry, QueuedMessage::Block(_)));
                    let dropped = before - connection.queue.len();
                    connection.peer_requests_pending =
                        connection.peer_requests_pending.saturating_sub(dropped);
                }
                PeerMessage::Interested => connection.am_interested = true,
                PeerMessage::NotInterested => connection.am_interested = false,
                PeerMessage::Request { .. } => connection.our_requests_in_flight += 1,
                PeerMessage::Cancel { .. } => {
                    connection.our_requests_in_flight =
                        connection.our_requests_in_flight.saturating_sub(1);
                }
                _ => {}
            }
        }

        connection.queue.push_back(QueuedMessage::Message(message));
        let start_queue = !connection.processing_queue;
        if start_queue {
            self.process_queue(ConnectionKey { info_hash, id });
        }
        Ok(())
    }
}
