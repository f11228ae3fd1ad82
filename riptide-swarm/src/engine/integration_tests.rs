//! End-to-end scenarios for the connection engine over mock transports.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::SwarmError;
    use crate::config::SwarmConfig;
    use crate::engine::cleanup::DisconnectReason;
    use crate::engine::connection::ConnectionKey;
    use crate::engine::events::{BanVerdict, SwarmEvent};
    use crate::engine::test_mocks::{
        ConnectOutcome, Harness, MockDisk, MockNegotiator, MockPeerExchange, MockTransport,
        RecordingPicker,
    };
    use crate::network::{EncryptionError, EncryptionKind, EncryptionTypes, PeerTransport};
    use crate::protocol::{
        Direction, InfoHash, PeerHandshake, PeerId, PeerMessage, PieceIndex, ProtocolError,
    };
    use crate::swarm::{Peer, StoppedMode, TorrentContext, TorrentSettings};

    const PIECE_LENGTH: u32 = 32768;

    fn address(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 6881))
    }

    fn info_hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    fn remote_id(address: SocketAddr) -> PeerId {
        let mut id = *b"-XX0001-remote000000";
        if let SocketAddr::V4(v4) = address {
            id[19] = v4.ip().octets()[3];
        }
        PeerId::new(id)
    }

    fn torrent(hash: InfoHash) -> TorrentContext {
        TorrentContext::new(TorrentSettings::new(hash, PIECE_LENGTH, 8))
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SwarmEvent>) -> Vec<SwarmEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn disconnect_reasons(events: &[SwarmEvent]) -> Vec<DisconnectReason> {
        events
            .iter()
            .filter_map(|event| match event {
                SwarmEvent::PeerDisconnected { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }

    fn key(harness: &Harness, hash: InfoHash, peer: SocketAddr) -> ConnectionKey {
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        ConnectionKey {
            info_hash: hash,
            id: snapshot.connection(peer).unwrap().id,
        }
    }

    /// Dials `peer`, answers with its handshake and waits for the message loop.
    async fn connect_peer(harness: &mut Harness, hash: InfoHash, peer: SocketAddr) -> Arc<MockTransport> {
        harness.engine.add_peers(hash, vec![Peer::new(peer)]).unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(peer).unwrap();
        transport.push_handshake(hash, remote_id(peer));
        harness.settle().await;
        transport
    }

    #[tokio::test]
    async fn test_failed_connects_move_peer_to_busy() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(1);
        let mut events = harness.engine.subscribe();
        harness.connector.script(address(1), ConnectOutcome::Fail);
        harness.engine.add_torrent(torrent(hash)).unwrap();

        harness.engine.add_peers(hash, vec![Peer::new(address(1))]).unwrap();
        harness.settle().await;
        assert_eq!(harness.engine.requeue_busy_peers(hash).unwrap(), 1);
        harness.settle().await;

        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.busy.len(), 1);
        assert_eq!(snapshot.busy[0].failed_connection_attempts, 2);
        assert!(snapshot.available.is_empty());
        assert_eq!(harness.engine.stats().half_open_connections, 0);
        assert!(harness.connector.transport(address(1)).unwrap().is_disposed());

        let failures = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SwarmEvent::ConnectionAttemptFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_disallowed_encryption_closes_before_handshake() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(2);
        let mut events = harness.engine.subscribe();
        let mut settings = TorrentSettings::new(hash, PIECE_LENGTH, 8);
        settings.allowed_encryption = Some(EncryptionTypes::RC4_FULL);
        harness
            .engine
            .add_torrent(TorrentContext::new(settings))
            .unwrap();

        harness.engine.add_peers(hash, vec![Peer::new(address(1))]).unwrap();
        harness.settle().await;

        let reasons = disconnect_reasons(&drain(&mut events));
        assert_eq!(
            reasons[0],
            DisconnectReason::Encryption(EncryptionError::Disallowed {
                kind: EncryptionKind::PlainText
            })
        );
        assert!(reasons[0].to_string().contains("PlainText"));
        assert!(
            harness
                .connector
                .transport(address(1))
                .unwrap()
                .sent_frames()
                .is_empty()
        );

        // The peer is retried until its cleanup budget runs out.
        assert_eq!(reasons.len(), 5);
        assert_eq!(harness.connector.created_for(address(1)), 5);
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert!(snapshot.peer(address(1)).is_none());
        assert_eq!(harness.negotiator.offered()[0], EncryptionTypes::RC4_FULL);
    }

    #[tokio::test]
    async fn test_negotiation_failure_disables_rc4() {
        let mut harness =
            Harness::with_negotiator(SwarmConfig::for_testing(), MockNegotiator::failing("no key"));
        let hash = info_hash(3);
        harness.engine.add_torrent(torrent(hash)).unwrap();

        harness.engine.add_peers(hash, vec![Peer::new(address(1))]).unwrap();
        harness.settle().await;

        let offered = harness.negotiator.offered();
        assert_eq!(offered[0], EncryptionTypes::ALL);
        assert_eq!(offered[1], EncryptionTypes::PLAIN_TEXT);
    }

    #[tokio::test]
    async fn test_leftover_bytes_after_negotiation_close_connection() {
        let mut harness =
            Harness::with_negotiator(SwarmConfig::for_testing(), MockNegotiator::with_leftover(b"xyz"));
        let hash = info_hash(4);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();

        let transport = Arc::new(MockTransport::incoming(address(7)));
        harness.engine.accept_incoming(hash, transport.clone()).unwrap();
        harness.settle().await;

        assert_eq!(
            disconnect_reasons(&drain(&mut events)),
            vec![DisconnectReason::Encryption(EncryptionError::LeftoverBytes { count: 3 })]
        );
        assert!(transport.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_and_inbound_messages() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(5);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();

        let transport = connect_peer(&mut harness, hash, address(1)).await;
        assert_eq!(transport.sent_frames().len(), 1);

        transport.push_message(&PeerMessage::Interested);
        transport.push_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(3),
        });
        transport.push_message(&PeerMessage::Unchoke);
        harness.settle().await;

        let events = drain(&mut events);
        assert!(matches!(
            events[0],
            SwarmEvent::PeerConnected {
                direction: Direction::Outgoing,
                ..
            }
        ));
        let inbound: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SwarmEvent::MessageTransferred {
                    direction: Direction::Incoming,
                    message,
                    ..
                } => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(inbound.len(), 3);
        assert_eq!(inbound[2], PeerMessage::Unchoke);

        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        let connection = snapshot.connection(address(1)).unwrap();
        assert!(connection.handshake_complete);
        assert!(connection.receive_in_flight);
        assert!(connection.peer_interested);
        assert!(!connection.peer_choking);
        assert_eq!(connection.pieces_available, 1);
        assert_eq!(connection.remote_peer_id, Some(remote_id(address(1))));
        assert_eq!(connection.encryption, Some(EncryptionKind::PlainText));
        assert_eq!(
            snapshot.peer(address(1)).unwrap().peer_id,
            Some(remote_id(address(1)))
        );
    }

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(6);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();

        let transport = Arc::new(MockTransport::incoming(address(9)));
        harness.engine.accept_incoming(hash, transport.clone()).unwrap();
        harness.settle().await;
        transport.push_handshake(hash, remote_id(address(9)));
        harness.settle().await;

        let key = key(&harness, hash, address(9));
        harness.engine.schedule_cleanup(key, DisconnectReason::SendFailed);
        harness.engine.schedule_cleanup(key, DisconnectReason::ReceiveFailed);
        assert!(matches!(
            harness
                .engine
                .disconnect_peer(hash, address(9), "bye".to_string()),
            Err(SwarmError::PeerNotConnected { .. })
        ));
        harness.settle().await;
        harness.engine.cleanup_now(key, DisconnectReason::SendFailed);

        assert_eq!(
            disconnect_reasons(&drain(&mut events)),
            vec![DisconnectReason::SendFailed]
        );
        assert_eq!(transport.disposals(), 1);

        // Incoming transports cannot be redialled.
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert!(snapshot.peer(address(9)).is_none());
        assert!(snapshot.connections.is_empty());
    }

    #[tokio::test]
    async fn test_requested_disconnect_requeues_peer() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(7);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        connect_peer(&mut harness, hash, address(1)).await;

        harness
            .engine
            .disconnect_peer(hash, address(1), "choked too long".to_string())
            .unwrap();
        harness.settle().await;

        let reasons = disconnect_reasons(&drain(&mut events));
        assert_eq!(reasons[0].to_string(), "choked too long");
        // Requeued at the front and dialled again straight away.
        assert_eq!(harness.connector.created_for(address(1)), 2);
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.peer(address(1)).unwrap().cleaned_up_count, 1);
    }

    #[tokio::test]
    async fn test_inactive_peer_not_requeued() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(8);
        harness.engine.add_torrent(torrent(hash)).unwrap();
        connect_peer(&mut harness, hash, address(1)).await;

        harness.engine.mark_inactive(hash, address(1)).unwrap();
        harness
            .engine
            .disconnect_peer(hash, address(1), "idle".to_string())
            .unwrap();
        harness.settle().await;

        assert_eq!(harness.connector.created_for(address(1)), 1);
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert!(snapshot.peer(address(1)).is_none());
    }

    #[tokio::test]
    async fn test_self_connection_is_dropped_for_good() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(9);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();

        harness.engine.add_peers(hash, vec![Peer::new(address(1))]).unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(address(1)).unwrap();
        transport.push_handshake(hash, harness.local_peer_id);
        harness.settle().await;

        assert_eq!(
            disconnect_reasons(&drain(&mut events)),
            vec![DisconnectReason::Protocol(ProtocolError::SelfConnection)]
        );
        assert_eq!(harness.connector.created_for(address(1)), 1);
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert!(snapshot.peer(address(1)).is_none());
    }

    #[tokio::test]
    async fn test_info_hash_mismatch() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(10);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();

        harness.engine.add_peers(hash, vec![Peer::new(address(1))]).unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(address(1)).unwrap();
        transport.push_handshake(info_hash(99), remote_id(address(1)));
        harness.settle().await;

        let reasons = disconnect_reasons(&drain(&mut events));
        assert!(matches!(
            reasons[..],
            [DisconnectReason::Protocol(ProtocolError::InfoHashMismatch { .. })]
        ));
    }

    #[tokio::test]
    async fn test_known_peer_id_must_match_handshake() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(31);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();

        let expected = PeerId::new(*b"-TR0001-expected0000");
        let mut peer = Peer::new(address(1));
        peer.peer_id = Some(expected);
        harness.engine.add_peers(hash, vec![peer]).unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(address(1)).unwrap();
        transport.push_handshake(hash, PeerId::new(*b"-XX0001-impostor0000"));
        harness.settle().await;

        let events = drain(&mut events);
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, SwarmEvent::PeerConnected { .. }))
        );
        assert_eq!(
            disconnect_reasons(&events),
            vec![DisconnectReason::Protocol(ProtocolError::PeerIdMismatch {
                expected,
                received: PeerId::new(*b"-XX0001-impostor0000"),
            })]
        );
        assert_eq!(harness.engine.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_matching_peer_id_connects() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(32);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();

        let mut peer = Peer::new(address(1));
        peer.peer_id = Some(remote_id(address(1)));
        harness.engine.add_peers(hash, vec![peer]).unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(address(1)).unwrap();
        transport.push_handshake(hash, remote_id(address(1)));
        harness.settle().await;

        let events = drain(&mut events);
        assert!(disconnect_reasons(&events).is_empty());
        assert!(
            events
                .iter()
                .any(|event| matches!(event, SwarmEvent::PeerConnected { .. }))
        );
    }

    #[tokio::test]
    async fn test_foreign_protocol_handshake_is_rejected() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(33);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();

        harness.engine.add_peers(hash, vec![Peer::new(address(1))]).unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(address(1)).unwrap();
        let mut handshake = PeerHandshake::new(hash, remote_id(address(1)));
        handshake.protocol = "HTTP/1.1 200 OK".to_string();
        let mut frame = vec![0u8; handshake.byte_length()];
        handshake.encode(&mut frame, 0).unwrap();
        transport.push_inbound(&frame);
        harness.settle().await;

        let events = drain(&mut events);
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, SwarmEvent::PeerConnected { .. }))
        );
        assert!(matches!(
            disconnect_reasons(&events)[..],
            [DisconnectReason::Protocol(ProtocolError::InvalidHandshake { .. })]
        ));
    }

    #[tokio::test]
    async fn test_connection_closed_during_handshake_never_reports_connected() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(34);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();

        harness.engine.add_peers(hash, vec![Peer::new(address(1))]).unwrap();
        harness.settle().await;
        harness
            .engine
            .send_message(hash, address(1), PeerMessage::Interested)
            .unwrap();
        let transport = harness.connector.transport(address(1)).unwrap();
        transport.push_handshake(hash, remote_id(address(1)));
        harness
            .engine
            .disconnect_peer(hash, address(1), "shutting down".to_string())
            .unwrap();
        harness.settle().await;

        let events = drain(&mut events);
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, SwarmEvent::PeerConnected { .. }))
        );
        assert_eq!(
            disconnect_reasons(&events),
            vec![DisconnectReason::Requested {
                reason: "shutting down".to_string()
            }]
        );
        assert_eq!(harness.engine.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_scheduler_round_robin_across_torrents() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        for (byte, peers) in [(1u8, [1u8, 2]), (2, [3, 4])] {
            let mut context = torrent(info_hash(byte));
            context.add_peers(peers.map(|n| Peer::new(address(n))));
            for n in peers {
                harness.connector.script(address(n), ConnectOutcome::Hang);
            }
            assert!(harness.engine.registry.add_torrent(context).is_ok());
        }

        assert_eq!(harness.engine.fill_connection_slots(), 4);
        assert_eq!(
            harness.connector.dial_order(),
            vec![address(1), address(3), address(2), address(4)]
        );
    }

    #[tokio::test]
    async fn test_half_open_limit() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(11);
        harness.engine.add_torrent(torrent(hash)).unwrap();
        let peers: Vec<_> = (1..=6).map(|n| Peer::new(address(n))).collect();
        for peer in &peers {
            harness.connector.script(peer.address, ConnectOutcome::Hang);
        }

        harness.engine.add_peers(hash, peers).unwrap();
        harness.settle().await;

        let stats = harness.engine.stats();
        assert_eq!(stats.half_open_connections, 4);
        assert!(!harness.engine.try_connect_all());
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.connecting.len(), 4);
        assert_eq!(snapshot.available.len(), 2);
    }

    #[tokio::test]
    async fn test_open_connection_limit_rejects_extra_connection() {
        let mut config = SwarmConfig::for_testing();
        config.connection.max_open_connections = 2;
        let mut harness = Harness::new(config);
        let hash = info_hash(12);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();

        let peers: Vec<_> = (1..=3).map(|n| Peer::new(address(n))).collect();
        harness.engine.add_peers(hash, peers).unwrap();
        harness.settle().await;

        assert_eq!(harness.engine.stats().open_connections, 2);
        assert_eq!(
            disconnect_reasons(&drain(&mut events)),
            vec![DisconnectReason::TooManyConnections]
        );
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.available.len(), 1);
        assert_eq!(snapshot.active.len(), 2);
    }

    #[tokio::test]
    async fn test_piece_request_served_from_disk() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(13);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;

        harness
            .engine
            .send_message(hash, address(1), PeerMessage::Unchoke)
            .unwrap();
        transport.push_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 16384,
            length: 16384,
        });
        harness.settle().await;

        let sent = transport.sent_messages();
        assert_eq!(sent[0], PeerMessage::Unchoke);
        let PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } = &sent[1]
        else {
            panic!("expected a piece, got {:?}", sent[1]);
        };
        assert_eq!(*piece_index, PieceIndex::new(1));
        assert_eq!(*offset, 16384);
        assert_eq!(data.as_ref(), MockDisk::expected(u64::from(PIECE_LENGTH) + 16384, 16384));
        assert_eq!(
            harness.disk.reads(),
            vec![(u64::from(PIECE_LENGTH) + 16384, 16384)]
        );

        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.pieces_sent, 1);
        assert_eq!(snapshot.uploading_to, 1);
        assert_eq!(snapshot.bytes_uploaded, 16384);
        let connection = snapshot.connection(address(1)).unwrap();
        assert_eq!(connection.peer_requests_pending, 0);
        assert_eq!(connection.queued_messages, 0);
        assert_eq!(harness.engine.buffers.outstanding(), 0);

        let outgoing = drain(&mut events)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    SwarmEvent::MessageTransferred {
                        direction: Direction::Outgoing,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(outgoing, 2);
    }

    #[tokio::test]
    async fn test_request_while_choking_is_ignored() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(14);
        harness.engine.add_torrent(torrent(hash)).unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;

        transport.push_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(0),
            offset: 0,
            length: 16384,
        });
        harness.settle().await;

        assert!(transport.sent_messages().is_empty());
        assert!(harness.disk.reads().is_empty());
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert!(snapshot.connection(address(1)).unwrap().handshake_complete);
    }

    #[tokio::test]
    async fn test_disk_failure_closes_connection() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(15);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;
        harness.disk.fail_reads();

        harness
            .engine
            .send_message(hash, address(1), PeerMessage::Unchoke)
            .unwrap();
        transport.push_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(0),
            offset: 0,
            length: 1024,
        });
        harness.settle().await;

        let reasons = disconnect_reasons(&drain(&mut events));
        assert!(matches!(
            reasons[..],
            [DisconnectReason::SendException { .. }]
        ));
        // Unchoked peer gone, upload slot released.
        assert_eq!(harness.engine.torrent_snapshot(hash).unwrap().uploading_to, 0);
    }

    #[tokio::test]
    async fn test_remote_choke_cancels_picker_requests() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(16);
        let (picker, log) = RecordingPicker::new(3);
        harness
            .engine
            .add_torrent(torrent(hash).with_picker(Box::new(picker)))
            .unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;

        harness
            .engine
            .send_message(
                hash,
                address(1),
                PeerMessage::Request {
                    piece_index: PieceIndex::new(2),
                    offset: 0,
                    length: 16384,
                },
            )
            .unwrap();
        transport.push_message(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0b1010_0000]),
        });
        transport.push_message(&PeerMessage::Piece {
            piece_index: PieceIndex::new(2),
            offset: 0,
            data: Bytes::from(vec![7u8; 512]),
        });
        transport.push_message(&PeerMessage::Choke);
        harness.settle().await;

        let log = log.lock();
        assert_eq!(log.cancelled, vec![address(1)]);
        assert_eq!(log.blocks, vec![(address(1), PieceIndex::new(2), 0, 512)]);
        assert_eq!(log.bitfields[0].1[..3], [true, false, true]);
        drop(log);

        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        let connection = snapshot.connection(address(1)).unwrap();
        assert!(connection.peer_choking);
        assert_eq!(connection.our_requests_in_flight, 0);
        assert_eq!(connection.pieces_available, 2);
        assert_eq!(snapshot.bytes_downloaded, 512);
    }

    #[tokio::test]
    async fn test_malformed_bitfield_is_protocol_error() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(17);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;

        transport.push_message(&PeerMessage::Bitfield {
            bitfield: Bytes::from_static(&[0xff, 0xff]),
        });
        harness.settle().await;

        let reasons = disconnect_reasons(&drain(&mut events));
        assert!(matches!(
            reasons[..],
            [DisconnectReason::Protocol(ProtocolError::MalformedMessage { .. })]
        ));
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(18);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;

        transport.push_inbound(&(4 * 1024 * 1024u32).to_be_bytes());
        harness.settle().await;

        let reasons = disconnect_reasons(&drain(&mut events));
        assert!(matches!(
            reasons[..],
            [DisconnectReason::Protocol(ProtocolError::MessageTooLong { .. })]
        ));
    }

    #[tokio::test]
    async fn test_remote_close_is_receive_failure() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(19);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;

        transport.dispose();
        harness.settle().await;

        assert_eq!(
            disconnect_reasons(&drain(&mut events)),
            vec![DisconnectReason::ReceiveFailed]
        );
    }

    #[tokio::test]
    async fn test_ban_policy_drops_peer() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(20);
        harness.engine.add_torrent(torrent(hash)).unwrap();
        let banned = address(1);
        harness.engine.add_ban_policy(Box::new(
            move |_: &InfoHash, peer: &Peer, verdict: &mut BanVerdict| {
                verdict.ban |= peer.address == banned;
            },
        ));

        harness
            .engine
            .add_peers(hash, vec![Peer::new(address(1)), Peer::new(address(2))])
            .unwrap();
        harness.settle().await;

        assert_eq!(harness.connector.dial_order(), vec![address(2)]);
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert!(snapshot.peer(address(1)).is_none());
    }

    #[tokio::test]
    async fn test_remove_torrent_cancels_pending_and_closes_connections() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(21);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        let open = connect_peer(&mut harness, hash, address(1)).await;
        harness.connector.script(address(2), ConnectOutcome::Hang);
        harness
            .engine
            .add_peers(hash, vec![Peer::new(address(2))])
            .unwrap();
        harness.settle().await;
        assert_eq!(harness.engine.stats().half_open_connections, 1);

        harness.engine.remove_torrent(hash).unwrap();
        harness.settle().await;

        let stats = harness.engine.stats();
        assert_eq!(stats.half_open_connections, 0);
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.torrents, 0);
        assert!(open.is_disposed());
        assert!(harness.connector.transport(address(2)).unwrap().is_disposed());
        assert_eq!(
            disconnect_reasons(&drain(&mut events)),
            vec![DisconnectReason::TorrentRemoved]
        );
        assert!(matches!(
            harness.engine.remove_torrent(hash),
            Err(SwarmError::TorrentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_returns_peers() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(22);
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness.connector.script(address(1), ConnectOutcome::Hang);
        harness
            .engine
            .add_peers(hash, vec![Peer::new(address(1))])
            .unwrap();

        assert_eq!(harness.engine.cancel_pending(hash), 1);
        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.available.len(), 1);
        assert!(snapshot.connecting.is_empty());
        assert!(harness.connector.transport(address(1)).unwrap().is_disposed());
    }

    #[tokio::test]
    async fn test_connect_after_mode_change_returns_peer() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(23);
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness
            .engine
            .add_peers(hash, vec![Peer::new(address(1))])
            .unwrap();
        harness.engine.set_mode(hash, Box::new(StoppedMode)).unwrap();
        harness.settle().await;

        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.mode, "stopped");
        assert_eq!(snapshot.available.len(), 1);
        assert!(snapshot.connections.is_empty());
        assert!(harness.connector.transport(address(1)).unwrap().is_disposed());

        let incoming = Arc::new(MockTransport::incoming(address(5)));
        assert!(matches!(
            harness.engine.accept_incoming(hash, incoming.clone()),
            Err(SwarmError::ConnectionRejected { .. })
        ));
        assert!(incoming.is_disposed());
    }

    #[tokio::test]
    async fn test_bundle_notifies_each_message() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(24);
        let mut events = harness.engine.subscribe();
        harness.engine.add_torrent(torrent(hash)).unwrap();
        let transport = connect_peer(&mut harness, hash, address(1)).await;
        drain(&mut events);

        harness
            .engine
            .send_message(
                hash,
                address(1),
                PeerMessage::Bundle(vec![
                    PeerMessage::Interested,
                    PeerMessage::Have {
                        piece_index: PieceIndex::new(0),
                    },
                    PeerMessage::Unchoke,
                ]),
            )
            .unwrap();
        harness.settle().await;

        assert_eq!(transport.sent_frames().len(), 2);
        let outgoing: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SwarmEvent::MessageTransferred { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(outgoing.len(), 3);
        assert_eq!(outgoing[0], PeerMessage::Interested);

        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        let connection = snapshot.connection(address(1)).unwrap();
        assert!(connection.am_interested);
        assert!(!connection.am_choking);
        assert_eq!(snapshot.uploading_to, 1);
    }

    #[tokio::test]
    async fn test_messages_queued_before_handshake_are_sent_after_it() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(25);
        harness.engine.add_torrent(torrent(hash)).unwrap();
        harness
            .engine
            .add_peers(hash, vec![Peer::new(address(1))])
            .unwrap();
        harness.settle().await;

        harness
            .engine
            .send_message(hash, address(1), PeerMessage::Interested)
            .unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(address(1)).unwrap();
        assert_eq!(transport.sent_frames().len(), 1);

        transport.push_handshake(hash, remote_id(address(1)));
        harness.settle().await;
        assert_eq!(transport.sent_messages(), vec![PeerMessage::Interested]);
    }

    #[tokio::test]
    async fn test_peer_exchange_attached_for_extension_peers() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(26);
        let exchange = Arc::new(MockPeerExchange::default());
        harness
            .engine
            .add_torrent(torrent(hash).with_peer_exchange(exchange.clone()))
            .unwrap();
        harness.engine.mark_inactive(hash, address(1)).unwrap();

        harness
            .engine
            .add_peers(hash, vec![Peer::new(address(1))])
            .unwrap();
        harness.settle().await;
        let transport = harness.connector.transport(address(1)).unwrap();
        let mut reserved = [0u8; 8];
        reserved[5] = 0x10;
        transport.push_handshake_with_reserved(hash, remote_id(address(1)), reserved);
        harness.settle().await;
        assert_eq!(exchange.created.load(Ordering::SeqCst), 1);

        harness
            .engine
            .disconnect_peer(hash, address(1), "done".to_string())
            .unwrap();
        harness.settle().await;
        assert_eq!(exchange.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_torrent_connection_cap() {
        let mut harness = Harness::new(SwarmConfig::for_testing());
        let hash = info_hash(27);
        let mut settings = TorrentSettings::new(hash, PIECE_LENGTH, 8);
        settings.max_connections = 1;
        harness
            .engine
            .add_torrent(TorrentContext::new(settings))
            .unwrap();

        harness
            .engine
            .add_peers(hash, vec![Peer::new(address(1)), Peer::new(address(2))])
            .unwrap();
        harness.settle().await;

        let snapshot = harness.engine.torrent_snapshot(hash).unwrap();
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.available.len(), 1);
    }
}
