//! Mock collaborators for driving the connection engine in tests.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use super::core::{Completion, ConnectionEngine};
use crate::config::SwarmConfig;
use crate::network::{
    Cipher, EncryptionError, EncryptionKind, EncryptionNegotiator, EncryptionTypes, Negotiated,
    PeerTransport, TransportConnector, TransportError,
};
use crate::protocol::{Direction, InfoHash, PeerHandshake, PeerId, PeerMessage, PieceIndex};
use crate::storage::{DiskError, DiskReader};
use crate::swarm::{PeerExchange, PeerExchangeFactory, PiecePicker};

/// How long `settle` waits for another completion before giving up.
const SETTLE_WINDOW: Duration = Duration::from_millis(50);

/// Scripted outcome of `MockTransport::connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    Fail,
    /// Never resolves until the transport is disposed.
    Hang,
}

/// In-memory transport with scripted inbound bytes and recorded sends.
pub struct MockTransport {
    address: SocketAddr,
    outcome: ConnectOutcome,
    reconnectable: bool,
    inbound: Mutex<VecDeque<u8>>,
    sent: Mutex<Vec<Vec<u8>>>,
    wakeup: Notify,
    closed: AtomicBool,
    disposals: AtomicUsize,
}

impl MockTransport {
    pub fn new(address: SocketAddr, outcome: ConnectOutcome) -> Self {
        Self {
            address,
            outcome,
            reconnectable: true,
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
            disposals: AtomicUsize::new(0),
        }
    }

    /// Transport as handed over by an accept loop.
    pub fn incoming(address: SocketAddr) -> Self {
        Self {
            reconnectable: false,
            ..Self::new(address, ConnectOutcome::Succeed)
        }
    }

    /// Makes `data` available to pending and future receives.
    pub fn push_inbound(&self, data: &[u8]) {
        self.inbound.lock().extend(data.iter().copied());
        self.wakeup.notify_one();
    }

    /// Queues the remote peer's handshake.
    pub fn push_handshake(&self, info_hash: InfoHash, peer_id: PeerId) {
        self.push_handshake_with_reserved(info_hash, peer_id, [0u8; 8]);
    }

    pub fn push_handshake_with_reserved(
        &self,
        info_hash: InfoHash,
        peer_id: PeerId,
        reserved: [u8; 8],
    ) {
        let mut handshake = PeerHandshake::new(info_hash, peer_id);
        handshake.reserved = reserved;
        let mut frame = vec![0u8; handshake.byte_length()];
        handshake.encode(&mut frame, 0).unwrap();
        self.push_inbound(&frame);
    }

    /// Queues one framed peer message.
    pub fn push_message(&self, message: &PeerMessage) {
        let mut frame = vec![0u8; message.byte_length()];
        message.encode(&mut frame, 0).unwrap();
        self.push_inbound(&frame);
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Sent frames after the handshake, decoded.
    pub fn sent_messages(&self) -> Vec<PeerMessage> {
        self.sent
            .lock()
            .iter()
            .skip(1)
            .map(|frame| crate::protocol::MessageCodec::decode(frame).unwrap())
            .collect()
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn connect(&self) -> Result<(), TransportError> {
        match self.outcome {
            ConnectOutcome::Succeed => Ok(()),
            ConnectOutcome::Fail => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            ConnectOutcome::Hang => {
                while !self.is_disposed() {
                    self.wakeup.notified().await;
                }
                Err(TransportError::Closed)
            }
        }
    }

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(data.to_vec());
        Ok(data.len())
    }

    async fn receive(&self, buffer: &mut [u8]) -> Result<(), TransportError> {
        loop {
            if self.is_disposed() {
                return Err(TransportError::Closed);
            }
            {
                let wanted = buffer.len();
                let mut inbound = self.inbound.lock();
                if inbound.len() >= wanted {
                    for (slot, byte) in buffer.iter_mut().zip(inbound.drain(..wanted)) {
                        *slot = byte;
                    }
                    return Ok(());
                }
            }
            self.wakeup.notified().await;
        }
    }

    fn can_reconnect(&self) -> bool {
        self.reconnectable
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }
}

/// Hands out `MockTransport`s and remembers them by address.
#[derive(Default)]
pub struct MockConnector {
    outcomes: Mutex<HashMap<SocketAddr, ConnectOutcome>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, address: SocketAddr, outcome: ConnectOutcome) {
        self.outcomes.lock().insert(address, outcome);
    }

    /// Most recent transport created for `address`.
    pub fn transport(&self, address: SocketAddr) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|t| t.address == address)
            .cloned()
    }

    pub fn created_for(&self, address: SocketAddr) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|t| t.address == address)
            .count()
    }

    /// Addresses in the order they were dialled.
    pub fn dial_order(&self) -> Vec<SocketAddr> {
        self.created.lock().iter().map(|t| t.address).collect()
    }
}

impl TransportConnector for MockConnector {
    fn create(&self, address: SocketAddr) -> Arc<dyn PeerTransport> {
        let outcome = self
            .outcomes
            .lock()
            .get(&address)
            .copied()
            .unwrap_or(ConnectOutcome::Succeed);
        let transport = Arc::new(MockTransport::new(address, outcome));
        self.created.lock().push(Arc::clone(&transport));
        transport
    }
}

/// No-op cipher reporting an arbitrary kind.
pub struct MockCipher(pub EncryptionKind);

impl Cipher for MockCipher {
    fn kind(&self) -> EncryptionKind {
        self.0
    }

    fn apply(&mut self, _data: &mut [u8]) {}
}

/// Negotiator returning a fixed outcome regardless of `allowed`.
pub struct MockNegotiator {
    kind: EncryptionKind,
    leftover: Bytes,
    failure: Option<EncryptionError>,
    offered: Mutex<Vec<EncryptionTypes>>,
}

impl MockNegotiator {
    pub fn plain_text() -> Self {
        Self::negotiating(EncryptionKind::PlainText)
    }

    pub fn negotiating(kind: EncryptionKind) -> Self {
        Self {
            kind,
            leftover: Bytes::new(),
            failure: None,
            offered: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(EncryptionError::NegotiationFailed {
                reason: reason.to_string(),
            }),
            ..Self::plain_text()
        }
    }

    pub fn with_leftover(leftover: &'static [u8]) -> Self {
        Self {
            leftover: Bytes::from_static(leftover),
            ..Self::plain_text()
        }
    }

    /// Encryption sets the engine offered, in call order.
    pub fn offered(&self) -> Vec<EncryptionTypes> {
        self.offered.lock().clone()
    }
}

#[async_trait]
impl EncryptionNegotiator for MockNegotiator {
    async fn negotiate(
        &self,
        _transport: Arc<dyn PeerTransport>,
        _info_hash: InfoHash,
        _direction: Direction,
        allowed: EncryptionTypes,
    ) -> Result<Negotiated, EncryptionError> {
        self.offered.lock().push(allowed);
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        Ok(Negotiated {
            encryptor: Box::new(MockCipher(self.kind)),
            decryptor: Box::new(MockCipher(self.kind)),
            leftover: self.leftover.clone(),
        })
    }
}

/// Disk whose byte at absolute offset `n` is `n % 251`.
#[derive(Default)]
pub struct MockDisk {
    fail: AtomicBool,
    reads: Mutex<Vec<(u64, usize)>>,
}

impl MockDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> Vec<(u64, usize)> {
        self.reads.lock().clone()
    }

    pub fn expected(offset: u64, length: usize) -> Vec<u8> {
        (offset..offset + length as u64)
            .map(|n| (n % 251) as u8)
            .collect()
    }
}

#[async_trait]
impl DiskReader for MockDisk {
    async fn read(&self, info_hash: InfoHash, offset: u64, buffer: &mut [u8]) -> Result<(), DiskError> {
        self.reads.lock().push((offset, buffer.len()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(DiskError::UnknownTorrent { info_hash });
        }
        buffer.copy_from_slice(&Self::expected(offset, buffer.len()));
        Ok(())
    }
}

/// What the engine told the picker.
#[derive(Debug, Default)]
pub struct PickerLog {
    pub cancelled: Vec<SocketAddr>,
    pub blocks: Vec<(SocketAddr, PieceIndex, u32, usize)>,
    pub haves: Vec<(SocketAddr, PieceIndex)>,
    pub bitfields: Vec<(SocketAddr, Vec<bool>)>,
}

/// Picker that records every call into a shared log.
pub struct RecordingPicker {
    log: Arc<Mutex<PickerLog>>,
    outstanding: usize,
}

impl RecordingPicker {
    pub fn new(outstanding: usize) -> (Self, Arc<Mutex<PickerLog>>) {
        let log = Arc::new(Mutex::new(PickerLog::default()));
        (
            Self {
                log: Arc::clone(&log),
                outstanding,
            },
            log,
        )
    }
}

impl PiecePicker for RecordingPicker {
    fn cancel_requests(&mut self, address: SocketAddr) -> usize {
        self.log.lock().cancelled.push(address);
        std::mem::take(&mut self.outstanding)
    }

    fn block_received(
        &mut self,
        address: SocketAddr,
        piece_index: PieceIndex,
        offset: u32,
        data: &Bytes,
    ) -> bool {
        self.log
            .lock()
            .blocks
            .push((address, piece_index, offset, data.len()));
        true
    }

    fn peer_has(&mut self, address: SocketAddr, piece_index: PieceIndex) {
        self.log.lock().haves.push((address, piece_index));
    }

    fn peer_bitfield(&mut self, address: SocketAddr, pieces: &[bool]) {
        self.log.lock().bitfields.push((address, pieces.to_vec()));
    }
}

/// Counts peer exchange sessions created and disposed.
#[derive(Default)]
pub struct MockPeerExchange {
    pub created: AtomicUsize,
    pub disposed: Arc<AtomicUsize>,
}

struct MockExchangeSession(Arc<AtomicUsize>);

impl PeerExchange for MockExchangeSession {
    fn dispose(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl PeerExchangeFactory for MockPeerExchange {
    fn create(&self, _info_hash: InfoHash, _address: SocketAddr) -> Box<dyn PeerExchange> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MockExchangeSession(Arc::clone(&self.disposed)))
    }
}

/// Engine driven directly, without the actor, so tests control when
/// completions are applied.
pub struct Harness {
    pub engine: ConnectionEngine,
    pub connector: Arc<MockConnector>,
    pub negotiator: Arc<MockNegotiator>,
    pub disk: Arc<MockDisk>,
    pub local_peer_id: PeerId,
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl Harness {
    pub fn new(config: SwarmConfig) -> Self {
        Self::with_negotiator(config, MockNegotiator::plain_text())
    }

    pub fn with_negotiator(config: SwarmConfig, negotiator: MockNegotiator) -> Self {
        let connector = Arc::new(MockConnector::new());
        let negotiator = Arc::new(negotiator);
        let disk = Arc::new(MockDisk::new());
        let local_peer_id = PeerId::new(*b"-RS0001-localpeer000");
        let (engine, completions) = ConnectionEngine::new(
            config,
            local_peer_id,
            Arc::clone(&connector) as Arc<dyn TransportConnector>,
            Arc::clone(&negotiator) as Arc<dyn EncryptionNegotiator>,
            Arc::clone(&disk) as Arc<dyn DiskReader>,
        );
        Self {
            engine,
            connector,
            negotiator,
            disk,
            local_peer_id,
            completions,
        }
    }

    /// Applies completions until none arrives within the settle window.
    pub async fn settle(&mut self) {
        while let Ok(Some(completion)) =
            tokio::time::timeout(SETTLE_WINDOW, self.completions.recv()).await
        {
            self.engine.handle_completion(completion);
        }
    }
}
