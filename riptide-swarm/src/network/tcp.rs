//! TCP implementation of the peer transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};

use super::{PeerTransport, TransportConnector, TransportError};

/// Peer transport over a tokio TCP stream.
///
/// Read and write halves are locked independently so one send and one
/// receive can be in flight at the same time. Disposal is signalled through
/// a watch channel that every pending operation races against.
pub struct TcpTransport {
    address: SocketAddr,
    connect_timeout: Duration,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    outgoing: bool,
}

impl TcpTransport {
    /// Creates an unconnected outbound transport.
    pub fn new(address: SocketAddr, connect_timeout: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            address,
            connect_timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed,
            outgoing: true,
        }
    }

    /// Wraps a stream accepted from a listener.
    ///
    /// # Errors
    /// - `TransportError::Io` - Peer address could not be read from the socket
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let address = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Self {
            address,
            connect_timeout: Duration::ZERO,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            outgoing: false,
        })
    }

    fn is_disposed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Closed);
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                address: self.address,
            })??;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        tracing::debug!("TCP connection established to {}", self.address);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        tokio::select! {
            result = writer.write_all(data) => {
                result?;
                Ok(data.len())
            }
            _ = closed.wait_for(|closed| *closed) => {
                guard.take();
                Err(TransportError::Closed)
            }
        }
    }

    async fn receive(&self, buffer: &mut [u8]) -> Result<(), TransportError> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        tokio::select! {
            result = reader.read_exact(buffer) => match result {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    Err(TransportError::Closed)
                }
                Err(e) => Err(e.into()),
            },
            _ = closed.wait_for(|closed| *closed) => {
                guard.take();
                Err(TransportError::Closed)
            }
        }
    }

    fn can_reconnect(&self) -> bool {
        self.outgoing
    }

    fn dispose(&self) {
        self.closed.send_replace(true);
        // Halves held by a pending operation are dropped when it observes the signal.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

/// Creates [`TcpTransport`]s for outbound connects.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector applying `connect_timeout` to every dial.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl TransportConnector for TcpConnector {
    fn create(&self, address: SocketAddr) -> Arc<dyn PeerTransport> {
        Arc::new(TcpTransport::new(address, self.connect_timeout))
    }
}
