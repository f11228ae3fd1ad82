//! Transport layer seams consumed by the connection engine
//!
//! The engine only talks to peers through [`PeerTransport`], so production
//! TCP sockets and scripted in-memory transports drive the same pipeline.

pub mod encryption;
pub mod monitor;
pub mod rate_limit;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
pub use encryption::{
    Cipher, EncryptionError, EncryptionKind, EncryptionNegotiator, EncryptionTypes, Negotiated,
    PlainTextCipher, PlainTextNegotiator,
};
pub use monitor::TransferMonitor;
pub use rate_limit::{RateLimiter, TokenBucket};
pub use tcp::{TcpConnector, TcpTransport};

/// Errors raised by peer transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("connect to {address} timed out")]
    ConnectTimeout { address: SocketAddr },

    #[error("transport is not connected")]
    NotConnected,
}

/// Byte stream to a single remote peer.
///
/// All methods take `&self` so a handle can be shared between the engine
/// and the single in-flight send and receive tasks. `dispose` must abort
/// any pending operation and make every later call fail.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Remote address this transport talks to.
    fn address(&self) -> SocketAddr;

    /// Opens the connection.
    ///
    /// # Errors
    /// - `TransportError::ConnectTimeout` - Remote did not answer in time
    /// - `TransportError::Io` - Connection refused or reset
    async fn connect(&self) -> Result<(), TransportError>;

    /// Writes all of `data`, returning the number of bytes written.
    ///
    /// # Errors
    /// - `TransportError::Closed` - Transport was disposed
    /// - `TransportError::Io` - Write failed
    async fn send(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Fills `buffer` completely from the stream.
    ///
    /// # Errors
    /// - `TransportError::Closed` - Remote closed or transport was disposed
    /// - `TransportError::Io` - Read failed
    async fn receive(&self, buffer: &mut [u8]) -> Result<(), TransportError>;

    /// Whether the engine may dial this address again after teardown.
    fn can_reconnect(&self) -> bool;

    /// Releases the underlying socket. Idempotent.
    fn dispose(&self);
}

/// Factory for outbound transports.
pub trait TransportConnector: Send + Sync {
    /// Creates an unconnected transport for `address`.
    fn create(&self, address: SocketAddr) -> Arc<dyn PeerTransport>;
}
