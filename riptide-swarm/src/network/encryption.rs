//! Encryption negotiation seam
//!
//! A negotiator inspects a freshly opened transport and returns the cipher
//! pair both sides agreed on. Only plaintext ships here; RC4/MSE
//! negotiators plug in through [`EncryptionNegotiator`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::PeerTransport;
use crate::protocol::{Direction, InfoHash};

/// Cipher negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionKind {
    /// No encryption
    PlainText,
    /// RC4 applied to the handshake only
    Rc4Header,
    /// RC4 applied to the whole stream
    Rc4Full,
}

impl EncryptionKind {
    fn flag(self) -> u8 {
        match self {
            EncryptionKind::PlainText => EncryptionTypes::PLAIN_TEXT.0,
            EncryptionKind::Rc4Header => EncryptionTypes::RC4_HEADER.0,
            EncryptionKind::Rc4Full => EncryptionTypes::RC4_FULL.0,
        }
    }
}

impl fmt::Display for EncryptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionKind::PlainText => write!(f, "PlainText"),
            EncryptionKind::Rc4Header => write!(f, "RC4Header"),
            EncryptionKind::Rc4Full => write!(f, "RC4Full"),
        }
    }
}

/// Set of encryption kinds a peer, torrent or engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionTypes(u8);

impl EncryptionTypes {
    pub const NONE: Self = Self(0);
    pub const PLAIN_TEXT: Self = Self(0b001);
    pub const RC4_HEADER: Self = Self(0b010);
    pub const RC4_FULL: Self = Self(0b100);
    pub const RC4_ALL: Self = Self(0b110);
    pub const ALL: Self = Self(0b111);

    /// Returns true if `kind` is in the set.
    pub fn contains(self, kind: EncryptionKind) -> bool {
        self.0 & kind.flag() != 0
    }

    /// Kinds present in both sets.
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Removes every kind in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Adds every kind in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for EncryptionTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<EncryptionKind> for EncryptionTypes {
    fn from(kind: EncryptionKind) -> Self {
        Self(kind.flag())
    }
}

impl FromStr for EncryptionTypes {
    type Err = String;

    /// Parses a comma separated list such as `plaintext,rc4full`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut types = Self::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_lowercase().as_str() {
                "plaintext" | "plain" => types.insert(Self::PLAIN_TEXT),
                "rc4header" => types.insert(Self::RC4_HEADER),
                "rc4full" => types.insert(Self::RC4_FULL),
                "rc4" => types.insert(Self::RC4_ALL),
                "all" => types.insert(Self::ALL),
                other => return Err(format!("unknown encryption type '{other}'")),
            }
        }
        if types.is_empty() {
            return Err("no encryption types given".to_string());
        }
        Ok(types)
    }
}

/// Symmetric stream cipher applied in place.
pub trait Cipher: Send + Sync {
    /// Kind this cipher implements.
    fn kind(&self) -> EncryptionKind;

    /// Encrypts or decrypts `data` in place, advancing the keystream.
    fn apply(&mut self, data: &mut [u8]);
}

/// Identity cipher.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextCipher;

impl Cipher for PlainTextCipher {
    fn kind(&self) -> EncryptionKind {
        EncryptionKind::PlainText
    }

    fn apply(&mut self, _data: &mut [u8]) {}
}

/// Result of a successful negotiation.
pub struct Negotiated {
    pub encryptor: Box<dyn Cipher>,
    pub decryptor: Box<dyn Cipher>,
    /// Bytes read past the negotiation that belong to the peer protocol
    pub leftover: Bytes,
}

impl Negotiated {
    /// Plaintext cipher pair with no leftover data.
    pub fn plain_text() -> Self {
        Self {
            encryptor: Box::new(PlainTextCipher),
            decryptor: Box::new(PlainTextCipher),
            leftover: Bytes::new(),
        }
    }

    /// Kind negotiated for outbound data.
    pub fn kind(&self) -> EncryptionKind {
        self.encryptor.kind()
    }
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated")
            .field("encryptor", &self.encryptor.kind())
            .field("decryptor", &self.decryptor.kind())
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

/// Errors produced while negotiating a cipher.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption negotiation failed: {reason}")]
    NegotiationFailed { reason: String },

    #[error("{count} unexpected bytes left over after encryption negotiation")]
    LeftoverBytes { count: usize },

    #[error("negotiated encryption {kind} is not allowed")]
    Disallowed { kind: EncryptionKind },
}

/// Negotiates the cipher used on a freshly opened transport.
#[async_trait]
pub trait EncryptionNegotiator: Send + Sync {
    /// Runs negotiation for `direction` restricted to `allowed`.
    ///
    /// # Errors
    /// - `EncryptionError::NegotiationFailed` - Remote rejected or handshake broke
    async fn negotiate(
        &self,
        transport: Arc<dyn PeerTransport>,
        info_hash: InfoHash,
        direction: Direction,
        allowed: EncryptionTypes,
    ) -> Result<Negotiated, EncryptionError>;
}

/// Negotiator that always selects plaintext.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextNegotiator;

#[async_trait]
impl EncryptionNegotiator for PlainTextNegotiator {
    async fn negotiate(
        &self,
        _transport: Arc<dyn PeerTransport>,
        _info_hash: InfoHash,
        _direction: Direction,
        allowed: EncryptionTypes,
    ) -> Result<Negotiated, EncryptionError> {
        if !allowed.contains(EncryptionKind::PlainText) {
            return Err(EncryptionError::NegotiationFailed {
                reason: "plaintext is not allowed and no RC4 negotiator is installed".to_string(),
            });
        }
        Ok(Negotiated::plain_text())
    }
}
