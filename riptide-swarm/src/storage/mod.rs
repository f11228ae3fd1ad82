//! Storage seams used when fulfilling peer requests.
//!
//! The engine never owns piece data. It asks a [`DiskReader`] for block bytes
//! at an absolute torrent offset and writes them straight into a pooled
//! send buffer.

pub mod buffer_pool;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
pub use buffer_pool::{BLOCK_SIZE, BufferPool};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::protocol::InfoHash;

/// Errors that occur while reading torrent data.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("no data registered for torrent {info_hash}")]
    UnknownTorrent { info_hash: InfoHash },

    #[error("read of {length} bytes at offset {offset} is out of range")]
    OutOfRange { offset: u64, length: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads block data for upload.
#[async_trait]
pub trait DiskReader: Send + Sync {
    /// Fills `buffer` with torrent data starting at absolute byte `offset`.
    ///
    /// # Errors
    /// - `DiskError::UnknownTorrent` - Nothing registered for `info_hash`
    /// - `DiskError::OutOfRange` - Read extends past the end of the data
    /// - `DiskError::Io` - Underlying read failed
    async fn read(
        &self,
        info_hash: InfoHash,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), DiskError>;
}

/// Disk reader for single-file torrents stored as one contiguous file.
#[derive(Debug, Default)]
pub struct FileDiskReader {
    files: RwLock<HashMap<InfoHash, PathBuf>>,
}

impl FileDiskReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `info_hash` with the file holding its content.
    pub fn register(&self, info_hash: InfoHash, path: impl Into<PathBuf>) {
        self.files.write().insert(info_hash, path.into());
    }

    pub fn unregister(&self, info_hash: &InfoHash) {
        self.files.write().remove(info_hash);
    }
}

#[async_trait]
impl DiskReader for FileDiskReader {
    async fn read(
        &self,
        info_hash: InfoHash,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), DiskError> {
        let path = self
            .files
            .read()
            .get(&info_hash)
            .cloned()
            .ok_or(DiskError::UnknownTorrent { info_hash })?;

        let mut file = tokio::fs::File::open(&path).await?;
        let file_len = file.metadata().await?.len();
        if offset + buffer.len() as u64 > file_len {
            return Err(DiskError::OutOfRange {
                offset,
                length: buffer.len(),
            });
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buffer).await?;
        Ok(())
    }
}
