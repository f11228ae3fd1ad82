//! Reusable send buffers

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

/// Standard block size requested by peers.
pub const BLOCK_SIZE: usize = 16384;

const DEFAULT_RETAINED: usize = 256;

/// Pool of `BytesMut` frames used to encode outgoing messages.
///
/// Buffers are handed out at the requested length and cleared on return.
/// Anything beyond the retention limit is simply dropped.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    max_retained: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED)
    }

    /// Pool keeping at most `max_retained` idle buffers.
    pub fn with_retention(max_retained: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_retained,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Takes a zero-filled buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> BytesMut {
        let mut buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(len.max(BLOCK_SIZE)));
        buffer.resize(len, 0);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    /// Returns a buffer to the pool.
    pub fn release(&self, mut buffer: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        buffer.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            free.push(buffer);
        }
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
