//! Transfer accounting for connections and torrents

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Point-in-time view of a [`TransferMonitor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TransferSnapshot {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub upload_rate_bytes_per_sec: f64,
    pub download_rate_bytes_per_sec: f64,
}

/// Exponential moving average for rate calculations
#[derive(Debug)]
struct RateEstimate {
    value: f64,
    pending: u64,
    window_start: Instant,
}

impl RateEstimate {
    const ALPHA: f64 = 0.3;

    fn new() -> Self {
        Self {
            value: 0.0,
            pending: 0,
            window_start: Instant::now(),
        }
    }

    fn record(&mut self, bytes: u64) {
        self.pending += bytes;
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            let sample = self.pending as f64 / elapsed;
            self.value = Self::ALPHA * sample + (1.0 - Self::ALPHA) * self.value;
            self.pending = 0;
            self.window_start = Instant::now();
        }
    }
}

/// Upload and download counters shared between the engine and I/O tasks.
#[derive(Debug)]
pub struct TransferMonitor {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    upload_rate: Mutex<RateEstimate>,
    download_rate: Mutex<RateEstimate>,
}

impl TransferMonitor {
    pub fn new() -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            upload_rate: Mutex::new(RateEstimate::new()),
            download_rate: Mutex::new(RateEstimate::new()),
        }
    }

    /// Records block payload bytes sent to a peer.
    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.upload_rate.lock().record(bytes);
    }

    /// Records block payload bytes received from a peer.
    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.download_rate.lock().record(bytes);
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            bytes_uploaded: self.bytes_uploaded(),
            bytes_downloaded: self.bytes_downloaded(),
            upload_rate_bytes_per_sec: self.upload_rate.lock().value,
            download_rate_bytes_per_sec: self.download_rate.lock().value,
        }
    }
}

impl Default for TransferMonitor {
    fn default() -> Self {
        Self::new()
    }
}
