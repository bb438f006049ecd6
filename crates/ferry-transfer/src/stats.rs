/// Transfer statistics, shared between the transfer loop and whoever reports progress.
/// All fields are atomic for lock-free reads from another thread.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct TransferStats {
    /// File size from the metadata.
    pub total_bytes: AtomicU64,
    /// Chunk count from the metadata.
    pub total_chunks: AtomicU64,
    /// Bytes of distinct chunks so far.
    pub bytes_transferred: AtomicU64,
    /// Distinct chunks so far.
    pub chunks_transferred: AtomicU64,
    /// Chunks that arrived again after their first copy.
    pub duplicates: AtomicU64,
    /// Resend requests issued (receiver) or chunks resent (sender).
    pub retransmits: AtomicU64,
    /// Acknowledgments sent (receiver) or applied (sender).
    pub acks: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, bytes: u64, chunks: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.total_chunks.store(chunks, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, bytes: usize) {
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks_transferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmits(&self, n: u64) {
        self.retransmits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of the file delivered, 0.0 to 1.0. Empty files report 1.0.
    pub fn progress(&self) -> f64 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            let chunks = self.total_chunks.load(Ordering::Relaxed);
            let done = self.chunks_transferred.load(Ordering::Relaxed);
            return if chunks == done { 1.0 } else { 0.0 };
        }
        let done = self.bytes_transferred.load(Ordering::Relaxed);
        (done as f64 / total as f64).min(1.0)
    }
}
