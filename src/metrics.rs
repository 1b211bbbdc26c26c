//! Counters for event stream activity

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counters updated by reconnection controllers
///
/// Clones share the same counters, so one instance can be handed to every
/// connection of an [`EventSourceClient`](crate::EventSourceClient).
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    pub chunks_received: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    pub messages_parsed: Arc<AtomicU64>,
    pub reconnections: Arc<AtomicU64>,
    pub errors: Arc<AtomicU64>,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            chunks_received: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            messages_parsed: Arc::new(AtomicU64::new(0)),
            reconnections: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a body chunk of `len` bytes
    pub fn record_chunk(&self, len: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_messages(&self, count: usize) {
        self.messages_parsed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a successful reconnection
    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an interruption (transport error, timeout or server close)
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn get_stats(&self) -> MetricsSnapshot {
        let chunks = self.chunks_received.load(Ordering::Relaxed);
        let bytes = self.bytes_received.load(Ordering::Relaxed);

        MetricsSnapshot {
            chunks_received: chunks,
            bytes_received: bytes,
            messages_parsed: self.messages_parsed.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            average_chunk_bytes: if chunks > 0 { bytes / chunks } else { 0 },
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.chunks_received.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.messages_parsed.store(0, Ordering::Relaxed);
        self.reconnections.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub messages_parsed: u64,
    pub reconnections: u64,
    pub errors: u64,
    pub average_chunk_bytes: u64,
}

impl MetricsSnapshot {
    /// Get a human-readable summary of the metrics
    pub fn summary(&self) -> String {
        format!(
            "Messages: {}, Chunks: {} ({} bytes, avg {}), Reconnections: {}, Errors: {}",
            self.messages_parsed,
            self.chunks_received,
            self.bytes_received,
            self.average_chunk_bytes,
            self.reconnections,
            self.errors
        )
    }
}
