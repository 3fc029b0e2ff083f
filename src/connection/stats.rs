//! Per-connection traffic statistics.
//!
//! Tracks message counts, drops, and wire versus uncompressed bandwidth.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe connection statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Messages written to the wire
    sent: AtomicU64,
    /// Messages read off the wire
    received: AtomicU64,
    /// Outbound messages dropped before reaching the wire
    sent_dropped: AtomicU64,
    /// Inbound messages discarded (bad packet or filtered)
    received_dropped: AtomicU64,
    /// Bytes written to the socket
    wire_bytes_out: AtomicU64,
    /// Bytes read from the socket
    wire_bytes_in: AtomicU64,
    /// Message bytes before deflate
    bytes_out: AtomicU64,
    /// Message bytes after inflate
    bytes_in: AtomicU64,
}

impl ConnectionStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message handed to the wire
    pub fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a decoded inbound message
    pub fn record_received(&self, bytes: usize) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record outbound drops
    pub fn record_sent_dropped(&self, n: usize) {
        if n > 0 {
            self.sent_dropped.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Record an inbound drop
    pub fn record_received_dropped(&self) {
        self.received_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record socket writes
    pub fn record_wire_out(&self, bytes: usize) {
        self.wire_bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record socket reads
    pub fn record_wire_in(&self, bytes: usize) {
        self.wire_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Messages sent
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Messages received
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Outbound messages dropped
    pub fn sent_dropped(&self) -> u64 {
        self.sent_dropped.load(Ordering::Relaxed)
    }

    /// Inbound messages dropped
    pub fn received_dropped(&self) -> u64 {
        self.received_dropped.load(Ordering::Relaxed)
    }

    /// Bytes written to the socket
    pub fn wire_bytes_out(&self) -> u64 {
        self.wire_bytes_out.load(Ordering::Relaxed)
    }

    /// Bytes read from the socket
    pub fn wire_bytes_in(&self) -> u64 {
        self.wire_bytes_in.load(Ordering::Relaxed)
    }

    /// Message bytes before deflate
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Message bytes after inflate
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Percentage of all traffic (both directions) that was dropped
    pub fn percent_dropped(&self) -> f64 {
        let dropped = self.sent_dropped() + self.received_dropped();
        let total = self.sent() + self.received() + dropped;
        if total == 0 {
            0.0
        } else {
            dropped as f64 * 100.0 / total as f64
        }
    }

    /// Outbound wire/uncompressed ratio (1.0 when nothing was sent)
    pub fn send_compression_ratio(&self) -> f64 {
        ratio(self.wire_bytes_out(), self.bytes_out())
    }

    /// Inbound wire/uncompressed ratio (1.0 when nothing was read)
    pub fn receive_compression_ratio(&self) -> f64 {
        ratio(self.wire_bytes_in(), self.bytes_in())
    }

    /// Get summary as JSON-compatible struct
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            sent: self.sent(),
            received: self.received(),
            sent_dropped: self.sent_dropped(),
            received_dropped: self.received_dropped(),
            percent_dropped: self.percent_dropped(),
            wire_bytes_out: self.wire_bytes_out(),
            wire_bytes_in: self.wire_bytes_in(),
            bytes_out: self.bytes_out(),
            bytes_in: self.bytes_in(),
            send_compression_ratio: self.send_compression_ratio(),
            receive_compression_ratio: self.receive_compression_ratio(),
        }
    }
}

fn ratio(wire: u64, raw: u64) -> f64 {
    if raw == 0 {
        1.0
    } else {
        wire as f64 / raw as f64
    }
}

/// Statistics summary for serialization.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSummary {
    /// Messages sent.
    pub sent: u64,
    /// Messages received.
    pub received: u64,
    /// Outbound messages dropped.
    pub sent_dropped: u64,
    /// Inbound messages dropped.
    pub received_dropped: u64,
    /// Share of dropped traffic in percent.
    pub percent_dropped: f64,
    /// Bytes written to the socket.
    pub wire_bytes_out: u64,
    /// Bytes read from the socket.
    pub wire_bytes_in: u64,
    /// Message bytes before deflate.
    pub bytes_out: u64,
    /// Message bytes after inflate.
    pub bytes_in: u64,
    /// Outbound wire/uncompressed ratio.
    pub send_compression_ratio: f64,
    /// Inbound wire/uncompressed ratio.
    pub receive_compression_ratio: f64,
}
