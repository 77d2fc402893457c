//! Connection statistics shared by all connections of an io group.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
    /// Writes whose tail had to wait in the output buffer
    pub deferred_writes: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn write_deferred(&self) {
        self.deferred_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `other` into `self`; used to aggregate per-group counters.
    pub fn merge(&self, other: &ConnectionStats) {
        for (into, from) in [
            (&self.connections_accepted, &other.connections_accepted),
            (&self.active_connections, &other.active_connections),
            (&self.bytes_read, &other.bytes_read),
            (&self.bytes_written, &other.bytes_written),
            (&self.deferred_writes, &other.deferred_writes),
        ] {
            into.fetch_add(from.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}
