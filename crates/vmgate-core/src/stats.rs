use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Gateway-wide traffic counters. Increments are relaxed atomics; readers
/// take a point-in-time snapshot.
#[derive(Default)]
pub struct TrafficCounters {
    /// Bytes written to the VM link.
    bytes_sent: AtomicU64,
    /// Bytes read from the VM link.
    bytes_received: AtomicU64,
    /// Outbound frames discarded because the link queue was full.
    frames_dropped: AtomicU64,
    tcp_connections: AtomicU64,
    active_tcp: AtomicU64,
    udp_flows: AtomicU64,
    active_udp: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_dropped: u64,
    pub tcp_connections: u64,
    pub active_tcp: u64,
    pub udp_flows: u64,
    pub active_udp: u64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_opened(&self) {
        self.tcp_connections.fetch_add(1, Ordering::Relaxed);
        self.active_tcp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tcp_closed(&self) {
        self.active_tcp.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn udp_flow_opened(&self) {
        self.udp_flows.fetch_add(1, Ordering::Relaxed);
        self.active_udp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn udp_flow_closed(&self) {
        self.active_udp.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            tcp_connections: self.tcp_connections.load(Ordering::Relaxed),
            active_tcp: self.active_tcp.load(Ordering::Relaxed),
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
            active_udp: self.active_udp.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = TrafficCounters::new();
        counters.add_sent(100);
        counters.add_received(40);
        counters.add_dropped_frame();
        counters.tcp_opened();
        counters.tcp_opened();
        counters.tcp_closed();
        counters.udp_flow_opened();

        let snap = counters.snapshot();
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_received, 40);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.tcp_connections, 2);
        assert_eq!(snap.active_tcp, 1);
        assert_eq!(snap.udp_flows, 1);
        assert_eq!(snap.active_udp, 1);
    }
}
