use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Global counters for the daemon.
///
/// Updated from the packet path, so every field is atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    send_errors: AtomicU64,
    malformed_dropped: AtomicU64,
    unroutable_dropped: AtomicU64,
    stale_dropped: AtomicU64,
    node_alloc_failures: AtomicU64,
    outbound_queue_drops: AtomicU64,
    join_requests: AtomicU64,
    join_denials: AtomicU64,
    perimeter_hits: AtomicU64,
    fence_violations: AtomicU64,
    collaborator_errors: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
            unroutable_dropped: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
            node_alloc_failures: AtomicU64::new(0),
            outbound_queue_drops: AtomicU64::new(0),
            join_requests: AtomicU64::new(0),
            join_denials: AtomicU64::new(0),
            perimeter_hits: AtomicU64::new(0),
            fence_violations: AtomicU64::new(0),
            collaborator_errors: AtomicU64::new(0),
        }
    }

    counter!(inc_packets_received, packets_received, packets_received);
    counter!(inc_packets_sent, packets_sent, packets_sent);
    counter!(inc_send_errors, send_errors, send_errors);
    counter!(inc_malformed_dropped, malformed_dropped, malformed_dropped);
    counter!(inc_unroutable_dropped, unroutable_dropped, unroutable_dropped);
    counter!(inc_stale_dropped, stale_dropped, stale_dropped);
    counter!(inc_node_alloc_failures, node_alloc_failures, node_alloc_failures);
    counter!(inc_outbound_queue_drops, outbound_queue_drops, outbound_queue_drops);
    counter!(inc_join_requests, join_requests, join_requests);
    counter!(inc_join_denials, join_denials, join_denials);
    counter!(inc_perimeter_hits, perimeter_hits, perimeter_hits);
    counter!(inc_fence_violations, fence_violations, fence_violations);
    counter!(inc_collaborator_errors, collaborator_errors, collaborator_errors);

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert_eq!(m.packets_received(), 0);
        m.inc_packets_received();
        m.inc_packets_received();
        m.inc_stale_dropped();
        assert_eq!(m.packets_received(), 2);
        assert_eq!(m.stale_dropped(), 1);
        assert_eq!(m.fence_violations(), 0);
    }
}
