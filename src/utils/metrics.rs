//! Observability and Metrics
//!
//! Metrics collection for connection throughput, errors, read paths and
//! outbound latency.
//!
//! Uses atomic counters for thread-safe metrics collection. Per-connection
//! counters live in [`PeerMetrics`], owned by the reactor and never shared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Number of power-of-two latency buckets (1µs .. ~2^31µs)
const HISTOGRAM_BUCKETS: usize = 32;

/// Lock-free latency histogram with power-of-two microsecond buckets.
#[derive(Debug)]
pub struct LatencyHistogram {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            max_nanos: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one observation
    pub fn record(&self, value: Duration) {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.buckets[Self::bucket_for(nanos / 1_000)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn bucket_for(micros: u64) -> usize {
        if micros == 0 {
            0
        } else {
            ((64 - micros.leading_zeros()) as usize).min(HISTOGRAM_BUCKETS - 1)
        }
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_nanos.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            mean: Duration::from_nanos(if count == 0 { 0 } else { total / count }),
            max: Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed)),
            buckets: std::array::from_fn(|i| self.buckets[i].load(Ordering::Relaxed)),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a [`LatencyHistogram`]
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub mean: Duration,
    pub max: Duration,
    /// Bucket `i` counts observations below `2^i` microseconds
    pub buckets: [u64; HISTOGRAM_BUCKETS],
}

/// Global metrics collector for connection operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections created (inbound and outbound)
    pub connections_total: AtomicU64,
    /// Currently live connections
    pub connections_active: AtomicU64,
    /// Outbound connect failures
    pub connect_failures: AtomicU64,
    /// Total messages written
    pub messages_sent: AtomicU64,
    /// Total messages read
    pub messages_received: AtomicU64,
    /// Total bytes written
    pub bytes_sent: AtomicU64,
    /// Total bytes read
    pub bytes_received: AtomicU64,
    /// Messages assembled entirely from already-buffered input
    pub sync_reads: AtomicU64,
    /// Asynchronous header reads issued
    pub async_reads: AtomicU64,
    /// Read errors while connected
    pub read_errors: AtomicU64,
    /// Write errors while connected
    pub write_errors: AtomicU64,
    /// Framing and envelope violations
    pub protocol_errors: AtomicU64,
    /// Internal invariant violations (e.g. double shutdown)
    pub logic_errors: AtomicU64,
    /// Time from enqueue to write issue
    pub queue_delay: LatencyHistogram,
    /// Time from write issue to write completion
    pub write_delay: LatencyHistogram,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            sync_reads: AtomicU64::new(0),
            async_reads: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            logic_errors: AtomicU64::new(0),
            queue_delay: LatencyHistogram::new(),
            write_delay: LatencyHistogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection reaped
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message written
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record bytes read, counting a message when the read completed one
    pub fn bytes_read(&self, byte_count: u64, completed_message: bool) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
        if completed_message {
            self.messages_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sync_read(&self) {
        self.sync_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn async_read(&self) {
        self.async_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn logic_error(&self) {
        self.logic_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the queue and write latency of one completed outbound message
    pub fn write_timing(&self, queued: Duration, writing: Duration) {
        self.queue_delay.record(queued);
        self.write_delay.record(writing);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sync_reads: self.sync_reads.load(Ordering::Relaxed),
            async_reads: self.async_reads.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            logic_errors: self.logic_errors.load(Ordering::Relaxed),
            queue_delay: self.queue_delay.snapshot(),
            write_delay: self.write_delay.snapshot(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connect_failures = snapshot.connect_failures,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            sync_reads = snapshot.sync_reads,
            async_reads = snapshot.async_reads,
            read_errors = snapshot.read_errors,
            write_errors = snapshot.write_errors,
            protocol_errors = snapshot.protocol_errors,
            logic_errors = snapshot.logic_errors,
            queue_delay_mean_us = snapshot.queue_delay.mean.as_micros() as u64,
            write_delay_mean_us = snapshot.write_delay.mean.as_micros() as u64,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connect_failures: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sync_reads: u64,
    pub async_reads: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub protocol_errors: u64,
    pub logic_errors: u64,
    pub queue_delay: HistogramSnapshot,
    pub write_delay: HistogramSnapshot,
    pub uptime_seconds: u64,
}

/// Counters attributable to a single connection
#[derive(Debug, Clone, Default)]
pub struct PeerMetrics {
    pub messages_read: u64,
    pub messages_written: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub last_read: Option<Instant>,
    pub last_write: Option<Instant>,
}

impl PeerMetrics {
    pub(crate) fn on_read(&mut self, byte_count: usize, completed_message: bool, now: Instant) {
        self.bytes_read += byte_count as u64;
        if completed_message {
            self.messages_read += 1;
        }
        self.last_read = Some(now);
    }

    pub(crate) fn on_write(&mut self, byte_count: usize) {
        self.bytes_written += byte_count as u64;
        self.messages_written += 1;
    }

    /// Most recent read or write, if any
    pub fn last_activity(&self) -> Option<Instant> {
        match (self.last_read, self.last_write) {
            (Some(r), Some(w)) => Some(r.max(w)),
            (r, w) => r.or(w),
        }
    }
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<std::sync::Arc<Metrics>> =
    once_cell::sync::Lazy::new(|| std::sync::Arc::new(Metrics::new()));

/// Get the global metrics instance
pub fn global_metrics() -> std::sync::Arc<Metrics> {
    METRICS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_and_mean() {
        let hist = LatencyHistogram::new();
        hist.record(Duration::from_nanos(500));
        hist.record(Duration::from_micros(3));
        hist.record(Duration::from_micros(1000));

        let snap = hist.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.max, Duration::from_micros(1000));
        assert_eq!(snap.buckets[0], 1);
        assert_eq!(snap.buckets[2], 1); // 3µs -> [2, 4)
        assert_eq!(snap.buckets[10], 1); // 1000µs -> [512, 1024)
        assert!(snap.mean > Duration::from_micros(300));
    }

    #[test]
    fn test_empty_histogram_mean_is_zero() {
        assert_eq!(LatencyHistogram::new().snapshot().mean, Duration::ZERO);
    }

    #[test]
    fn test_read_counters() {
        let metrics = Metrics::new();
        metrics.bytes_read(4, false);
        metrics.bytes_read(10, true);
        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_received, 14);
        assert_eq!(snap.messages_received, 1);
    }

    #[test]
    fn test_peer_last_activity() {
        let mut peer = PeerMetrics::default();
        assert!(peer.last_activity().is_none());
        let now = Instant::now();
        peer.on_read(4, false, now);
        assert_eq!(peer.last_activity(), Some(now));
        peer.last_write = Some(now + Duration::from_millis(5));
        assert_eq!(peer.last_activity(), Some(now + Duration::from_millis(5)));
    }
}
