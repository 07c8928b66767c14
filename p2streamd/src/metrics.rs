use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global counters for the pipeline.
///
/// Counters are updated from the hot path so all fields are atomic.
pub struct Metrics {
    pub bytes_total: AtomicU64,
    pub messages_total: AtomicU64,
    pub subscribers: AtomicUsize,
    pub start_time: SystemTime,
    // Per-second tracking
    bytes_this_sec: AtomicU64,
    bytes_per_sec: AtomicU64,
    messages_this_sec: AtomicU64,
    messages_per_sec: AtomicU64,
    buffer_overflows: AtomicU64,
    dropped_bytes: AtomicU64,
    framing_errors: AtomicU64,
    pool_exhausted: AtomicU64,
    oversized_acquires: AtomicU64,
    stale_releases: AtomicU64,
    routing_errors: AtomicU64,
    request_timeouts: AtomicU64,
    raw_capture_bytes: AtomicU64,
    queue_depth: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            bytes_total: AtomicU64::new(0),
            messages_total: AtomicU64::new(0),
            subscribers: AtomicUsize::new(0),
            start_time: SystemTime::now(),
            bytes_this_sec: AtomicU64::new(0),
            bytes_per_sec: AtomicU64::new(0),
            messages_this_sec: AtomicU64::new(0),
            messages_per_sec: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            dropped_bytes: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            oversized_acquires: AtomicU64::new(0),
            stale_releases: AtomicU64::new(0),
            routing_errors: AtomicU64::new(0),
            request_timeouts: AtomicU64::new(0),
            raw_capture_bytes: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
        }
    }

    /// Record an accepted ingress chunk.
    pub fn record_bytes(&self, n: usize) {
        self.bytes_total.fetch_add(n as u64, Ordering::Relaxed);
        self.bytes_this_sec.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Record one classified message leaving the extractor.
    pub fn record_message(&self) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        self.messages_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per second to refresh the per-second rates.
    pub fn rollup(&self) {
        let bytes = self.bytes_this_sec.swap(0, Ordering::Relaxed);
        self.bytes_per_sec.store(bytes, Ordering::Relaxed);
        let msgs = self.messages_this_sec.swap(0, Ordering::Relaxed);
        self.messages_per_sec.store(msgs, Ordering::Relaxed);
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec.load(Ordering::Relaxed)
    }

    pub fn messages_per_sec(&self) -> u64 {
        self.messages_per_sec.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn inc_buffer_overflow(&self, dropped: usize) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
        self.dropped_bytes.fetch_add(dropped as u64, Ordering::Relaxed);
    }

    pub fn buffer_overflows(&self) -> u64 {
        self.buffer_overflows.load(Ordering::Relaxed)
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Relaxed)
    }

    pub fn inc_framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_errors(&self) -> u64 {
        self.framing_errors.load(Ordering::Relaxed)
    }

    pub fn inc_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pool_exhausted(&self) -> u64 {
        self.pool_exhausted.load(Ordering::Relaxed)
    }

    pub fn inc_oversized_acquire(&self) {
        self.oversized_acquires.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversized_acquires(&self) -> u64 {
        self.oversized_acquires.load(Ordering::Relaxed)
    }

    pub fn inc_stale_release(&self) {
        self.stale_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_releases(&self) -> u64 {
        self.stale_releases.load(Ordering::Relaxed)
    }

    pub fn inc_routing_error(&self) {
        self.routing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routing_errors(&self) -> u64 {
        self.routing_errors.load(Ordering::Relaxed)
    }

    pub fn inc_request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timeouts(&self) -> u64 {
        self.request_timeouts.load(Ordering::Relaxed)
    }

    pub fn add_raw_capture_bytes(&self, n: usize) {
        self.raw_capture_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn raw_capture_bytes(&self) -> u64 {
        self.raw_capture_bytes.load(Ordering::Relaxed)
    }

    pub fn inc_queue_depth(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_queue_depth(&self) {
        let prev = self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            self.queue_depth.store(0, Ordering::Relaxed);
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Sum of everything that went wrong; RED-level trigger input.
    pub fn total_drops(&self) -> u64 {
        self.buffer_overflows() + self.framing_errors() + self.pool_exhausted()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
