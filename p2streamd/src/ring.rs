//! Lock-free SPSC byte ring between the USB producer and the extractor.
//!
//! The storage lives in an anonymous memory map with three atomic control
//! words (`head`, `tail`, `empty_flag`). One slot is always kept reserved so
//! that a full ring is distinguishable from an empty one:
//!
//! - the producer writes bytes at `tail` and publishes with a release store,
//!   then clears `empty_flag`;
//! - the consumer reads at `head` after an acquire load of `empty_flag` and
//!   publishes the advance with a release store, setting `empty_flag` once
//!   drained.
//!
//! Appends are all-or-nothing: a chunk that does not fit is rejected whole,
//! so the consumer never observes a torn message prefix.
//!
//! The consumer can save and restore its read position to back out of a
//! partial parse. While a position is saved, the producer measures free
//! space against that saved floor instead of `head`, so backed-out bytes are
//! never reclaimed underneath the parser.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::MmapMut;

#[derive(Debug, Clone, Copy)]
pub struct RingStats {
    pub capacity: usize,
    pub used: usize,
    pub available: usize,
    pub appended_total: u64,
    pub consumed_total: u64,
    pub overflow_count: u64,
}

impl RingStats {
    pub fn usage_percent(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f64 * 100.0 / self.capacity as f64
    }
}

struct RingShared {
    /// Keeps the mapping alive; all access goes through `base`.
    _map: MmapMut,
    base: *mut u8,
    capacity: u32,
    head: AtomicU32,
    tail: AtomicU32,
    empty_flag: AtomicU32,
    /// Free-space floor: equals `head` normally, or the oldest saved
    /// position while the consumer is mid-parse.
    guard: AtomicU32,
    appended_total: AtomicU64,
    consumed_total: AtomicU64,
    overflow_count: AtomicU64,
}

// SAFETY: the byte region is only written by the producer in [tail, guard)
// free space and only read by the consumer in [head, tail), and the index
// handoff happens through release/acquire pairs on `tail` and `head`.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    fn used_from(&self, head: u32, tail: u32) -> u32 {
        (tail.wrapping_add(self.capacity).wrapping_sub(head)) % self.capacity
    }

    fn stats(&self) -> RingStats {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let used = self.used_from(head, tail) as usize;
        RingStats {
            capacity: self.capacity as usize,
            used,
            available: self.capacity as usize - used - 1,
            appended_total: self.appended_total.load(Ordering::Relaxed),
            consumed_total: self.consumed_total.load(Ordering::Relaxed),
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
        }
    }
}

/// Create a ring of the given capacity and split it into its two handles.
pub fn ring(capacity: usize) -> anyhow::Result<(RingProducer, RingConsumer)> {
    anyhow::ensure!(capacity >= 2, "ring capacity must be at least 2 bytes");
    anyhow::ensure!(
        capacity <= u32::MAX as usize / 2,
        "ring capacity {capacity} too large"
    );
    let mut map = MmapMut::map_anon(capacity)?;
    let base = map.as_mut_ptr();
    let shared = Arc::new(RingShared {
        _map: map,
        base,
        capacity: capacity as u32,
        head: AtomicU32::new(0),
        tail: AtomicU32::new(0),
        empty_flag: AtomicU32::new(1),
        guard: AtomicU32::new(0),
        appended_total: AtomicU64::new(0),
        consumed_total: AtomicU64::new(0),
        overflow_count: AtomicU64::new(0),
    });
    Ok((
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer {
            shared,
            saved: Vec::new(),
        },
    ))
}

/// Producer half. Lives on the USB thread; `append` is bounded by one
/// memcpy and three atomic stores and never blocks.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Append a whole chunk, or nothing. Returns false (and counts an
    /// overflow) when the chunk does not fit.
    pub fn append(&self, bytes: &[u8]) -> bool {
        let n = bytes.len();
        if n == 0 {
            return true;
        }
        let shared = &*self.shared;
        let cap = shared.capacity;
        if n >= cap as usize {
            shared.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let floor = shared.guard.load(Ordering::Acquire);
        let tail = shared.tail.load(Ordering::Relaxed);
        let used = shared.used_from(floor, tail);
        let available = cap - used - 1;
        if n as u32 > available {
            shared.overflow_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let first = (n as u32).min(cap - tail) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), shared.base.add(tail as usize), first);
            if first < n {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), shared.base, n - first);
            }
        }
        let new_tail = (tail + n as u32) % cap;
        shared.tail.store(new_tail, Ordering::Release);
        shared.empty_flag.store(0, Ordering::Release);
        shared.appended_total.fetch_add(n as u64, Ordering::Relaxed);
        true
    }

    /// Free space as the producer sees it right now.
    pub fn available(&self) -> usize {
        let shared = &*self.shared;
        let floor = shared.guard.load(Ordering::Acquire);
        let tail = shared.tail.load(Ordering::Relaxed);
        (shared.capacity - shared.used_from(floor, tail) - 1) as usize
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }
}

/// Consumer half, owned by the extractor worker.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    saved: Vec<u32>,
}

impl RingConsumer {
    /// Pop one byte, or None when the ring is empty.
    pub fn next(&mut self) -> Option<u8> {
        let shared = &*self.shared;
        if shared.empty_flag.load(Ordering::Acquire) != 0 {
            // The flag can lag one append: the producer publishes tail
            // before clearing the flag, and our own drain-detection below
            // may race a concurrent append. Re-derive emptiness from the
            // indexes before trusting it.
            let head = shared.head.load(Ordering::Relaxed);
            if head == shared.tail.load(Ordering::Acquire) {
                return None;
            }
            shared.empty_flag.store(0, Ordering::Relaxed);
        }
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let byte = unsafe { *shared.base.add(head as usize) };
        let new_head = (head + 1) % shared.capacity;
        shared.head.store(new_head, Ordering::Release);
        if self.saved.is_empty() {
            shared.guard.store(new_head, Ordering::Release);
        }
        if new_head == shared.tail.load(Ordering::Acquire) {
            shared.empty_flag.store(1, Ordering::Release);
        }
        shared.consumed_total.fetch_add(1, Ordering::Relaxed);
        Some(byte)
    }

    /// Non-consuming read of `len` bytes starting `offset` past the read
    /// position. None when fewer than `offset + len` bytes are buffered.
    pub fn peek_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        let used = shared.used_from(head, tail) as usize;
        if offset + len > used {
            return None;
        }
        let cap = shared.capacity as usize;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let idx = (head as usize + offset + i) % cap;
            out.push(unsafe { *shared.base.add(idx) });
        }
        Some(out)
    }

    /// Remember the current read position for a later `restore_position`.
    pub fn save_position(&mut self) {
        let head = self.shared.head.load(Ordering::Relaxed);
        if self.saved.is_empty() {
            self.shared.guard.store(head, Ordering::Release);
        }
        self.saved.push(head);
    }

    /// Rewind to the most recently saved position, recomputing the empty
    /// flag. No-op if nothing is saved.
    pub fn restore_position(&mut self) {
        let Some(head) = self.saved.pop() else {
            return;
        };
        let shared = &*self.shared;
        shared.head.store(head, Ordering::Release);
        if self.saved.is_empty() {
            shared.guard.store(head, Ordering::Release);
        } else if let Some(&bottom) = self.saved.first() {
            shared.guard.store(bottom, Ordering::Release);
        }
        let tail = shared.tail.load(Ordering::Acquire);
        shared
            .empty_flag
            .store(u32::from(head == tail), Ordering::Release);
    }

    /// Drop the most recently saved position without rewinding; the bytes
    /// read since the save are now consumed for good.
    pub fn commit_position(&mut self) {
        self.saved.pop();
        if self.saved.is_empty() {
            let head = self.shared.head.load(Ordering::Relaxed);
            self.shared.guard.store(head, Ordering::Release);
        }
    }

    /// Discard up to `n` buffered bytes.
    pub fn consume(&mut self, n: usize) -> usize {
        let mut taken = 0;
        while taken < n && self.next().is_some() {
            taken += 1;
        }
        taken
    }

    /// Reset to empty. Only meaningful while the producer is quiescent.
    pub fn clear(&mut self) {
        let shared = &*self.shared;
        self.saved.clear();
        let tail = shared.tail.load(Ordering::Acquire);
        shared.head.store(tail, Ordering::Release);
        shared.guard.store(tail, Ordering::Release);
        shared.empty_flag.store(1, Ordering::Release);
    }

    pub fn used(&self) -> usize {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let tail = shared.tail.load(Ordering::Acquire);
        shared.used_from(head, tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_order() {
        let (tx, mut rx) = ring(64).unwrap();
        let data: Vec<u8> = (0..50).collect();
        assert!(tx.append(&data));
        let mut out = Vec::new();
        while let Some(b) = rx.next() {
            out.push(b);
        }
        assert_eq!(out, data);
        assert!(rx.is_empty());
    }

    #[test]
    fn append_is_all_or_nothing() {
        let (tx, mut rx) = ring(16).unwrap();
        // Capacity 16 leaves 15 usable bytes.
        assert!(tx.append(b"0123456789ABCDE"));
        assert_eq!(tx.available(), 0);
        let stats_before = tx.stats();
        assert!(!tx.append(b"G"));
        let stats_after = tx.stats();
        assert_eq!(stats_after.used, stats_before.used);
        assert_eq!(stats_after.overflow_count, 1);
        rx.consume(5);
        assert!(tx.append(b"G"));
    }

    #[test]
    fn wraparound_keeps_state_consistent() {
        let (tx, mut rx) = ring(16).unwrap();
        assert!(tx.append(&[1u8; 10]));
        rx.consume(10);
        // Next append spans the end of the region and wraps to index 0.
        let data: Vec<u8> = (0..10).collect();
        assert!(tx.append(&data));
        let mut out = Vec::new();
        while let Some(b) = rx.next() {
            out.push(b);
        }
        assert_eq!(out, data);
        assert!(rx.is_empty());
        // Refill to exactly the remaining space, then one byte more.
        let avail = tx.available();
        assert!(tx.append(&vec![7u8; avail]));
        assert!(!tx.append(&[8u8]));
        assert_eq!(rx.used(), avail);
    }

    #[test]
    fn peek_does_not_consume() {
        let (tx, mut rx) = ring(32).unwrap();
        tx.append(b"hello");
        assert_eq!(rx.peek_at(0, 5).unwrap(), b"hello");
        assert_eq!(rx.peek_at(1, 3).unwrap(), b"ell");
        assert!(rx.peek_at(0, 6).is_none());
        assert_eq!(rx.next(), Some(b'h'));
    }

    #[test]
    fn save_restore_replays_bytes() {
        let (tx, mut rx) = ring(32).unwrap();
        tx.append(b"abcdef");
        rx.save_position();
        let first = rx.next().unwrap();
        rx.next().unwrap();
        rx.next().unwrap();
        rx.restore_position();
        assert_eq!(rx.next(), Some(first));
    }

    #[test]
    fn saved_position_holds_producer_space() {
        let (tx, mut rx) = ring(16).unwrap();
        tx.append(&[1u8; 8]);
        rx.save_position();
        rx.consume(8);
        // The consumed bytes are still guarded by the saved position, so
        // the producer cannot reclaim them.
        assert_eq!(tx.available(), 7);
        assert!(!tx.append(&[2u8; 8]));
        rx.commit_position();
        assert_eq!(tx.available(), 15);
        assert!(tx.append(&[2u8; 8]));
    }

    #[test]
    fn clear_resets_to_empty() {
        let (tx, mut rx) = ring(32).unwrap();
        tx.append(b"stale");
        rx.clear();
        assert!(rx.is_empty());
        assert_eq!(rx.next(), None);
        tx.append(b"x");
        assert_eq!(rx.next(), Some(b'x'));
    }

    #[test]
    fn producer_consumer_threads_prefix_property() {
        let (tx, mut rx) = ring(1024).unwrap();
        let total: usize = 50_000;
        let producer = std::thread::spawn(move || {
            let mut sent = 0u8;
            let mut pushed = 0usize;
            while pushed < total {
                let chunk: Vec<u8> = (0..7).map(|i| sent.wrapping_add(i)).collect();
                if tx.append(&chunk) {
                    sent = sent.wrapping_add(7);
                    pushed += 7;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let mut expected = 0u8;
        let mut seen = 0usize;
        while seen < total {
            match rx.next() {
                Some(b) => {
                    assert_eq!(b, expected, "byte {seen} out of order");
                    expected = expected.wrapping_add(1);
                    seen += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();
    }
}
