//! Fixed-slot reference-counted message store.
//!
//! Slot payloads live in one anonymous memory map carved into fixed-size
//! regions; per-slot bookkeeping is atomic so shares can be released from
//! any unit of execution. A slot is written only by its acquirer before
//! publication and is read-only while in flight. Every slot carries an
//! epoch that is bumped when the slot returns to the free list, so a
//! release against a reused slot is detected instead of corrupting the
//! new occupant.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::MmapMut;

use crate::classify::MessageKind;
use crate::metrics::Metrics;

/// Identifies one in-flight message: slot index plus the epoch observed at
/// acquire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub index: u32,
    pub epoch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is in flight; the caller should back off and retry.
    Full,
    /// Payload larger than the per-slot capacity; caller error.
    Oversized { len: usize, capacity: usize },
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Full => write!(f, "message pool exhausted"),
            PoolError::Oversized { len, capacity } => {
                write!(f, "payload of {len} bytes exceeds slot capacity {capacity}")
            }
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub total_slots: usize,
    pub in_use: usize,
    pub free: usize,
    pub max_slots: usize,
    pub acquired_total: u64,
    pub released_total: u64,
}

/// Epoch and reference count packed into one word so that release can
/// check the epoch and decrement atomically; a stale release can never
/// race a reacquire into freeing the new occupant.
struct SlotMeta {
    state: AtomicU64,
    len: AtomicU32,
    kind_code: AtomicU8,
    cog: AtomicU8,
    produced_at_us: AtomicU64,
    arrived_at_us: AtomicU64,
}

const fn pack(epoch: u32, refs: u32) -> u64 {
    ((epoch as u64) << 32) | refs as u64
}

const fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

impl SlotMeta {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(0, 0)),
            len: AtomicU32::new(0),
            kind_code: AtomicU8::new(0),
            cog: AtomicU8::new(0),
            produced_at_us: AtomicU64::new(0),
            arrived_at_us: AtomicU64::new(0),
        }
    }
}

struct FreeList {
    free: Vec<u32>,
    /// Slots handed out so far; grows lazily toward `max_slots`.
    allocated: usize,
}

pub struct MessagePool {
    slot_capacity: usize,
    max_slots: usize,
    growth_step: usize,
    _map: MmapMut,
    base: *mut u8,
    meta: Vec<SlotMeta>,
    free: Mutex<FreeList>,
    metrics: Arc<Metrics>,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

// SAFETY: slot payload regions are disjoint; a region is written only by
// the acquiring thread before `refs` is published with a release store and
// is read-only until the final release returns it to the free list.
unsafe impl Send for MessagePool {}
unsafe impl Sync for MessagePool {}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl MessagePool {
    pub fn new(
        initial_slots: usize,
        max_slots: usize,
        growth_step: usize,
        slot_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(max_slots > 0, "pool needs at least one slot");
        anyhow::ensure!(slot_capacity > 0, "slot capacity must be non-zero");
        let initial = initial_slots.clamp(1, max_slots);
        let mut map = MmapMut::map_anon(max_slots * slot_capacity)?;
        let base = map.as_mut_ptr();
        let meta = (0..max_slots).map(|_| SlotMeta::new()).collect();
        let free: Vec<u32> = (0..initial as u32).rev().collect();
        Ok(Self {
            slot_capacity,
            max_slots,
            growth_step: growth_step.max(1),
            _map: map,
            base,
            meta,
            free: Mutex::new(FreeList {
                free,
                allocated: initial,
            }),
            metrics,
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
        })
    }

    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// Copy `data` into a free slot. `initial_refs` is the share count at
    /// publication; the router restamps it at fan-out time.
    pub fn acquire(
        &self,
        data: &[u8],
        kind: MessageKind,
        produced_at_us: u64,
        initial_refs: u32,
    ) -> Result<PoolId, PoolError> {
        if data.len() > self.slot_capacity {
            self.metrics.inc_oversized_acquire();
            return Err(PoolError::Oversized {
                len: data.len(),
                capacity: self.slot_capacity,
            });
        }
        let index = {
            let mut list = self.free.lock().unwrap();
            match list.free.pop() {
                Some(idx) => idx,
                None if list.allocated < self.max_slots => {
                    let start = list.allocated;
                    let end = (start + self.growth_step).min(self.max_slots);
                    // Grow newest-last so the next pop returns `start`.
                    for idx in (start + 1..end).rev() {
                        list.free.push(idx as u32);
                    }
                    list.allocated = end;
                    start as u32
                }
                None => {
                    self.metrics.inc_pool_exhausted();
                    return Err(PoolError::Full);
                }
            }
        };
        let meta = &self.meta[index as usize];
        let (epoch, _) = unpack(meta.state.load(Ordering::Acquire));
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.add(index as usize * self.slot_capacity),
                data.len(),
            );
        }
        meta.len.store(data.len() as u32, Ordering::Relaxed);
        meta.kind_code.store(kind.code(), Ordering::Relaxed);
        meta.cog.store(kind.cog_index().unwrap_or(0xFF), Ordering::Relaxed);
        meta.produced_at_us.store(produced_at_us, Ordering::Relaxed);
        meta.arrived_at_us.store(now_micros(), Ordering::Relaxed);
        meta.state
            .store(pack(epoch, initial_refs.max(1)), Ordering::Release);
        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        Ok(PoolId { index, epoch })
    }

    fn meta_for(&self, id: PoolId) -> Option<&SlotMeta> {
        let meta = self.meta.get(id.index as usize)?;
        let (epoch, refs) = unpack(meta.state.load(Ordering::Acquire));
        if epoch != id.epoch || refs == 0 {
            return None;
        }
        Some(meta)
    }

    pub fn get(&self, id: PoolId) -> Option<SlotView<'_>> {
        let meta = self.meta_for(id)?;
        let len = meta.len.load(Ordering::Relaxed) as usize;
        let data = unsafe {
            std::slice::from_raw_parts(self.base.add(id.index as usize * self.slot_capacity), len)
        };
        let cog = meta.cog.load(Ordering::Relaxed);
        Some(SlotView {
            kind: MessageKind::from_parts(meta.kind_code.load(Ordering::Relaxed), cog),
            data,
            produced_at_us: meta.produced_at_us.load(Ordering::Relaxed),
            arrived_at_us: meta.arrived_at_us.load(Ordering::Relaxed),
        })
    }

    pub fn get_kind(&self, id: PoolId) -> Option<MessageKind> {
        let meta = self.meta_for(id)?;
        Some(MessageKind::from_parts(
            meta.kind_code.load(Ordering::Relaxed),
            meta.cog.load(Ordering::Relaxed),
        ))
    }

    /// Restamp the share count at fan-out time. The caller must hold the
    /// only outstanding share.
    pub fn set_refs(&self, id: PoolId, n: u32) -> bool {
        match self.meta_for(id) {
            Some(meta) => {
                meta.state
                    .store(pack(id.epoch, n.max(1)), Ordering::Release);
                true
            }
            None => {
                self.metrics.inc_stale_release();
                false
            }
        }
    }

    /// Drop one share. The last release returns the slot to the free list.
    /// Stale or double releases are counted and otherwise ignored.
    pub fn release(&self, id: PoolId) {
        let Some(meta) = self.meta.get(id.index as usize) else {
            self.metrics.inc_stale_release();
            return;
        };
        loop {
            let state = meta.state.load(Ordering::Acquire);
            let (epoch, refs) = unpack(state);
            if epoch != id.epoch || refs == 0 {
                self.metrics.inc_stale_release();
                return;
            }
            let next = if refs == 1 {
                // Final share: retire this epoch so late releases miss.
                pack(epoch.wrapping_add(1), 0)
            } else {
                pack(epoch, refs - 1)
            };
            if meta
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if refs == 1 {
                let mut list = self.free.lock().unwrap();
                list.free.push(id.index);
            }
            self.released_total.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let list = self.free.lock().unwrap();
        PoolStats {
            total_slots: list.allocated,
            in_use: list.allocated - list.free.len(),
            free: list.free.len(),
            max_slots: self.max_slots,
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of one in-flight slot.
pub struct SlotView<'a> {
    pub kind: MessageKind,
    pub data: &'a [u8],
    pub produced_at_us: u64,
    pub arrived_at_us: u64,
}

/// One share of an in-flight message. Dropping the handle releases the
/// share exactly once; the destination contract of the router holds by
/// construction.
pub struct MessageHandle {
    pool: Arc<MessagePool>,
    id: PoolId,
}

impl MessageHandle {
    pub fn new(pool: Arc<MessagePool>, id: PoolId) -> Self {
        Self { pool, id }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.pool.get_kind(self.id)
    }

    pub fn view(&self) -> Option<SlotView<'_>> {
        self.pool.get(self.id)
    }

    /// The message bytes, or an empty slice if the share went stale.
    pub fn data(&self) -> &[u8] {
        match self.pool.get(self.id) {
            Some(view) => view.data,
            None => &[],
        }
    }
}

impl Drop for MessageHandle {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(initial: usize, max: usize) -> MessagePool {
        MessagePool::new(initial, max, 2, 256, Arc::new(Metrics::new())).unwrap()
    }

    #[test]
    fn acquire_roundtrips_data_and_kind() {
        let p = pool(4, 4);
        let id = p
            .acquire(b"Cog3 hello\n", MessageKind::CogMessage { cog: 3 }, 7, 1)
            .unwrap();
        let view = p.get(id).unwrap();
        assert_eq!(view.data, b"Cog3 hello\n");
        assert_eq!(view.kind, MessageKind::CogMessage { cog: 3 });
        assert_eq!(view.produced_at_us, 7);
        assert_eq!(p.get_kind(id), Some(MessageKind::CogMessage { cog: 3 }));
        p.release(id);
        assert!(p.get(id).is_none());
    }

    #[test]
    fn slot_accounting_is_conserved() {
        let p = pool(4, 4);
        let mut ids = Vec::new();
        for i in 0..4u8 {
            ids.push(p.acquire(&[i], MessageKind::TerminalOutput, 0, 1).unwrap());
            let s = p.stats();
            assert_eq!(s.in_use + s.free, s.total_slots);
        }
        for id in ids {
            p.release(id);
            let s = p.stats();
            assert_eq!(s.in_use + s.free, s.total_slots);
        }
        assert_eq!(p.stats().in_use, 0);
    }

    #[test]
    fn exhaustion_surfaces_pool_full() {
        let p = pool(2, 2);
        let a = p.acquire(b"a", MessageKind::TerminalOutput, 0, 1).unwrap();
        let _b = p.acquire(b"b", MessageKind::TerminalOutput, 0, 1).unwrap();
        assert_eq!(
            p.acquire(b"c", MessageKind::TerminalOutput, 0, 1),
            Err(PoolError::Full)
        );
        p.release(a);
        assert!(p.acquire(b"c", MessageKind::TerminalOutput, 0, 1).is_ok());
    }

    #[test]
    fn grows_lazily_up_to_max() {
        let p = pool(1, 5);
        let mut ids = Vec::new();
        for i in 0..5u8 {
            ids.push(p.acquire(&[i], MessageKind::TerminalOutput, 0, 1).unwrap());
        }
        assert_eq!(p.stats().total_slots, 5);
        assert_eq!(
            p.acquire(b"x", MessageKind::TerminalOutput, 0, 1),
            Err(PoolError::Full)
        );
        for id in &ids {
            let view = p.get(*id).unwrap();
            assert_eq!(view.data.len(), 1);
        }
    }

    #[test]
    fn oversized_acquire_is_rejected() {
        let p = pool(2, 2);
        let big = vec![0u8; 257];
        assert!(matches!(
            p.acquire(&big, MessageKind::TerminalOutput, 0, 1),
            Err(PoolError::Oversized { .. })
        ));
        // The free list is untouched.
        assert_eq!(p.stats().in_use, 0);
    }

    #[test]
    fn stale_release_is_detected_by_epoch() {
        let metrics = Arc::new(Metrics::new());
        let p = MessagePool::new(1, 1, 1, 64, Arc::clone(&metrics)).unwrap();
        let first = p.acquire(b"one", MessageKind::TerminalOutput, 0, 1).unwrap();
        p.release(first);
        let second = p.acquire(b"two", MessageKind::TerminalOutput, 0, 1).unwrap();
        assert_eq!(first.index, second.index);
        assert_ne!(first.epoch, second.epoch);
        // Late release against the retired epoch must not free the new
        // occupant.
        p.release(first);
        assert_eq!(metrics.stale_releases(), 1);
        assert_eq!(p.get(second).unwrap().data, b"two");
        p.release(second);
    }

    #[test]
    fn fanout_refs_require_n_releases() {
        let p = Arc::new(pool(2, 2));
        let id = p
            .acquire(b"m", MessageKind::CogMessage { cog: 1 }, 0, 1)
            .unwrap();
        assert!(p.set_refs(id, 2));
        let h1 = MessageHandle::new(Arc::clone(&p), id);
        let h2 = MessageHandle::new(Arc::clone(&p), id);
        drop(h1);
        assert!(p.get(id).is_some(), "slot must survive the first release");
        drop(h2);
        assert!(p.get(id).is_none());
        assert_eq!(p.stats().in_use, 0);
    }
}
