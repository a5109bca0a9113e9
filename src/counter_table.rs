//! Lock-free fixed-capacity drop counter table for probe instrumentation.
//!
//! # Overview
//! - Maps a `(symbol address, task id)` key to a 64-bit drop counter.
//! - Capacity is fixed at `N` slots; all storage is inline, nothing allocates.
//! - Two-phase lifecycle: a loader registers keys while probes are quiescent,
//!   then any number of concurrent reporters bump counters without
//!   coordination. Keys are never removed or rehashed while reporters run.
//! - `report` is the probe-side hot path: bounded hash lookup plus one atomic
//!   fetch-add. A lookup miss is silently accepted; the caller is already on
//!   a failure path and must not grow a second one.
//! - The collector drains per-entry snapshots on its own schedule, optionally
//!   swapping each count back to zero in the same pass.
//!
//! # Memory ordering
//! The loader claims a slot with a CAS on its state tag, writes the key, then
//! publishes the tag with a Release store. Readers load the tag with Acquire
//! before touching the key, so a published slot always shows a fully written
//! key. Counter updates are Relaxed fetch-adds; the counter is a commutative
//! accumulator and needs no ordering beyond the publication of its slot.
//!
//! # Notes
//! - Open addressing with linear probing. States only ever move
//!   `EMPTY -> RESERVED -> OCCUPIED`, so the probe chain that led to a
//!   published key can never regain an `EMPTY` slot ahead of it; a lookup may
//!   therefore stop at the first `EMPTY` slot, and scans at most `N` slots.
//! - A slot observed as `RESERVED` belongs to an in-flight insert of some
//!   other key and is skipped; probes for a key are not live until its
//!   insert has returned.
//! - Worst-case lookup cost is `N` probes on a full table; with the usual
//!   loads (hundreds of probes against `N = 1024`) the expected cost is a
//!   handful of slots.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;

#[cfg(feature = "portable-atomic")]
use portable_atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
#[cfg(not(feature = "portable-atomic"))]
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

const EMPTY: u8 = 0;
const RESERVED: u8 = 1;
const OCCUPIED: u8 = 2;

/// Reserved task id for counts owned by the monitored subsystem itself
/// rather than by a distinct task.
pub const NO_TASK: u64 = 0;

/// Finalizer from splitmix64. Spreads clustered symbol addresses and task
/// ids across the slot array.
#[inline(always)]
const fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

/// Identity of a monitored point: the instrumented symbol plus the task the
/// counted failures are attributed to. The pair is the sole identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CounterKey {
    pub sym_addr: u64,
    pub task_id: u64,
}

impl CounterKey {
    #[inline]
    pub const fn new(sym_addr: u64, task_id: u64) -> Self {
        Self { sym_addr, task_id }
    }

    /// Key for counts with no distinct owning task (`task_id` = [`NO_TASK`]).
    #[inline]
    pub const fn unowned(sym_addr: u64) -> Self {
        Self::new(sym_addr, NO_TASK)
    }

    #[inline(always)]
    const fn hash(&self) -> u64 {
        mix64(self.sym_addr ^ mix64(self.task_id))
    }
}

/// Returned by [`Loader::insert`] once `N` distinct keys exist.
///
/// Setup-time only; nothing on the report path can fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CapacityExceeded;

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("counter table capacity exceeded")
    }
}

impl core::error::Error for CapacityExceeded {}

struct Slot {
    state: AtomicU8,
    key: UnsafeCell<MaybeUninit<CounterKey>>,
    dropped: AtomicU64,
}

fn slot_array<const N: usize>() -> [Slot; N] {
    core::array::from_fn(|_| Slot {
        state: AtomicU8::new(EMPTY),
        key: UnsafeCell::new(MaybeUninit::uninit()),
        dropped: AtomicU64::new(0),
    })
}

/// Fixed-capacity lock-free counter table.
/// Reporters never wait; a key the loader did not register is never counted.
pub struct CounterTable<const N: usize> {
    slots: [Slot; N],
    len: AtomicUsize,
}

unsafe impl<const N: usize> Sync for CounterTable<N> {}

impl<const N: usize> CounterTable<N> {
    pub fn new() -> Self {
        assert!(N > 0);
        Self {
            slots: slot_array::<N>(),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of slots, fixed at compile time.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of registered keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create the loader handle for the setup phase.
    #[inline]
    pub fn loader(&self) -> Loader<'_, N> {
        Loader { table: self }
    }

    /// Create the collector handle for the read side.
    #[inline]
    pub fn collector(&self) -> Collector<'_, N> {
        Collector { table: self }
    }

    /// Probe-side hot path: bump the drop count for `(sym_addr, task_id)` if
    /// the loader registered it, otherwise return without effect. Never
    /// blocks, never allocates, completes in at most `N` probes.
    #[inline(always)]
    pub fn report(&self, sym_addr: u64, task_id: u64) {
        if let Some(slot) = self.find(&CounterKey::new(sym_addr, task_id)) {
            slot.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Resolve a key to its record handle. Safe from any concurrent context;
    /// `None` means the key was never registered and is an expected outcome.
    #[inline]
    pub fn lookup(&self, key: CounterKey) -> Option<Entry<'_>> {
        self.find(&key).map(|slot| Entry { slot })
    }

    fn find(&self, key: &CounterKey) -> Option<&Slot> {
        let base = key.hash() as usize % N;
        for i in 0..N {
            let slot = &self.slots[(base + i) % N];
            match slot.state.load(Ordering::Acquire) {
                EMPTY => return None,
                OCCUPIED => {
                    let stored = unsafe { (*slot.key.get()).assume_init_read() };
                    if stored == *key {
                        return Some(slot);
                    }
                }
                // RESERVED: an insert in flight for some other key.
                _ => {}
            }
        }
        None
    }
}

/// Snapshot-read handle to one registered record.
#[derive(Copy, Clone)]
pub struct Entry<'a> {
    slot: &'a Slot,
}

impl<'a> Entry<'a> {
    #[inline]
    pub fn key(&self) -> CounterKey {
        // Entries are only built from published slots, so the key is
        // initialized and immutable.
        unsafe { (*self.slot.key.get()).assume_init_read() }
    }

    /// Point-in-time snapshot of the drop count.
    #[inline]
    pub fn dropped_events(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }
}

/// Setup-phase handle. Registers the key set before probes go live.
///
/// Concurrent `insert` calls for *distinct* keys are safe; inserting the
/// same key from two contexts at once is not supported. Inserts may race
/// freely against `report`/`lookup`: an unpublished slot is invisible to
/// readers.
pub struct Loader<'a, const N: usize> {
    table: &'a CounterTable<N>,
}

impl<'a, const N: usize> Loader<'a, N> {
    /// Register `key` and return its record handle. Re-inserting a key that
    /// is already present returns the existing record untouched.
    ///
    /// Fails with [`CapacityExceeded`] once `N` distinct keys exist; the
    /// table is left intact and the caller decides whether that is fatal to
    /// its own setup sequence.
    pub fn insert(&self, key: CounterKey) -> Result<Entry<'a>, CapacityExceeded> {
        let base = key.hash() as usize % N;
        for i in 0..N {
            let slot = &self.table.slots[(base + i) % N];
            match slot
                .state
                .compare_exchange(EMPTY, RESERVED, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    unsafe { (*slot.key.get()).as_mut_ptr().write(key) };
                    slot.state.store(OCCUPIED, Ordering::Release);
                    self.table.len.fetch_add(1, Ordering::Relaxed);
                    return Ok(Entry { slot });
                }
                Err(OCCUPIED) => {
                    let stored = unsafe { (*slot.key.get()).assume_init_read() };
                    if stored == key {
                        return Ok(Entry { slot });
                    }
                }
                // RESERVED: another loader is mid-insert on this slot.
                Err(_) => {}
            }
        }
        Err(CapacityExceeded)
    }
}

#[must_use]
#[derive(Copy, Clone, Debug)]
pub struct DrainStats {
    /// Entries visited (the number of registered keys).
    pub entries: usize,
    /// Sum of the drop counts visited in this pass.
    pub dropped_events: u64,
}

/// Read-side handle. Only the collector consumes or resets counts.
pub struct Collector<'a, const N: usize> {
    table: &'a CounterTable<N>,
}

impl<'a, const N: usize> Collector<'a, N> {
    /// Visit every registered entry with a point-in-time snapshot of its
    /// drop count. Visit order is unspecified; treat the sequence as a set.
    ///
    /// With `reset`, each visited count is atomically swapped to zero in the
    /// same pass, so an increment racing the drain lands either in this pass
    /// or in the next one, never both and never neither. The per-entry
    /// snapshots are not a linearizable view across the whole table.
    pub fn drain(&self, reset: bool, mut hook: impl FnMut(CounterKey, u64)) -> DrainStats {
        let mut entries = 0;
        let mut dropped_events = 0u64;

        for slot in &self.table.slots {
            if slot.state.load(Ordering::Acquire) != OCCUPIED {
                continue;
            }
            let key = unsafe { (*slot.key.get()).assume_init_read() };
            let count = if reset {
                slot.dropped.swap(0, Ordering::Relaxed)
            } else {
                slot.dropped.load(Ordering::Relaxed)
            };

            entries += 1;
            dropped_events += count;
            hook(key, count);
        }

        DrainStats {
            entries,
            dropped_events,
        }
    }

    /// Snapshot a single entry without resetting it.
    #[inline]
    pub fn get(&self, key: CounterKey) -> Option<u64> {
        self.table.lookup(key).map(|entry| entry.dropped_events())
    }
}
