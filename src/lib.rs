//! Drop-counting primitives for probe instrumentation on no-std targets.
//!
//! # Highlights
//! - Lock-free, fixed-capacity counter table keyed by (symbol address, task id).
//! - No allocation, no blocking, bounded-time lookups on the probe hot path.
//! - Atomic fetch-add reporting: concurrent reporters never lose an update.
//!
//! # Quick start
//! ```
//! use ph_counters::{CounterKey, CounterTable};
//!
//! let table = CounterTable::<64>::new();
//! let loader = table.loader();
//! loader.insert(CounterKey::new(0x1000, 42)).unwrap();
//!
//! // Probe hot path: count a failed emission for (symbol, task).
//! table.report(0x1000, 42);
//!
//! let collector = table.collector();
//! let stats = collector.drain(false, |key, dropped| {
//!     assert_eq!(key, CounterKey::new(0x1000, 42));
//!     assert_eq!(dropped, 1);
//! });
//! assert_eq!(stats.entries, 1);
//! ```
//!
//! # No-std
//! The crate is `#![no_std]` by default. Tests require `std`.
//!
//! # Safety and concurrency
//! The table has a two-phase lifecycle: the loader registers keys during a
//! quiescent setup phase, then reporters run concurrently against a key set
//! that never changes. Concurrent `insert` calls are safe for distinct keys;
//! inserting the same key from two contexts at once is unsupported.
//! `report`/`lookup`/`drain` may be called from any number of contexts at
//! any time.
//!
//! # Semantics
//! - `report` on a key the loader never registered is a silent no-op; the
//!   probe's failure path must not grow a second failure mode.
//! - `task_id` `0` ([`NO_TASK`]) attributes counts to the monitored
//!   subsystem itself rather than to a task.
//! - `insert` fails with [`CapacityExceeded`] once all `N` slots hold
//!   distinct keys; nothing on the report path can fail.
//! - `drain` takes per-entry snapshots (optionally swapping counts to zero);
//!   the pass is not a linearizable view across entries, and a count racing
//!   a resetting drain is attributed to exactly one pass.
#![no_std]

pub mod counter_table;

pub use counter_table::{
    CapacityExceeded, Collector, CounterKey, CounterTable, DrainStats, Entry, Loader, NO_TASK,
};

#[cfg(test)]
extern crate std;
