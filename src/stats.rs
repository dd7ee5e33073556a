//! Allocator statistics counters.
//!
//! All counters use `Relaxed` ordering. They are observational only; the
//! list locks and sweep stamps provide the ordering the allocator relies on.
//!
//! # Usage
//!
//! ```ignore
//! let snap = sweepalloc::stats::snapshot();
//! println!("inline sweeps: {}", snap.inline_sweeps);
//! ```
//!
//! Individual counter loads are atomic but not consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        pub(crate) struct Stats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        impl Stats {
            const fn new() -> Self {
                Self { $($name: AtomicU64::new(0),)* }
            }
        }

        /// A point-in-time copy of every counter. Obtain one with [`snapshot()`].
        #[derive(Clone, Copy, Debug, Default)]
        pub struct Snapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        /// Load all counters and return a [`Snapshot`].
        pub fn snapshot() -> Snapshot {
            Snapshot { $($name: STATS.$name.load(Ordering::Relaxed),)* }
        }
    };
}

counters! {
    // ---- Central free lists ----
    /// Calls to `CentralFreeList::cache_span`.
    cache_span_calls,
    /// `cache_span` calls that had to grow the list.
    cache_span_grows,
    /// Spans swept by `cache_span` itself.
    inline_sweeps,
    /// Spans skipped because another thread was sweeping them.
    sweep_skips,
    /// Calls to `CentralFreeList::uncache_span`.
    uncache_calls,
    /// Calls to `CentralFreeList::free_span`.
    free_span_calls,
    /// Objects handed back by the sweeper.
    objects_reclaimed,
    /// Fully free spans returned to the page heap.
    spans_released,
    /// Spans swept by `sweep_one`.
    background_sweeps,

    // ---- Page heap / OS ----
    /// Calls to `platform::page_alloc`.
    os_alloc_count,
    /// Bytes requested from the OS via `platform::page_alloc`.
    os_alloc_bytes,
    /// Times `carve_span` produced a remainder.
    span_splits,
    /// Times two adjacent free spans were merged.
    span_coalesces,
}

pub(crate) static STATS: Stats = Stats::new();
