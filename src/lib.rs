#![no_std]

//! sweepalloc: per-size-class central free lists for a concurrent
//! mark-and-sweep heap.
//!
//! The allocator is split into tiers:
//! - Span caches (one per thread, lock-free fast path over a checked-out span)
//! - Central free lists (per-size-class lock, lazy sweeping on reuse)
//! - Page heap (span management, OS interface)
//!
//! A global [`SweepGen`] epoch stamps every span as needing sweep, being
//! swept, or swept. The central free list claims sweep ownership with a
//! compare-and-swap on that stamp and never sweeps while holding its lock.
//!
//! # Usage
//!
//! ```ignore
//! let ctx = HeapContext {
//!     sweepgen: &SWEEPGEN,
//!     pages: &PAGE_HEAP,
//!     layout: &PAGE_MAP,
//!     pacer: &NoPacing,
//!     sweeper: &MarkSweeper,
//! };
//! let central = CentralCache::new(ctx);
//! let mut cache = SpanCache::new();
//! let obj = unsafe { cache.alloc(&central, size_class::size_to_class(24)) };
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
mod macros;

pub mod central_free_list;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
pub mod span_cache;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sweep;
pub mod sweepgen;
pub mod sync;

/// Build-time configuration generated from `sweepalloc.toml`.
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
}

pub use central_free_list::{
    CentralCache, CentralFreeList, HeapContext, NoPacing, PageSource, SpanLayout, SweepPacer,
    Sweeper,
};
pub use config::{PAGE_SHIFT, PAGE_SIZE};
pub use page_heap::PageHeap;
pub use pagemap::PageMap;
pub use span_cache::SpanCache;
pub use sweep::MarkSweeper;
pub use sweepgen::{SweepGen, SweepState};
